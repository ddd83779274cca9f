// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Authenticated Peer Registry
//!
//! Tracks authenticated peers by wallet address. Each entry holds the
//! peer's command channel (for sends, heartbeats, and eviction) plus its
//! activity bookkeeping. At most one peer exists per address; whether a
//! newer authentication replaces the existing entry is the caller's
//! policy, applied atomically under the registry lock.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::protocol::AuthPayload;

/// A command routed to a peer's writer task.
#[derive(Debug, Clone)]
pub enum PeerCommand {
    /// A JSON text frame to write out.
    Text(String),
    /// A control-frame ping.
    Ping,
    /// Close the transport, optionally preceded by an advisory status line.
    Close { advisory: Option<&'static str> },
}

/// An authenticated peer: stable per-connection id, wallet address,
/// command channel, and activity timestamps.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    /// Unique per connection, so successive sessions for the same address
    /// are distinguishable in logs and events.
    pub id: String,
    pub address: String,
    pub sender: mpsc::Sender<PeerCommand>,
    pub last_active: Instant,
    pub authenticated_at: Instant,
    /// The validated authenticate payload that promoted this connection.
    pub auth: AuthPayload,
}

impl PeerHandle {
    pub fn new(address: &str, sender: mpsc::Sender<PeerCommand>, auth: AuthPayload) -> Self {
        let now = Instant::now();
        PeerHandle {
            id: uuid::Uuid::new_v4().to_string(),
            address: address.to_string(),
            sender,
            last_active: now,
            authenticated_at: now,
            auth,
        }
    }
}

/// Read-only view of an authenticated peer, safe to hand to callers.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub id: String,
    pub address: String,
    pub last_active: Instant,
    pub authenticated_at: Instant,
    /// The authenticate payload this peer presented.
    pub auth: AuthPayload,
}

impl From<&PeerHandle> for PeerSnapshot {
    fn from(handle: &PeerHandle) -> Self {
        PeerSnapshot {
            id: handle.id.clone(),
            address: handle.address.clone(),
            last_active: handle.last_active,
            authenticated_at: handle.authenticated_at,
            auth: handle.auth.clone(),
        }
    }
}

/// Result of an atomic registration attempt.
#[derive(Debug)]
pub enum RegisterOutcome {
    /// The address was free.
    Inserted,
    /// The existing peer was displaced; the caller must close it.
    Replaced(PeerHandle),
    /// The address is in use and replacement is disabled.
    Rejected,
}

/// Thread-safe registry of authenticated peers, keyed by address.
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, PeerHandle>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        PeerRegistry {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a peer under its address. If the address is occupied the
    /// outcome depends on `replace_existing`: the old handle is displaced
    /// and returned, or the new registration is rejected.
    pub fn register(&self, handle: PeerHandle, replace_existing: bool) -> RegisterOutcome {
        let mut peers = self.peers.write().unwrap();
        if peers.contains_key(&handle.address) && !replace_existing {
            return RegisterOutcome::Rejected;
        }
        match peers.insert(handle.address.clone(), handle) {
            Some(displaced) => RegisterOutcome::Replaced(displaced),
            None => RegisterOutcome::Inserted,
        }
    }

    /// Unregisters a peer, but only if the stored entry still carries the
    /// given connection id. A replaced connection's cleanup must not evict
    /// its successor.
    pub fn unregister(&self, address: &str, id: &str) -> Option<PeerHandle> {
        let mut peers = self.peers.write().unwrap();
        if peers.get(address).map(|p| p.id.as_str()) == Some(id) {
            peers.remove(address)
        } else {
            None
        }
    }

    /// Marks activity on a peer. Returns false if the peer is gone or the
    /// entry now belongs to a different connection (this one was replaced).
    pub fn touch(&self, address: &str, id: &str) -> bool {
        let mut peers = self.peers.write().unwrap();
        match peers.get_mut(address) {
            Some(peer) if peer.id == id => {
                peer.last_active = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Looks up the peer for an address.
    pub fn get(&self, address: &str) -> Option<PeerHandle> {
        let peers = self.peers.read().unwrap();
        peers.get(address).cloned()
    }

    /// Snapshot of all authenticated peers.
    pub fn snapshot(&self) -> Vec<PeerHandle> {
        let peers = self.peers.read().unwrap();
        peers.values().cloned().collect()
    }

    /// Peers whose last activity is older than `bound`.
    pub fn idle(&self, bound: Duration) -> Vec<PeerHandle> {
        let peers = self.peers.read().unwrap();
        peers
            .values()
            .filter(|p| p.last_active.elapsed() > bound)
            .cloned()
            .collect()
    }

    /// Removes and returns every peer (server shutdown).
    pub fn drain(&self) -> Vec<PeerHandle> {
        let mut peers = self.peers.write().unwrap();
        peers.drain().map(|(_, handle)| handle).collect()
    }

    /// Queues a command for a peer. Returns true if the peer is present
    /// and the command was accepted.
    pub fn try_send(&self, address: &str, command: PeerCommand) -> bool {
        let peers = self.peers.read().unwrap();
        match peers.get(address) {
            Some(peer) => peer.sender.try_send(command).is_ok(),
            None => false,
        }
    }

    /// Returns the number of authenticated peers.
    pub fn count(&self) -> usize {
        let peers = self.peers.read().unwrap();
        peers.len()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_auth(address: &str) -> AuthPayload {
        AuthPayload {
            address: address.to_string(),
            timestamp: 1000,
            signature: "sig".to_string(),
        }
    }

    fn test_handle(address: &str) -> (PeerHandle, mpsc::Receiver<PeerCommand>) {
        let (tx, rx) = mpsc::channel(8);
        (PeerHandle::new(address, tx, test_auth(address)), rx)
    }

    #[test]
    fn test_register_and_get() {
        let registry = PeerRegistry::new();
        let (handle, _rx) = test_handle("addr-1");

        assert!(matches!(
            registry.register(handle, true),
            RegisterOutcome::Inserted
        ));
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get("addr-1").unwrap().address, "addr-1");
        assert!(registry.get("addr-2").is_none());
    }

    #[test]
    fn test_replace_existing_displaces_old_handle() {
        let registry = PeerRegistry::new();
        let (first, _rx1) = test_handle("addr-1");
        let first_id = first.id.clone();
        registry.register(first, true);

        let (second, _rx2) = test_handle("addr-1");
        match registry.register(second, true) {
            RegisterOutcome::Replaced(displaced) => assert_eq!(displaced.id, first_id),
            other => panic!("Expected Replaced, got {:?}", other),
        }
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_no_replace_rejects_second_registration() {
        let registry = PeerRegistry::new();
        let (first, _rx1) = test_handle("addr-1");
        let first_id = first.id.clone();
        registry.register(first, false);

        let (second, _rx2) = test_handle("addr-1");
        assert!(matches!(
            registry.register(second, false),
            RegisterOutcome::Rejected
        ));
        // The original entry is untouched
        assert_eq!(registry.get("addr-1").unwrap().id, first_id);
    }

    #[test]
    fn test_unregister_checks_connection_id() {
        let registry = PeerRegistry::new();
        let (first, _rx1) = test_handle("addr-1");
        let stale_id = first.id.clone();
        registry.register(first, true);

        // Replacement happens, then the old connection's cleanup runs
        let (second, _rx2) = test_handle("addr-1");
        let new_id = second.id.clone();
        registry.register(second, true);

        assert!(registry.unregister("addr-1", &stale_id).is_none());
        assert_eq!(registry.count(), 1);

        assert!(registry.unregister("addr-1", &new_id).is_some());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_touch_updates_last_active() {
        let registry = PeerRegistry::new();
        let (handle, _rx) = test_handle("addr-1");
        let id = handle.id.clone();
        registry.register(handle, true);

        let before = registry.get("addr-1").unwrap().last_active;
        std::thread::sleep(Duration::from_millis(5));
        assert!(registry.touch("addr-1", &id));
        let after = registry.get("addr-1").unwrap().last_active;
        assert!(after > before);

        assert!(!registry.touch("nonexistent", &id));
    }

    #[test]
    fn test_touch_rejects_replaced_connection() {
        let registry = PeerRegistry::new();
        let (first, _rx1) = test_handle("addr-1");
        let stale_id = first.id.clone();
        registry.register(first, true);

        let (second, _rx2) = test_handle("addr-1");
        let new_id = second.id.clone();
        registry.register(second, true);

        // The replaced connection must not refresh its successor
        assert!(!registry.touch("addr-1", &stale_id));
        assert!(registry.touch("addr-1", &new_id));
    }

    #[test]
    fn test_idle_detection() {
        let registry = PeerRegistry::new();
        let (handle, _rx) = test_handle("addr-1");
        registry.register(handle, true);

        assert!(registry.idle(Duration::from_secs(60)).is_empty());

        std::thread::sleep(Duration::from_millis(20));
        let idle = registry.idle(Duration::from_millis(5));
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].address, "addr-1");
    }

    #[tokio::test]
    async fn test_try_send_delivers_command() {
        let registry = PeerRegistry::new();
        let (handle, mut rx) = test_handle("addr-1");
        registry.register(handle, true);

        assert!(registry.try_send("addr-1", PeerCommand::Text("hello".to_string())));
        match rx.recv().await.unwrap() {
            PeerCommand::Text(text) => assert_eq!(text, "hello"),
            other => panic!("Expected Text, got {:?}", other),
        }

        assert!(!registry.try_send("offline", PeerCommand::Ping));
    }

    #[test]
    fn test_drain_empties_registry() {
        let registry = PeerRegistry::new();
        let (h1, _rx1) = test_handle("addr-1");
        let (h2, _rx2) = test_handle("addr-2");
        registry.register(h1, true);
        registry.register(h2, true);

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(registry.count(), 0);
    }
}
