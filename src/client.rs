// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Session Client
//!
//! Dials the server, performs the initiating half of the handshake,
//! verifies the server's authenticate reply, answers heartbeats, and
//! reconnects with linear backoff up to a capped attempt count.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::protocol::{self, SessionMessage};
use crate::wallet::{self, Wallet};

/// Events emitted by the client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The transport is open and the authenticate message was sent.
    Connected,
    /// The server's authenticate reply verified; carries the server address.
    Authenticated(String),
    /// An application message from the server.
    Message(Value),
    /// A server heartbeat (already answered).
    Heartbeat { ts: i64 },
    /// The transport closed.
    Disconnected,
    /// A reconnection attempt was scheduled.
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// A connection-level failure.
    Error(String),
}

/// The server endpoint to dial.
#[derive(Debug, Clone)]
pub struct ServerTarget {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

#[derive(Debug, Clone)]
enum ClientCommand {
    Text(String),
    Close,
}

/// State shared between the client API and its connection maintainer task.
#[derive(Clone)]
struct ClientShared {
    config: ClientConfig,
    wallet: Wallet,
    target: Arc<RwLock<ServerTarget>>,
    server_address: Arc<RwLock<Option<String>>>,
    should_reconnect: Arc<AtomicBool>,
    reconnect_attempts: Arc<AtomicU32>,
    connected: Arc<AtomicBool>,
    authenticated: Arc<AtomicBool>,
    sender: Arc<RwLock<Option<mpsc::Sender<ClientCommand>>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl ClientShared {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn reset_transport_state(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.authenticated.store(false, Ordering::SeqCst);
        *self.sender.write().unwrap() = None;
    }
}

/// The wallet-authenticated session client.
pub struct SessionClient {
    shared: ClientShared,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionClient {
    /// Creates a client from config. The wallet is restored from
    /// `config.private_key_hex` when set; a malformed key falls back to a
    /// fresh ephemeral wallet with a warning.
    pub fn new(config: ClientConfig) -> Self {
        let wallet = match &config.private_key_hex {
            Some(key_hex) => Wallet::from_private_key_hex(key_hex).unwrap_or_else(|e| {
                warn!("Invalid configured wallet key ({}), generating ephemeral wallet", e);
                Wallet::generate()
            }),
            None => Wallet::generate(),
        };
        Self::with_wallet(config, wallet)
    }

    /// Creates a client with an explicit wallet.
    pub fn with_wallet(config: ClientConfig, wallet: Wallet) -> Self {
        let (events, _) = broadcast::channel(256);
        let target = ServerTarget {
            host: config.host.clone(),
            port: config.port,
            tls: config.tls,
        };
        SessionClient {
            shared: ClientShared {
                config,
                wallet,
                target: Arc::new(RwLock::new(target)),
                server_address: Arc::new(RwLock::new(None)),
                should_reconnect: Arc::new(AtomicBool::new(false)),
                reconnect_attempts: Arc::new(AtomicU32::new(0)),
                connected: Arc::new(AtomicBool::new(false)),
                authenticated: Arc::new(AtomicBool::new(false)),
                sender: Arc::new(RwLock::new(None)),
                events,
            },
            task: Mutex::new(None),
        }
    }

    /// The client wallet's address.
    pub fn address(&self) -> &str {
        self.shared.wallet.address()
    }

    /// The server's verified wallet address, once authenticated.
    pub fn server_address(&self) -> Option<String> {
        self.shared.server_address.read().unwrap().clone()
    }

    /// Whether the transport is open.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Whether the mutual handshake completed.
    pub fn is_authenticated(&self) -> bool {
        self.shared.authenticated.load(Ordering::SeqCst)
    }

    /// Subscribes to client events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    /// Starts the connection maintainer against the configured server.
    /// Completion is signaled through `Connected`/`Authenticated` events.
    /// A no-op when the maintainer is already running.
    pub fn connect(&self) {
        let target = self.shared.target.read().unwrap().clone();
        self.connect_with(target);
    }

    /// Like `connect`, but overrides the server endpoint first.
    pub fn connect_with(&self, target: ServerTarget) {
        *self.shared.target.write().unwrap() = target;
        self.shared.should_reconnect.store(true, Ordering::SeqCst);
        self.shared.reconnect_attempts.store(0, Ordering::SeqCst);

        let mut task = self.task.lock().unwrap();
        if let Some(handle) = task.as_ref() {
            if !handle.is_finished() {
                debug!("connect() ignored: connection maintainer already running");
                return;
            }
        }
        let shared = self.shared.clone();
        *task = Some(tokio::spawn(async move {
            maintain_connection(shared).await;
        }));
    }

    /// Closes the transport and stops reconnecting. Idempotent.
    pub fn disconnect(&self) {
        // Clear the flag before closing so the close handler cannot
        // schedule another attempt.
        self.shared.should_reconnect.store(false, Ordering::SeqCst);
        let sender = self.shared.sender.read().unwrap().clone();
        if let Some(tx) = sender {
            let _ = tx.try_send(ClientCommand::Close);
        }
    }

    /// Sends a JSON message iff the transport is open; silently dropped
    /// otherwise. Callers wanting guaranteed delivery should gate on the
    /// `Authenticated` event.
    pub async fn send(&self, message: &Value) {
        if !self.is_connected() {
            debug!("Dropping send: transport not open");
            return;
        }
        let sender = self.shared.sender.read().unwrap().clone();
        if let Some(tx) = sender {
            if tx
                .send(ClientCommand::Text(message.to_string()))
                .await
                .is_err()
            {
                debug!("Dropping send: transport closing");
            }
        }
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

/// Runs sessions until told to stop, backing off linearly between
/// attempts: the n-th retry waits `n * reconnect_delay_ms`.
async fn maintain_connection(shared: ClientShared) {
    loop {
        if !shared.should_reconnect.load(Ordering::SeqCst) {
            break;
        }

        if let Err(e) = try_session(&shared).await {
            shared.emit(ClientEvent::Error(e));
        }

        if !shared.should_reconnect.load(Ordering::SeqCst) {
            break;
        }

        let attempts = shared.reconnect_attempts.load(Ordering::SeqCst);
        if attempts >= shared.config.max_reconnect_attempts {
            warn!("Max reconnect attempts reached");
            shared.emit(ClientEvent::Error(
                "Max reconnect attempts reached".to_string(),
            ));
            break;
        }

        let attempt = attempts + 1;
        shared.reconnect_attempts.store(attempt, Ordering::SeqCst);
        let delay_ms = shared.config.reconnect_delay_ms * attempt as u64;
        info!("Reconnecting in {}ms (attempt {})", delay_ms, attempt);
        shared.emit(ClientEvent::Reconnecting { attempt, delay_ms });
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
}

/// One connection attempt: dial, authenticate, then relay until close.
async fn try_session(shared: &ClientShared) -> Result<(), String> {
    let target = shared.target.read().unwrap().clone();
    let scheme = if target.tls { "wss" } else { "ws" };
    let url = format!("{}://{}:{}", scheme, target.host, target.port);
    debug!("Connecting to {}", url);

    let (ws_stream, _) = connect_async(&url)
        .await
        .map_err(|e| format!("Connection failed: {}", e))?;
    let (mut write, mut read) = ws_stream.split();

    let (tx, mut rx) = mpsc::channel::<ClientCommand>(64);
    *shared.sender.write().unwrap() = Some(tx.clone());
    shared.connected.store(true, Ordering::SeqCst);
    shared.reconnect_attempts.store(0, Ordering::SeqCst);

    // The writer task owns the sink.
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                ClientCommand::Text(text) => {
                    if write.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
                ClientCommand::Close => break,
            }
        }
        let _ = write.send(Message::Close(None)).await;
    });

    // Authenticate immediately on open.
    let auth = protocol::create_authenticate(&shared.wallet);
    if tx
        .send(ClientCommand::Text(protocol::encode_authenticate(&auth)))
        .await
        .is_err()
    {
        shared.reset_transport_state();
        return Err("Transport closed during handshake".to_string());
    }
    shared.emit(ClientEvent::Connected);

    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => match protocol::decode_message(&text) {
                Ok(SessionMessage::Authenticate(server_auth)) => {
                    if wallet::verify(
                        &server_auth.timestamp.to_string(),
                        &server_auth.signature,
                        &server_auth.address,
                    ) {
                        info!("Authenticated with server {}", server_auth.address);
                        *shared.server_address.write().unwrap() =
                            Some(server_auth.address.clone());
                        shared.authenticated.store(true, Ordering::SeqCst);
                        shared.emit(ClientEvent::Authenticated(server_auth.address));
                    } else {
                        warn!("Invalid server signature, disconnecting");
                        shared.emit(ClientEvent::Error("Invalid server signature".to_string()));
                        shared.should_reconnect.store(false, Ordering::SeqCst);
                        let _ = tx.send(ClientCommand::Close).await;
                        break;
                    }
                }
                Ok(SessionMessage::Heartbeat(hb)) => {
                    // Answer symmetrically, then surface the event.
                    let _ = tx.send(ClientCommand::Text(protocol::create_heartbeat())).await;
                    shared.emit(ClientEvent::Heartbeat { ts: hb.ts });
                }
                Ok(SessionMessage::User(value)) => {
                    shared.emit(ClientEvent::Message(value));
                }
                Err(e) => {
                    debug!("Failed to parse server message: {}", e);
                    shared.emit(ClientEvent::Error(format!(
                        "Failed to parse server message: {}",
                        e
                    )));
                }
            },
            Ok(Message::Ping(_)) => {
                // The transport auto-pongs.
            }
            Ok(Message::Close(_)) => {
                debug!("Server closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                shared.emit(ClientEvent::Error(format!("Transport error: {}", e)));
                break;
            }
        }
    }

    shared.reset_transport_state();
    shared.emit(ClientEvent::Disconnected);
    Ok(())
}
