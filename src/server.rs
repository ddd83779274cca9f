// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Session Server
//!
//! Accepts WebSocket connections and drives each through the connection
//! state machine: Raw → Upgrading → PendingAuth → Authenticated → Closed.
//! Every stage is bounded by `auth_timeout`; authenticated peers are kept
//! alive by heartbeats and evicted when idle. The first frame on a new
//! connection must be a valid `authenticate` message — anything else
//! terminates the connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::SessionError;
use crate::peer::{PeerCommand, PeerHandle, PeerRegistry, PeerSnapshot, RegisterOutcome};
use crate::protocol::{self, AuthPayload, SessionMessage};
use crate::tls;
use crate::wallet::{self, Wallet};

/// Events emitted by the server. Per-connection failures surface here and
/// never terminate the server itself.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A connection completed the mutual handshake.
    Authenticated { id: String, address: String },
    /// An application message from an authenticated peer.
    Message { address: String, message: Value },
    /// A heartbeat from an authenticated peer.
    Heartbeat { address: String, ts: i64 },
    /// An authenticated peer's connection ended. Always the last event
    /// for a given peer id.
    Disconnected { id: String, address: String },
    /// A per-connection error (auth failure, parse error, timeout, ...).
    Error(String),
    /// The server shut down.
    Closed,
}

/// A connection awaiting upgrade or authentication. The sweeper evicts
/// entries past `auth_timeout` by firing the cancel channel.
struct PendingEntry {
    since: Instant,
    cancel: oneshot::Sender<()>,
}

type PendingTable = Arc<RwLock<HashMap<String, PendingEntry>>>;

/// Shared state handed to each connection task.
#[derive(Clone)]
struct ConnDeps {
    config: Arc<ServerConfig>,
    wallet: Wallet,
    registry: Arc<PeerRegistry>,
    pending_sockets: PendingTable,
    pending_auth: PendingTable,
    events: broadcast::Sender<ServerEvent>,
    shutdown: broadcast::Sender<()>,
    closed: Arc<AtomicBool>,
}

impl ConnDeps {
    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }
}

/// The wallet-authenticated session server.
pub struct SessionServer {
    config: Arc<ServerConfig>,
    wallet: Wallet,
    registry: Arc<PeerRegistry>,
    pending_sockets: PendingTable,
    pending_auth: PendingTable,
    events: broadcast::Sender<ServerEvent>,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

impl SessionServer {
    /// Creates a server from config. The wallet is restored from
    /// `config.private_key_hex` when set; a malformed key falls back to a
    /// fresh ephemeral wallet with a warning.
    pub fn new(config: ServerConfig) -> Self {
        let wallet = match &config.private_key_hex {
            Some(key_hex) => Wallet::from_private_key_hex(key_hex).unwrap_or_else(|e| {
                warn!("Invalid configured wallet key ({}), generating ephemeral wallet", e);
                Wallet::generate()
            }),
            None => Wallet::generate(),
        };
        Self::with_wallet(config, wallet)
    }

    /// Creates a server with an explicit wallet.
    pub fn with_wallet(config: ServerConfig, wallet: Wallet) -> Self {
        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = broadcast::channel(1);
        SessionServer {
            config: Arc::new(config),
            wallet,
            registry: Arc::new(PeerRegistry::new()),
            pending_sockets: Arc::new(RwLock::new(HashMap::new())),
            pending_auth: Arc::new(RwLock::new(HashMap::new())),
            events,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The server wallet's address.
    pub fn address(&self) -> &str {
        self.wallet.address()
    }

    /// Subscribes to server events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Binds the listener and starts the accept loop and sweepers.
    /// Resolves with the bound address once the server is ready.
    pub async fn listen(&self) -> Result<SocketAddr, SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Protocol("server is closed".to_string()));
        }

        let acceptor = tls::load_server_tls(&self.config).map_err(SessionError::Tls)?;
        let listener =
            TcpListener::bind((self.config.bind_addr.as_str(), self.config.port)).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "Session server listening on {} ({})",
            local_addr,
            if acceptor.is_some() { "wss" } else { "ws" }
        );

        let deps = self.conn_deps();
        let mut shutdown_rx = self.shutdown.subscribe();
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, addr)) => {
                            debug!("New connection from {}", addr);
                            let deps = deps.clone();
                            let acceptor = acceptor.clone();
                            tokio::spawn(async move {
                                handle_socket(stream, addr, acceptor, deps).await;
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(accept_task);
        drop(tasks);

        self.spawn_sweepers();
        Ok(local_addr)
    }

    /// Stops the sweepers, closes the listener, and drops every live and
    /// pending connection. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Session server shutting down");

        let _ = self.shutdown.send(());
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }

        for (_, entry) in drain_pending(&self.pending_sockets) {
            let _ = entry.cancel.send(());
        }
        for (_, entry) in drain_pending(&self.pending_auth) {
            let _ = entry.cancel.send(());
        }

        for peer in self.registry.drain() {
            let _ = peer.sender.try_send(PeerCommand::Close { advisory: None });
            let _ = self.events.send(ServerEvent::Disconnected {
                id: peer.id,
                address: peer.address,
            });
        }

        let _ = self.events.send(ServerEvent::Closed);
    }

    /// Snapshot of all authenticated peers.
    pub fn clients(&self) -> Vec<PeerSnapshot> {
        self.registry
            .snapshot()
            .iter()
            .map(PeerSnapshot::from)
            .collect()
    }

    /// The authenticated peer for `address`, if any.
    pub fn client(&self, address: &str) -> Option<PeerSnapshot> {
        self.registry.get(address).map(|h| PeerSnapshot::from(&h))
    }

    /// Number of authenticated peers.
    pub fn client_count(&self) -> usize {
        self.registry.count()
    }

    /// Sends a JSON message to the named peer. A miss is reported through
    /// the error event as well as the returned error.
    pub async fn send(&self, address: &str, message: &Value) -> Result<(), SessionError> {
        match self.registry.get(address) {
            Some(peer) => peer
                .sender
                .send(PeerCommand::Text(message.to_string()))
                .await
                .map_err(|_| {
                    SessionError::Transport(format!("Connection for {} is closing", address))
                }),
            None => {
                let err = SessionError::PeerNotConnected(address.to_string());
                let _ = self.events.send(ServerEvent::Error(err.to_string()));
                Err(err)
            }
        }
    }

    /// Sends a JSON message to every authenticated peer. Best-effort:
    /// per-peer failures do not abort the broadcast.
    pub async fn broadcast(&self, message: &Value) {
        let frame = message.to_string();
        for peer in self.registry.snapshot() {
            if peer
                .sender
                .send(PeerCommand::Text(frame.clone()))
                .await
                .is_err()
            {
                debug!("Broadcast skipped closing connection for {}", peer.address);
            }
        }
    }

    fn conn_deps(&self) -> ConnDeps {
        ConnDeps {
            config: self.config.clone(),
            wallet: self.wallet.clone(),
            registry: self.registry.clone(),
            pending_sockets: self.pending_sockets.clone(),
            pending_auth: self.pending_auth.clone(),
            events: self.events.clone(),
            shutdown: self.shutdown.clone(),
            closed: self.closed.clone(),
        }
    }

    /// Spawns the periodic sweepers. A sweeper runs iff its interval is
    /// strictly positive.
    fn spawn_sweepers(&self) {
        let mut tasks = self.tasks.lock().unwrap();

        if self.config.heartbeat_interval_ms > 0 {
            let registry = self.registry.clone();
            let every = Duration::from_millis(self.config.heartbeat_interval_ms);
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(every);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tick.tick().await;
                    let frame = protocol::create_heartbeat();
                    for peer in registry.snapshot() {
                        // Both a control ping and an application heartbeat;
                        // either one is enough to evidence liveness.
                        let _ = peer.sender.try_send(PeerCommand::Ping);
                        let _ = peer.sender.try_send(PeerCommand::Text(frame.clone()));
                    }
                }
            }));
        }

        if self.config.auth_check_interval_ms > 0 {
            let pending_sockets = self.pending_sockets.clone();
            let pending_auth = self.pending_auth.clone();
            let bound = self.config.auth_timeout();
            let every = Duration::from_millis(self.config.auth_check_interval_ms);
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(every);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tick.tick().await;
                    sweep_pending(&pending_sockets, bound);
                    sweep_pending(&pending_auth, bound);
                }
            }));
        }

        if self.config.client_timeout_interval_ms > 0 {
            let registry = self.registry.clone();
            let events = self.events.clone();
            let bound = self.config.client_timeout();
            let every = Duration::from_millis(self.config.client_timeout_interval_ms);
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(every);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tick.tick().await;
                    for peer in registry.idle(bound) {
                        if registry.unregister(&peer.address, &peer.id).is_some() {
                            warn!("Client {} timed out after inactivity", peer.address);
                            let _ = events.send(ServerEvent::Error(format!(
                                "Client {} timed out",
                                peer.address
                            )));
                            let _ = peer.sender.try_send(PeerCommand::Close {
                                advisory: Some(protocol::ADVISORY_TIMEOUT),
                            });
                            let _ = events.send(ServerEvent::Disconnected {
                                id: peer.id,
                                address: peer.address,
                            });
                        }
                    }
                }
            }));
        }
    }
}

impl Drop for SessionServer {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

fn remove_pending(table: &PendingTable, key: &str) {
    table.write().unwrap().remove(key);
}

fn drain_pending(table: &PendingTable) -> Vec<(String, PendingEntry)> {
    table.write().unwrap().drain().collect()
}

/// Evicts every entry older than `bound`, firing its cancel channel so the
/// owning connection task closes the transport.
fn sweep_pending(table: &PendingTable, bound: Duration) {
    let expired: Vec<(String, PendingEntry)> = {
        let mut entries = table.write().unwrap();
        let keys: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.since.elapsed() >= bound)
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter()
            .filter_map(|k| entries.remove(&k).map(|e| (k, e)))
            .collect()
    };
    for (key, entry) in expired {
        debug!("Sweeping pending connection {}", key);
        let _ = entry.cancel.send(());
    }
}

/// RAW stage: an accepted TCP socket. Performs the TLS accept (when
/// configured) and hands off to the upgrade stage, all within the
/// `auth_timeout` bound.
async fn handle_socket(
    stream: TcpStream,
    addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    deps: ConnDeps,
) {
    let socket_key = addr.to_string();
    let started = Instant::now();
    let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
    deps.pending_sockets.write().unwrap().insert(
        socket_key.clone(),
        PendingEntry {
            since: started,
            cancel: cancel_tx,
        },
    );

    match acceptor {
        Some(acceptor) => {
            let tls_stream = tokio::select! {
                _ = &mut cancel_rx => {
                    debug!("Raw socket {} swept before TLS accept", addr);
                    remove_pending(&deps.pending_sockets, &socket_key);
                    return;
                }
                result = timeout(deps.config.auth_timeout(), acceptor.accept(stream)) => match result {
                    Ok(Ok(tls)) => tls,
                    Ok(Err(e)) => {
                        warn!("TLS accept failed for {}: {}", addr, e);
                        remove_pending(&deps.pending_sockets, &socket_key);
                        return;
                    }
                    Err(_) => {
                        warn!("TLS accept timed out for {}", addr);
                        remove_pending(&deps.pending_sockets, &socket_key);
                        deps.emit(ServerEvent::Error(format!("Upgrade timed out for {}", addr)));
                        return;
                    }
                }
            };
            upgrade_and_run(tls_stream, addr, socket_key, started, cancel_rx, deps).await;
        }
        None => upgrade_and_run(stream, addr, socket_key, started, cancel_rx, deps).await,
    }
}

/// UPGRADING stage: completes the WebSocket upgrade within what remains of
/// the `auth_timeout` window, then enters the pre-auth gate.
async fn upgrade_and_run<S>(
    stream: S,
    addr: SocketAddr,
    socket_key: String,
    started: Instant,
    mut cancel_rx: oneshot::Receiver<()>,
    deps: ConnDeps,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let remaining = deps.config.auth_timeout().saturating_sub(started.elapsed());
    let ws = tokio::select! {
        _ = &mut cancel_rx => {
            debug!("Raw socket {} swept during upgrade", addr);
            remove_pending(&deps.pending_sockets, &socket_key);
            return;
        }
        result = timeout(remaining, accept_async(stream)) => match result {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                // Non-websocket request, or the peer hung up mid-upgrade
                debug!("WebSocket upgrade failed for {}: {}", addr, e);
                remove_pending(&deps.pending_sockets, &socket_key);
                deps.emit(ServerEvent::Error(format!(
                    "WebSocket upgrade failed for {}: {}",
                    addr, e
                )));
                return;
            }
            Err(_) => {
                warn!("Upgrade timed out for {}", addr);
                remove_pending(&deps.pending_sockets, &socket_key);
                deps.emit(ServerEvent::Error(format!("Upgrade timed out for {}", addr)));
                return;
            }
        }
    };
    remove_pending(&deps.pending_sockets, &socket_key);
    run_session(ws, addr, deps).await;
}

/// Outcome of screening the first frame.
enum Gate {
    Accept(AuthPayload),
    Reject {
        advisory: &'static str,
        error: String,
    },
}

/// The pre-auth gate: parse, type check, whitelist, custom hook,
/// freshness, signature — in that order.
fn screen_authenticate(text: &str, deps: &ConnDeps) -> Gate {
    let message = match protocol::decode_message(text) {
        Ok(message) => message,
        Err(e) => {
            return Gate::Reject {
                advisory: protocol::ADVISORY_BAD_REQUEST,
                error: format!("Invalid handshake frame: {}", e),
            }
        }
    };

    let auth = match message {
        SessionMessage::Authenticate(auth) => auth,
        _ => {
            return Gate::Reject {
                advisory: protocol::ADVISORY_BAD_REQUEST,
                error: "Invalid message before authentication".to_string(),
            }
        }
    };

    if let Some(whitelist) = &deps.config.whitelist {
        if !whitelist.contains(&auth.address) {
            return Gate::Reject {
                advisory: protocol::ADVISORY_FORBIDDEN,
                error: "Address not in whitelist".to_string(),
            };
        }
    }

    if let Some(hook) = &deps.config.auth_hook {
        if !hook(&auth.address) {
            return Gate::Reject {
                advisory: protocol::ADVISORY_FORBIDDEN,
                error: "Authentication failed".to_string(),
            };
        }
    }

    if !protocol::is_fresh(auth.timestamp, protocol::now_millis(), deps.config.auth_timeout_ms) {
        return Gate::Reject {
            advisory: protocol::ADVISORY_UNAUTHORIZED,
            error: "Authentication timeout".to_string(),
        };
    }

    if !wallet::verify(&auth.timestamp.to_string(), &auth.signature, &auth.address) {
        return Gate::Reject {
            advisory: protocol::ADVISORY_UNAUTHORIZED,
            error: "Invalid signature".to_string(),
        };
    }

    Gate::Accept(auth)
}

/// Writes the advisory line, closes the transport, and reports the error.
async fn reject_pre_auth<S>(
    write: &mut SplitSink<WebSocketStream<S>, Message>,
    deps: &ConnDeps,
    conn_id: &str,
    addr: SocketAddr,
    advisory: &'static str,
    error: String,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    warn!("Rejecting {}: {}", addr, error);
    let _ = write.send(Message::Text(advisory.to_string())).await;
    let _ = write.send(Message::Close(None)).await;
    remove_pending(&deps.pending_auth, conn_id);
    deps.emit(ServerEvent::Error(error));
}

/// PENDING_AUTH onward: waits for the authenticate frame, screens it,
/// applies the address-collision policy, then runs the authenticated
/// read loop until the connection ends.
async fn run_session<S>(ws: WebSocketStream<S>, addr: SocketAddr, deps: ConnDeps)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut write, mut read) = ws.split();
    let conn_id = uuid::Uuid::new_v4().to_string();
    let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
    deps.pending_auth.write().unwrap().insert(
        conn_id.clone(),
        PendingEntry {
            since: Instant::now(),
            cancel: cancel_tx,
        },
    );

    // Wait for the first data frame; control frames don't count.
    let started = Instant::now();
    let text = loop {
        let remaining = deps.config.auth_timeout().saturating_sub(started.elapsed());
        tokio::select! {
            _ = &mut cancel_rx => {
                let _ = write.send(Message::Text(protocol::ADVISORY_TIMEOUT.to_string())).await;
                let _ = write.send(Message::Close(None)).await;
                deps.emit(ServerEvent::Error("Authentication timeout".to_string()));
                return;
            }
            result = timeout(remaining, read.next()) => match result {
                Ok(Some(Ok(Message::Text(text)))) => break text,
                Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => continue,
                Ok(Some(Ok(Message::Binary(_)))) => {
                    reject_pre_auth(
                        &mut write,
                        &deps,
                        &conn_id,
                        addr,
                        protocol::ADVISORY_BAD_REQUEST,
                        "Invalid message before authentication".to_string(),
                    )
                    .await;
                    return;
                }
                Ok(Some(Ok(_))) | Ok(None) => {
                    debug!("Connection {} closed before authentication", addr);
                    remove_pending(&deps.pending_auth, &conn_id);
                    return;
                }
                Ok(Some(Err(e))) => {
                    debug!("Transport error for {} before authentication: {}", addr, e);
                    remove_pending(&deps.pending_auth, &conn_id);
                    return;
                }
                Err(_) => {
                    warn!("Authentication timed out for {}", addr);
                    let _ = write.send(Message::Text(protocol::ADVISORY_TIMEOUT.to_string())).await;
                    let _ = write.send(Message::Close(None)).await;
                    remove_pending(&deps.pending_auth, &conn_id);
                    deps.emit(ServerEvent::Error("Authentication timeout".to_string()));
                    return;
                }
            }
        }
    };

    let auth = match screen_authenticate(&text, &deps) {
        Gate::Accept(auth) => auth,
        Gate::Reject { advisory, error } => {
            reject_pre_auth(&mut write, &deps, &conn_id, addr, advisory, error).await;
            return;
        }
    };

    // Server shutdown may have raced the gate; don't mutate tables after.
    if deps.closed.load(Ordering::SeqCst) {
        let _ = write.send(Message::Close(None)).await;
        remove_pending(&deps.pending_auth, &conn_id);
        return;
    }

    let (tx, mut rx) = mpsc::channel::<PeerCommand>(64);
    let handle = PeerHandle::new(&auth.address, tx.clone(), auth.clone());
    let peer_id = handle.id.clone();
    let address = handle.address.clone();

    match deps.registry.register(handle, deps.config.replace_existing) {
        RegisterOutcome::Rejected => {
            reject_pre_auth(
                &mut write,
                &deps,
                &conn_id,
                addr,
                protocol::ADVISORY_CONFLICT,
                "Client already exists".to_string(),
            )
            .await;
            return;
        }
        RegisterOutcome::Replaced(displaced) => {
            warn!(
                "Client {} replaced by new connection {}",
                address, peer_id
            );
            let _ = displaced.sender.try_send(PeerCommand::Close {
                advisory: Some(protocol::ADVISORY_CONFLICT),
            });
            deps.emit(ServerEvent::Error(format!("Client replaced {}", address)));
            deps.emit(ServerEvent::Disconnected {
                id: displaced.id,
                address: displaced.address,
            });
        }
        RegisterOutcome::Inserted => {}
    }
    remove_pending(&deps.pending_auth, &conn_id);

    // The writer task owns the sink from here on.
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                PeerCommand::Text(text) => {
                    if write.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
                PeerCommand::Ping => {
                    if write.send(Message::Ping(Vec::new())).await.is_err() {
                        return;
                    }
                }
                PeerCommand::Close { advisory } => {
                    if let Some(line) = advisory {
                        let _ = write.send(Message::Text(line.to_string())).await;
                    }
                    break;
                }
            }
        }
        let _ = write.send(Message::Close(None)).await;
    });

    // Complete the handshake: the server's own authenticate, freshly signed.
    let response = protocol::create_authenticate(&deps.wallet);
    if tx
        .send(PeerCommand::Text(protocol::encode_authenticate(&response)))
        .await
        .is_err()
    {
        deps.registry.unregister(&address, &peer_id);
        return;
    }

    info!("Client {} authenticated (connection {})", address, peer_id);
    deps.emit(ServerEvent::Authenticated {
        id: peer_id.clone(),
        address: address.clone(),
    });

    let mut shutdown_rx = deps.shutdown.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    // A touch miss means this connection was evicted or replaced.
                    if !deps.registry.touch(&address, &peer_id) {
                        break;
                    }
                    match protocol::decode_message(&text) {
                        Ok(SessionMessage::Authenticate(_)) => {
                            warn!("Unexpected authenticate from {} on authenticated channel", address);
                            deps.emit(ServerEvent::Error(format!(
                                "Unexpected authenticate message from {}",
                                address
                            )));
                            let _ = tx.try_send(PeerCommand::Close { advisory: None });
                            break;
                        }
                        Ok(SessionMessage::Heartbeat(hb)) => {
                            deps.emit(ServerEvent::Heartbeat {
                                address: address.clone(),
                                ts: hb.ts,
                            });
                        }
                        Ok(SessionMessage::User(value)) => {
                            deps.emit(ServerEvent::Message {
                                address: address.clone(),
                                message: value,
                            });
                        }
                        Err(e) => {
                            debug!("Failed to parse message from {}: {}", address, e);
                            deps.emit(ServerEvent::Error(format!(
                                "Failed to parse message from {}: {}",
                                address, e
                            )));
                        }
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    if !deps.registry.touch(&address, &peer_id) {
                        break;
                    }
                }
                Some(Ok(Message::Ping(_))) => {
                    // The transport auto-pongs on the next write.
                }
                Some(Ok(Message::Binary(_))) => {
                    debug!("Ignoring binary frame from {}", address);
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Client {} disconnected", address);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    deps.emit(ServerEvent::Error(format!(
                        "Transport error for {}: {}",
                        address, e
                    )));
                    break;
                }
            }
        }
    }

    // Whoever removes the registry entry emits Disconnected; a replaced or
    // evicted connection finds its entry already gone.
    if let Some(handle) = deps.registry.unregister(&address, &peer_id) {
        let _ = handle.sender.try_send(PeerCommand::Close { advisory: None });
        deps.emit(ServerEvent::Disconnected {
            id: peer_id,
            address: address.clone(),
        });
    }
    debug!("Connection for {} cleaned up", address);
}
