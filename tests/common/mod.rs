//! Common test utilities for session integration tests.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use signet_link::config::ServerConfig;
use signet_link::protocol;
use signet_link::server::SessionServer;
use signet_link::wallet::Wallet;

pub type ClientWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Deterministic test wallet derived from a seed byte.
#[allow(dead_code)]
pub fn test_wallet(seed: u8) -> Wallet {
    let bytes: Vec<u8> = (0..32).map(|i| seed.wrapping_add(i)).collect();
    Wallet::from_private_key_hex(&hex::encode(bytes)).expect("test seed must be valid")
}

/// Server config suitable for tests: loopback, ephemeral port.
#[allow(dead_code)]
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.bind_addr = "127.0.0.1".to_string();
    config.port = 0;
    config
}

/// Starts a server and returns it with its `ws://` URL. The server must be
/// kept alive for the duration of the test.
#[allow(dead_code)]
pub async fn start_server(config: ServerConfig) -> (SessionServer, String) {
    let server = SessionServer::new(config);
    let addr = server.listen().await.expect("listen failed");
    let url = format!("ws://127.0.0.1:{}", addr.port());
    (server, url)
}

/// Builds a correctly signed authenticate frame for `wallet` at `timestamp`.
#[allow(dead_code)]
pub fn make_authenticate(wallet: &Wallet, timestamp: i64) -> Value {
    json!({
        "type": "authenticate",
        "address": wallet.address(),
        "timestamp": timestamp,
        "signature": wallet.sign(&timestamp.to_string()),
    })
}

/// Builds a fresh, correctly signed authenticate frame.
#[allow(dead_code)]
pub fn make_fresh_authenticate(wallet: &Wallet) -> Value {
    make_authenticate(wallet, protocol::now_millis())
}

/// Sends one JSON value as a text frame.
#[allow(dead_code)]
pub async fn send_json(ws: &mut ClientWs, value: &Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Receives the next text frame, raw.
#[allow(dead_code)]
pub async fn recv_text(ws: &mut ClientWs) -> String {
    loop {
        let msg = timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("Timeout waiting for message")
            .expect("Stream ended")
            .expect("WebSocket error");
        match msg {
            Message::Text(text) => return text,
            // Skip control frames
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Expected Text message, got {:?}", other),
        }
    }
}

/// Receives the next text frame, decoded as JSON.
#[allow(dead_code)]
pub async fn recv_json(ws: &mut ClientWs) -> Value {
    let text = recv_text(ws).await;
    serde_json::from_str(&text).expect("Expected JSON text frame")
}

/// Try to receive a JSON text frame with a short timeout. Returns None if
/// nothing arrives.
#[allow(dead_code)]
pub async fn try_recv_json(ws: &mut ClientWs) -> Option<Value> {
    loop {
        match timeout(Duration::from_millis(300), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return Some(serde_json::from_str(&text).expect("Expected JSON text frame"))
            }
            Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => continue,
            _ => return None,
        }
    }
}

/// Asserts that the stream ends (close frame, reset, or silence).
#[allow(dead_code)]
pub async fn expect_disconnect(ws: &mut ClientWs) {
    loop {
        match timeout(Duration::from_secs(2), ws.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Err(_) | Ok(Some(Err(_))) => return,
            // Drain any trailing frames (advisory lines, heartbeats)
            Ok(Some(Ok(_))) => continue,
        }
    }
}

/// Receives the next event from a broadcast subscription, with a timeout.
#[allow(dead_code)]
pub async fn recv_event<T: Clone>(rx: &mut tokio::sync::broadcast::Receiver<T>) -> T {
    timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("Timeout waiting for event")
        .expect("Event channel closed")
}
