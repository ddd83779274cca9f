// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Integration tests for the session client: mutual authentication,
//! heartbeat answering, server-signature verification, and the linear
//! reconnect/backoff behavior.

mod common;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use signet_link::client::{ClientEvent, SessionClient};
use signet_link::config::ClientConfig;
use signet_link::protocol;
use signet_link::server::ServerEvent;

use common::{recv_event, start_server, test_config, test_wallet};

fn client_config(port: u16) -> ClientConfig {
    let mut config = ClientConfig::default();
    config.host = "127.0.0.1".to_string();
    config.port = port;
    config
}

/// Receives client events until one matches, panicking after the deadline.
async fn wait_for_client_event<F>(
    rx: &mut tokio::sync::broadcast::Receiver<ClientEvent>,
    mut matches: F,
) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    timeout(Duration::from_secs(3), async {
        loop {
            let event = rx.recv().await.expect("Event channel closed");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("Timeout waiting for matching client event")
}

/// Drains events for `window`, returning everything received.
async fn drain_events(
    rx: &mut tokio::sync::broadcast::Receiver<ClientEvent>,
    window: Duration,
) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match timeout(deadline.saturating_duration_since(tokio::time::Instant::now()), rx.recv())
            .await
        {
            Ok(Ok(event)) => events.push(event),
            _ => return events,
        }
    }
}

/// Binds and immediately drops a listener to get a port nothing listens on.
async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// ============================================================================
// Tests: Happy path
// ============================================================================

#[tokio::test]
async fn test_client_mutual_authentication() {
    let (server, url) = start_server(test_config()).await;
    let port: u16 = url.rsplit(':').next().unwrap().parse().unwrap();
    let mut server_events = server.subscribe();

    let wallet = test_wallet(30);
    let client = SessionClient::with_wallet(client_config(port), wallet.clone());
    let mut events = client.subscribe();
    client.connect();

    match wait_for_client_event(&mut events, |e| matches!(e, ClientEvent::Connected)).await {
        ClientEvent::Connected => {}
        other => panic!("Expected Connected, got {:?}", other),
    }
    match wait_for_client_event(&mut events, |e| matches!(e, ClientEvent::Authenticated(_))).await
    {
        ClientEvent::Authenticated(address) => assert_eq!(address, server.address()),
        other => panic!("Expected Authenticated, got {:?}", other),
    }
    assert!(client.is_connected());
    assert!(client.is_authenticated());
    assert_eq!(client.server_address().as_deref(), Some(server.address()));

    // Server → client application message
    timeout(Duration::from_secs(3), async {
        loop {
            if server.client(wallet.address()).is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Peer never registered");
    server
        .send(wallet.address(), &json!({"type": "greeting", "n": 1}))
        .await
        .unwrap();
    match wait_for_client_event(&mut events, |e| matches!(e, ClientEvent::Message(_))).await {
        ClientEvent::Message(value) => assert_eq!(value, json!({"type": "greeting", "n": 1})),
        other => panic!("Expected Message, got {:?}", other),
    }

    // Client → server application message
    client.send(&json!({"type": "reply", "n": 2})).await;
    loop {
        match recv_event(&mut server_events).await {
            ServerEvent::Message { message, .. } => {
                assert_eq!(message, json!({"type": "reply", "n": 2}));
                break;
            }
            _ => continue,
        }
    }

    client.disconnect();
    server.close();
}

#[tokio::test]
async fn test_client_answers_server_heartbeat() {
    let mut config = test_config();
    config.heartbeat_interval_ms = 100;
    let (server, url) = start_server(config).await;
    let port: u16 = url.rsplit(':').next().unwrap().parse().unwrap();
    let mut server_events = server.subscribe();

    let client = SessionClient::with_wallet(client_config(port), test_wallet(31));
    let mut events = client.subscribe();
    client.connect();

    // The client surfaces the server heartbeat...
    match wait_for_client_event(&mut events, |e| matches!(e, ClientEvent::Heartbeat { .. })).await
    {
        ClientEvent::Heartbeat { ts } => assert!(ts > 0),
        other => panic!("Expected Heartbeat, got {:?}", other),
    }

    // ...and its reply surfaces as a heartbeat event on the server
    timeout(Duration::from_secs(3), async {
        loop {
            if let Ok(ServerEvent::Heartbeat { .. }) = server_events.recv().await {
                return;
            }
        }
    })
    .await
    .expect("Server never saw the heartbeat reply");

    client.disconnect();
    server.close();
}

// ============================================================================
// Tests: Server signature verification
// ============================================================================

#[tokio::test]
async fn test_invalid_server_signature_disconnects_without_reconnect() {
    // An imposter server that answers with a signature over the wrong message
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let imposter = test_wallet(40);
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            if let Ok(mut ws) = accept_async(stream).await {
                // Consume the client's authenticate
                let _ = ws.next().await;
                let bad = json!({
                    "type": "authenticate",
                    "address": imposter.address(),
                    "timestamp": protocol::now_millis(),
                    "signature": imposter.sign("999"),
                });
                let _ = ws.send(Message::Text(bad.to_string())).await;
                // Hold the socket; the client must be the one to close it
                let _ = ws.next().await;
            }
        }
    });

    let client = SessionClient::with_wallet(client_config(port), test_wallet(32));
    let mut events = client.subscribe();
    client.connect();

    match wait_for_client_event(&mut events, |e| {
        matches!(e, ClientEvent::Error(msg) if msg == "Invalid server signature")
    })
    .await
    {
        ClientEvent::Error(_) => {}
        other => panic!("Expected Error, got {:?}", other),
    }
    wait_for_client_event(&mut events, |e| matches!(e, ClientEvent::Disconnected)).await;
    assert!(!client.is_authenticated());

    // No reconnection after a failed server verification
    let trailing = drain_events(&mut events, Duration::from_millis(600)).await;
    assert!(
        !trailing
            .iter()
            .any(|e| matches!(e, ClientEvent::Reconnecting { .. })),
        "Client must not reconnect after invalid server signature: {:?}",
        trailing
    );
}

// ============================================================================
// Tests: Reconnection backoff
// ============================================================================

#[tokio::test]
async fn test_reconnect_backoff_is_linear_and_capped() {
    let port = dead_port().await;
    let mut config = client_config(port);
    config.max_reconnect_attempts = 3;
    config.reconnect_delay_ms = 100;

    let client = SessionClient::with_wallet(config, test_wallet(33));
    let mut events = client.subscribe();
    client.connect();

    // Collect until the exhaustion error
    let collected = timeout(Duration::from_secs(5), async {
        let mut collected = Vec::new();
        loop {
            let event = events.recv().await.expect("Event channel closed");
            let done = matches!(&event, ClientEvent::Error(msg) if msg == "Max reconnect attempts reached");
            collected.push(event);
            if done {
                return collected;
            }
        }
    })
    .await
    .expect("Never reached the attempt cap");

    let schedule: Vec<(u32, u64)> = collected
        .iter()
        .filter_map(|e| match e {
            ClientEvent::Reconnecting { attempt, delay_ms } => Some((*attempt, *delay_ms)),
            _ => None,
        })
        .collect();
    assert_eq!(schedule, vec![(1, 100), (2, 200), (3, 300)]);

    // No further attempts after exhaustion
    let trailing = drain_events(&mut events, Duration::from_millis(500)).await;
    assert!(
        !trailing
            .iter()
            .any(|e| matches!(e, ClientEvent::Reconnecting { .. })),
        "No reconnection after exhaustion: {:?}",
        trailing
    );
}

#[tokio::test]
async fn test_disconnect_cancels_scheduled_reconnect() {
    let port = dead_port().await;
    let mut config = client_config(port);
    config.max_reconnect_attempts = 5;
    config.reconnect_delay_ms = 300;

    let client = SessionClient::with_wallet(config, test_wallet(34));
    let mut events = client.subscribe();
    client.connect();

    wait_for_client_event(&mut events, |e| matches!(e, ClientEvent::Reconnecting { .. })).await;
    client.disconnect();

    // The pending attempt is abandoned: no dial, no further scheduling
    let trailing = drain_events(&mut events, Duration::from_millis(900)).await;
    assert!(
        !trailing.iter().any(|e| matches!(
            e,
            ClientEvent::Reconnecting { .. } | ClientEvent::Connected
        )),
        "disconnect() must cancel reconnection: {:?}",
        trailing
    );
}

#[tokio::test]
async fn test_disconnect_after_auth_is_idempotent() {
    let (server, url) = start_server(test_config()).await;
    let port: u16 = url.rsplit(':').next().unwrap().parse().unwrap();

    let wallet = test_wallet(35);
    let client = SessionClient::with_wallet(client_config(port), wallet.clone());
    let mut events = client.subscribe();
    client.connect();

    wait_for_client_event(&mut events, |e| matches!(e, ClientEvent::Authenticated(_))).await;

    client.disconnect();
    client.disconnect();

    wait_for_client_event(&mut events, |e| matches!(e, ClientEvent::Disconnected)).await;
    assert!(!client.is_connected());

    // No reconnection attempts follow
    let trailing = drain_events(&mut events, Duration::from_millis(600)).await;
    assert!(
        !trailing.iter().any(|e| matches!(
            e,
            ClientEvent::Reconnecting { .. } | ClientEvent::Connected
        )),
        "disconnect() must be final: {:?}",
        trailing
    );

    // The server drops the peer
    timeout(Duration::from_secs(2), async {
        loop {
            if server.client_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("Server never dropped the disconnected peer");
    server.close();
}

#[tokio::test]
async fn test_backoff_resets_after_successful_connection() {
    // Start a real server, connect, then kill it and watch attempt numbering
    let (server, url) = start_server(test_config()).await;
    let port: u16 = url.rsplit(':').next().unwrap().parse().unwrap();

    let mut config = client_config(port);
    config.max_reconnect_attempts = 2;
    config.reconnect_delay_ms = 100;
    let client = SessionClient::with_wallet(config, test_wallet(36));
    let mut events = client.subscribe();
    client.connect();

    wait_for_client_event(&mut events, |e| matches!(e, ClientEvent::Authenticated(_))).await;

    // Server goes away; the client starts over from attempt 1
    server.close();
    match wait_for_client_event(&mut events, |e| matches!(e, ClientEvent::Reconnecting { .. }))
        .await
    {
        ClientEvent::Reconnecting { attempt, delay_ms } => {
            assert_eq!(attempt, 1);
            assert_eq!(delay_ms, 100);
        }
        other => panic!("Expected Reconnecting, got {:?}", other),
    }

    client.disconnect();
}
