// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Session Wire Protocol
//!
//! Every WebSocket text frame carries one JSON object with a `type` string
//! discriminator. The control subset (`authenticate`, `heartbeat`) is
//! modeled as typed payloads; everything else passes through as a raw
//! `serde_json::Value` user message.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::wallet::Wallet;

pub const TYPE_AUTHENTICATE: &str = "authenticate";
pub const TYPE_HEARTBEAT: &str = "heartbeat";

/// Advisory status lines written into the channel before a pre-auth
/// rejection close. Cosmetic only — clients must not parse these.
pub const ADVISORY_BAD_REQUEST: &str = "HTTP/1.1 400 Bad Request";
pub const ADVISORY_UNAUTHORIZED: &str = "HTTP/1.1 401 Unauthorized";
pub const ADVISORY_FORBIDDEN: &str = "HTTP/1.1 403 Forbidden";
pub const ADVISORY_TIMEOUT: &str = "HTTP/1.1 408 Request Timeout";
pub const ADVISORY_CONFLICT: &str = "HTTP/1.1 409 Conflict";

/// The mutual authentication message. The signature covers the ASCII
/// decimal rendering of `timestamp` (milliseconds since epoch, UTC).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub address: String,
    pub timestamp: i64,
    pub signature: String,
}

/// Application-level liveness message. Either side may originate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub ts: i64,
}

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub enum SessionMessage {
    Authenticate(AuthPayload),
    Heartbeat(HeartbeatPayload),
    /// Any other `type` — passed through to the application untouched.
    User(Value),
}

/// Decodes one text frame. The top-level value must be a JSON object with
/// a string `type` field.
pub fn decode_message(text: &str) -> Result<SessionMessage, String> {
    let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let kind = match value.get("type").and_then(Value::as_str) {
        Some(kind) => kind.to_string(),
        None => return Err("Missing type discriminator".to_string()),
    };

    match kind.as_str() {
        TYPE_AUTHENTICATE => {
            let payload: AuthPayload =
                serde_json::from_value(value).map_err(|e| e.to_string())?;
            Ok(SessionMessage::Authenticate(payload))
        }
        TYPE_HEARTBEAT => {
            let payload: HeartbeatPayload =
                serde_json::from_value(value).map_err(|e| e.to_string())?;
            Ok(SessionMessage::Heartbeat(payload))
        }
        _ => Ok(SessionMessage::User(value)),
    }
}

/// Creates a freshly signed authenticate payload for `wallet`.
pub fn create_authenticate(wallet: &Wallet) -> AuthPayload {
    let timestamp = now_millis();
    AuthPayload {
        address: wallet.address().to_string(),
        timestamp,
        signature: wallet.sign(&timestamp.to_string()),
    }
}

/// Encodes an authenticate payload as a wire frame.
pub fn encode_authenticate(auth: &AuthPayload) -> String {
    serde_json::json!({
        "type": TYPE_AUTHENTICATE,
        "address": auth.address,
        "timestamp": auth.timestamp,
        "signature": auth.signature,
    })
    .to_string()
}

/// Creates a heartbeat frame stamped with the current time.
pub fn create_heartbeat() -> String {
    serde_json::json!({ "type": TYPE_HEARTBEAT, "ts": now_millis() }).to_string()
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Freshness rule: a timestamp is acceptable iff `|now - timestamp|` is
/// strictly below the window.
pub fn is_fresh(timestamp: i64, now: i64, window_ms: u64) -> bool {
    match now.checked_sub(timestamp) {
        Some(skew) => skew.unsigned_abs() < window_ms,
        // Subtraction overflow means the timestamp is absurdly far away.
        None => false,
    }
}
