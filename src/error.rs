// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Session Error Taxonomy
//!
//! API-level errors returned by `SessionServer` and `SessionClient`.
//! Per-connection failures are not raised through these — they surface as
//! `Error` events on the affected endpoint and terminate only their own
//! connection.

use thiserror::Error;

/// Errors surfaced by the session layer API.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The listener could not bind to the configured address.
    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),

    /// TLS material was configured but could not be loaded.
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// A received frame was not valid JSON.
    #[error("parse error: {0}")]
    Parse(String),

    /// A message violated the session protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Handshake validation failed (signature, freshness, whitelist, hook).
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// A second authenticated connection arrived for an address already in use.
    #[error("address collision: {0}")]
    AddressCollision(String),

    /// A connection exceeded one of its lifetime bounds.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The underlying socket or TLS stream failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A send was addressed to a peer that is not connected.
    #[error("no authenticated client for address {0}")]
    PeerNotConnected(String),

    /// The client ran out of reconnection attempts.
    #[error("max reconnect attempts reached")]
    ReconnectExhausted,
}
