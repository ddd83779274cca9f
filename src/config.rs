//! Session Layer Configuration
//!
//! Server and client configuration, loaded from environment variables.
//! Any interval set to `0` disables the corresponding sweeper.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Synchronous authentication predicate, run after the whitelist check and
/// before the freshness check. Returns false to reject the address.
pub type AuthHook = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Host part of the listen address.
    pub bind_addr: String,
    /// Port to listen on.
    pub port: u16,
    /// Handshake freshness window and pre-auth lifetime bound (ms).
    pub auth_timeout_ms: u64,
    /// Pending-auth sweep interval (ms). 0 disables.
    pub auth_check_interval_ms: u64,
    /// Heartbeat emission interval (ms). 0 disables.
    pub heartbeat_interval_ms: u64,
    /// Idle bound for authenticated peers (ms).
    pub client_timeout_ms: u64,
    /// Idle sweep interval (ms). 0 disables.
    pub client_timeout_interval_ms: u64,
    /// Whether a new authentication for an in-use address evicts the
    /// existing peer (true) or is rejected (false).
    pub replace_existing: bool,
    /// Hex-encoded wallet seed. None generates (or loads from data_dir in
    /// the server binary).
    pub private_key_hex: Option<String>,
    /// If set, only these addresses may authenticate.
    pub whitelist: Option<HashSet<String>>,
    /// Optional custom authentication predicate.
    pub auth_hook: Option<AuthHook>,
    /// TLS certificate chain path (PEM). TLS is active iff both paths are set.
    pub tls_cert_path: Option<String>,
    /// TLS private key path (PEM).
    pub tls_key_path: Option<String>,
    /// Data directory for the persisted wallet key.
    pub data_dir: PathBuf,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("port", &self.port)
            .field("auth_timeout_ms", &self.auth_timeout_ms)
            .field("auth_check_interval_ms", &self.auth_check_interval_ms)
            .field("heartbeat_interval_ms", &self.heartbeat_interval_ms)
            .field("client_timeout_ms", &self.client_timeout_ms)
            .field("client_timeout_interval_ms", &self.client_timeout_interval_ms)
            .field("replace_existing", &self.replace_existing)
            .field("whitelist", &self.whitelist)
            .field("auth_hook", &self.auth_hook.as_ref().map(|_| "<fn>"))
            .field("tls_cert_path", &self.tls_cert_path)
            .field("tls_key_path", &self.tls_key_path)
            .field("data_dir", &self.data_dir)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: "0.0.0.0".to_string(),
            port: 3793,
            auth_timeout_ms: 5000,
            auth_check_interval_ms: 1000,
            heartbeat_interval_ms: 1000,
            client_timeout_ms: 5000,
            client_timeout_interval_ms: 1000,
            replace_existing: true,
            private_key_hex: None,
            whitelist: None,
            auth_hook: None,
            tls_cert_path: None,
            tls_key_path: None,
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("SIGNET_BIND_ADDR") {
            config.bind_addr = val;
        }

        if let Ok(val) = std::env::var("SIGNET_PORT") {
            if let Ok(parsed) = val.parse() {
                config.port = parsed;
            }
        }

        if let Ok(val) = std::env::var("SIGNET_AUTH_TIMEOUT_MS") {
            if let Ok(parsed) = val.parse() {
                config.auth_timeout_ms = parsed;
            }
        }

        if let Ok(val) = std::env::var("SIGNET_AUTH_CHECK_INTERVAL_MS") {
            if let Ok(parsed) = val.parse() {
                config.auth_check_interval_ms = parsed;
            }
        }

        if let Ok(val) = std::env::var("SIGNET_HEARTBEAT_INTERVAL_MS") {
            if let Ok(parsed) = val.parse() {
                config.heartbeat_interval_ms = parsed;
            }
        }

        if let Ok(val) = std::env::var("SIGNET_CLIENT_TIMEOUT_MS") {
            if let Ok(parsed) = val.parse() {
                config.client_timeout_ms = parsed;
            }
        }

        if let Ok(val) = std::env::var("SIGNET_CLIENT_TIMEOUT_INTERVAL_MS") {
            if let Ok(parsed) = val.parse() {
                config.client_timeout_interval_ms = parsed;
            }
        }

        if let Ok(val) = std::env::var("SIGNET_REPLACE_EXISTING") {
            config.replace_existing = val == "true" || val == "1";
        }

        if let Ok(val) = std::env::var("SIGNET_WALLET_KEY") {
            config.private_key_hex = Some(val);
        }

        if let Ok(val) = std::env::var("SIGNET_WHITELIST") {
            let addresses: HashSet<String> = val
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !addresses.is_empty() {
                config.whitelist = Some(addresses);
            }
        }

        if let Ok(val) = std::env::var("SIGNET_TLS_CERT") {
            config.tls_cert_path = Some(val);
        }

        if let Ok(val) = std::env::var("SIGNET_TLS_KEY") {
            config.tls_key_path = Some(val);
        }

        if let Ok(val) = std::env::var("SIGNET_DATA_DIR") {
            config.data_dir = PathBuf::from(val);
        }

        config
    }

    /// Returns the auth timeout as a Duration.
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    /// Returns the idle bound for authenticated peers as a Duration.
    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    /// Whether TLS is active (both cert and key paths configured).
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert_path.is_some() && self.tls_key_path.is_some()
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host to dial.
    pub host: String,
    /// Server port to dial.
    pub port: u16,
    /// Dial `wss://` instead of `ws://`.
    pub tls: bool,
    /// Hex-encoded wallet seed. None generates a fresh wallet.
    pub private_key_hex: Option<String>,
    /// Reconnection attempt cap.
    pub max_reconnect_attempts: u32,
    /// Base reconnection delay (ms); the n-th attempt waits `n * delay`.
    pub reconnect_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "localhost".to_string(),
            port: 3793,
            tls: false,
            private_key_hex: None,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
        }
    }
}

impl ClientConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("SIGNET_SERVER_HOST") {
            config.host = val;
        }

        if let Ok(val) = std::env::var("SIGNET_SERVER_PORT") {
            if let Ok(parsed) = val.parse() {
                config.port = parsed;
            }
        }

        if let Ok(val) = std::env::var("SIGNET_SERVER_TLS") {
            config.tls = val == "true" || val == "1";
        }

        if let Ok(val) = std::env::var("SIGNET_WALLET_KEY") {
            config.private_key_hex = Some(val);
        }

        if let Ok(val) = std::env::var("SIGNET_MAX_RECONNECT_ATTEMPTS") {
            if let Ok(parsed) = val.parse() {
                config.max_reconnect_attempts = parsed;
            }
        }

        if let Ok(val) = std::env::var("SIGNET_RECONNECT_DELAY_MS") {
            if let Ok(parsed) = val.parse() {
                config.reconnect_delay_ms = parsed;
            }
        }

        config
    }
}
