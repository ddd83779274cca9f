// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Signet Link Server
//!
//! A wallet-authenticated WebSocket session server. Clients prove control
//! of their wallet address with a signed, fresh timestamp; the server
//! answers with its own, and the channel becomes a trusted duplex session
//! kept alive by heartbeats and activity timeouts.

use tracing::{error, info};

use signet_link::config::ServerConfig;
use signet_link::server::SessionServer;
use signet_link::wallet;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("signet_link=info".parse().unwrap()),
        )
        .init();

    // Load configuration
    let config = ServerConfig::from_env();

    // Resolve the server wallet: configured key, persisted key file, or
    // freshly generated (and persisted).
    let wallet = match &config.private_key_hex {
        Some(key_hex) => match wallet::Wallet::from_private_key_hex(key_hex) {
            Ok(wallet) => wallet,
            Err(e) => {
                error!("Invalid SIGNET_WALLET_KEY: {}", e);
                std::process::exit(1);
            }
        },
        None => wallet::load_or_generate(&config.data_dir),
    };

    info!("Starting Signet Link Server v{}", env!("CARGO_PKG_VERSION"));
    info!("Wallet address: {}", wallet.address());
    info!("Listen: {}:{}", config.bind_addr, config.port);
    if config.tls_enabled() {
        info!("TLS: enabled (wss://)");
    } else {
        info!("TLS: disabled (ws://) — front with a TLS proxy in production");
    }
    info!(
        "Auth timeout: {}ms, heartbeat: {}ms, client timeout: {}ms",
        config.auth_timeout_ms, config.heartbeat_interval_ms, config.client_timeout_ms
    );
    if let Some(whitelist) = &config.whitelist {
        info!("Whitelist: {} address(es)", whitelist.len());
    }

    let server = SessionServer::with_wallet(config, wallet);

    if let Err(e) = server.listen().await {
        error!("Failed to start server: {}", e);
        std::process::exit(1);
    }

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for shutdown signal");
    info!("Shutdown signal received");
    server.close();
}
