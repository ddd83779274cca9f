// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! TLS Listener Material
//!
//! Loads the server's PEM certificate chain and private key into a rustls
//! acceptor. TLS is active iff both paths are configured; otherwise the
//! listener speaks plain `ws://`.

use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::{self, pki_types};
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::config::ServerConfig;

/// Loads PEM certificates from a file path.
fn load_certs(path: &str) -> Result<Vec<pki_types::CertificateDer<'static>>, String> {
    let file = std::fs::File::open(path)
        .map_err(|e| format!("Failed to open cert file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("Failed to parse certs from {}: {}", path, e))?;

    if certs.is_empty() {
        return Err(format!("No certificates found in {}", path));
    }

    Ok(certs)
}

/// Loads a PEM private key from a file path.
fn load_private_key(path: &str) -> Result<pki_types::PrivateKeyDer<'static>, String> {
    let file = std::fs::File::open(path)
        .map_err(|e| format!("Failed to open key file {}: {}", path, e))?;
    let mut reader = BufReader::new(file);

    // Try PKCS#8 first, then RSA, then EC
    let key = rustls_pemfile::private_key(&mut reader)
        .map_err(|e| format!("Failed to parse private key from {}: {}", path, e))?
        .ok_or_else(|| format!("No private key found in {}", path))?;

    Ok(key)
}

/// Loads the listener TLS acceptor from the configured cert/key paths.
///
/// Returns `None` when TLS is not configured (either path missing).
/// Returns `Err` if paths are set but files can't be loaded.
pub fn load_server_tls(config: &ServerConfig) -> Result<Option<TlsAcceptor>, String> {
    let (cert_path, key_path) = match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert), Some(key)) => (cert.as_str(), key.as_str()),
        _ => return Ok(None),
    };

    info!("Loading TLS certificate from {}", cert_path);

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| format!("Invalid TLS material: {}", e))?;

    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}
