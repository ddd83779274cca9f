// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wallet Identity
//!
//! Generates, persists, and loads the endpoint's Ed25519 keypair. The
//! wallet's canonical address is the lowercase hex encoding of the 32-byte
//! public key; signatures are hex-encoded Ed25519 signatures over the
//! ASCII message string.

use std::fmt;
use std::path::Path;

use ring::rand::SecureRandom;
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};

const KEY_FILE_NAME: &str = "wallet_key.bin";

/// File format: the raw 32-byte private seed. The public key is re-derived
/// on load.
const KEY_FILE_SIZE: usize = 32;

/// An Ed25519 keypair plus its derived address.
#[derive(Clone)]
pub struct Wallet {
    seed: [u8; 32],
    public: [u8; 32],
    address: String,
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Wallet {
    /// Generates a fresh random wallet.
    pub fn generate() -> Wallet {
        let rng = ring::rand::SystemRandom::new();
        let mut seed = [0u8; 32];
        rng.fill(&mut seed).expect("system RNG failure");
        Wallet::from_seed(seed).expect("freshly generated seed must be valid")
    }

    /// Restores a wallet from a hex-encoded 32-byte private seed.
    pub fn from_private_key_hex(key_hex: &str) -> Result<Wallet, String> {
        let bytes = hex::decode(key_hex.trim())
            .map_err(|e| format!("Invalid private key hex: {}", e))?;
        if bytes.len() != KEY_FILE_SIZE {
            return Err(format!(
                "Invalid private key length: expected {} bytes, got {}",
                KEY_FILE_SIZE,
                bytes.len()
            ));
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&bytes);
        Wallet::from_seed(seed)
    }

    fn from_seed(seed: [u8; 32]) -> Result<Wallet, String> {
        let keypair = Ed25519KeyPair::from_seed_unchecked(&seed)
            .map_err(|e| format!("Invalid Ed25519 seed: {}", e))?;
        let mut public = [0u8; 32];
        public.copy_from_slice(keypair.public_key().as_ref());
        Ok(Wallet {
            seed,
            public,
            address: hex::encode(public),
        })
    }

    /// The wallet's canonical address (64 lowercase hex chars).
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The private seed as hex, for persistence or config export.
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.seed)
    }

    /// Signs an ASCII message string, returning the hex-encoded signature.
    pub fn sign(&self, message: &str) -> String {
        let keypair = Ed25519KeyPair::from_seed_unchecked(&self.seed)
            .expect("seed validated at construction");
        hex::encode(keypair.sign(message.as_bytes()).as_ref())
    }
}

/// Verifies a hex signature over `message` against a claimed address.
///
/// Any decode failure (malformed address or signature) verifies as false;
/// this function never errors.
pub fn verify(message: &str, signature_hex: &str, address: &str) -> bool {
    if !is_valid_address(address) {
        return false;
    }
    let public = match hex::decode(address) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let signature = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    UnparsedPublicKey::new(&ED25519, &public)
        .verify(message.as_bytes(), &signature)
        .is_ok()
}

/// Validates an address format (must be 64 hex characters = 32-byte key).
pub fn is_valid_address(address: &str) -> bool {
    address.len() == 64 && address.chars().all(|c| c.is_ascii_hexdigit())
}

/// Saves a wallet seed to `{data_dir}/wallet_key.bin` with 0600 permissions.
pub fn save_wallet(wallet: &Wallet, data_dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(data_dir)?;
    let path = data_dir.join(KEY_FILE_NAME);

    std::fs::write(&path, wallet.seed)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

/// Loads a wallet from `{data_dir}/wallet_key.bin`.
pub fn load_wallet(data_dir: &Path) -> std::io::Result<Wallet> {
    let path = data_dir.join(KEY_FILE_NAME);
    let data = std::fs::read(&path)?;

    if data.len() != KEY_FILE_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "Invalid key file: expected {} bytes, got {}",
                KEY_FILE_SIZE,
                data.len()
            ),
        ));
    }

    let mut seed = [0u8; 32];
    seed.copy_from_slice(&data);
    Wallet::from_seed(seed).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Loads an existing wallet or generates a new one.
///
/// Priority:
/// 1. `SIGNET_WALLET_KEY` env var (hex-encoded 32-byte seed)
/// 2. Existing key file at `{data_dir}/wallet_key.bin`
/// 3. Generate new wallet and save to file
pub fn load_or_generate(data_dir: &Path) -> Wallet {
    // 1. Check env var override
    if let Ok(key_hex) = std::env::var("SIGNET_WALLET_KEY") {
        if let Ok(wallet) = Wallet::from_private_key_hex(&key_hex) {
            return wallet;
        }
    }

    // 2. Try loading from file
    if let Ok(wallet) = load_wallet(data_dir) {
        return wallet;
    }

    // 3. Generate new wallet and save
    let wallet = Wallet::generate();
    let _ = save_wallet(&wallet, data_dir);
    wallet
}
