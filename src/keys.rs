//! WireGuard key handling
//!
//! X25519 key pairs in the base64 encoding `wg(8)` uses, plus the hex form
//! spoken on the userspace control socket.

use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};

/// X25519 key pair for a tunnel endpoint
#[derive(Clone)]
pub struct TunnelKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for TunnelKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelKeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

impl TunnelKeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild a key pair from a base64 private key
    pub fn from_private_base64(encoded: &str) -> Result<Self> {
        let secret = StaticSecret::from(decode_key(encoded)?);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    /// Load a key pair from a private key file (base64)
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_private_base64(content.trim())
    }

    /// Save the private key to a file, readable by the owner only
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.private_key())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        tracing::info!("Private key saved to {:?}", path);
        Ok(())
    }

    /// Load or generate a key pair
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            tracing::info!("Loading key pair from {:?}", path);
            Self::load(path)
        } else {
            tracing::info!("Generating new key pair, saving to {:?}", path);
            let kp = Self::generate();
            kp.save(path)?;
            Ok(kp)
        }
    }

    /// Private key as base64
    pub fn private_key(&self) -> String {
        BASE64.encode(self.secret.to_bytes())
    }

    /// Public key as base64
    pub fn public_key(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }
}

/// Decode a base64 WireGuard key into its 32 raw bytes
pub fn decode_key(encoded: &str) -> Result<[u8; 32]> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| Error::InvalidKey(format!("not base64: {}", e)))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| Error::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))
}

/// Check that a string is a well-formed base64 WireGuard key
pub fn validate_key(encoded: &str) -> Result<()> {
    decode_key(encoded).map(|_| ())
}

/// base64 key → hex, as used on the userspace control socket
pub fn base64_to_hex(encoded: &str) -> Result<String> {
    Ok(hex::encode(decode_key(encoded)?))
}

/// hex key → base64
pub fn hex_to_base64(hex_key: &str) -> Result<String> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| Error::InvalidKey(format!("not hex: {}", e)))?;
    if bytes.len() != 32 {
        return Err(Error::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())));
    }
    Ok(BASE64.encode(bytes))
}
