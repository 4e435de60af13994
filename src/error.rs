//! Hetznat64 Error Types

use std::net::IpAddr;
use thiserror::Error;

/// Result type alias for Hetznat64 operations
pub type Result<T> = std::result::Result<T, Error>;

/// Hetznat64 error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Discovery errors
    #[error("Discovery error: {0}")]
    Discovery(String),

    // Handshake errors
    #[error("Handshake with node {node} failed: {reason}")]
    Handshake { node: String, reason: String },

    // Tunnel device errors
    #[error("Tunnel configuration error: {0}")]
    Configuration(String),

    // Name resolution errors
    #[error("Failed to resolve {host}: {reason}")]
    Resolution { host: String, reason: String },

    // Reachability errors
    #[error("Probe to {address} failed: {reason}")]
    Probe { address: IpAddr, reason: String },

    // Host network errors
    #[error("Host network error: {0}")]
    HostNetwork(String),

    // TLS errors
    #[error("TLS error: {0}")]
    Tls(String),

    // Key and address errors
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a handshake error for a node
    pub fn handshake(node: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        Error::Handshake {
            node: node.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Check if this error aborts a whole reconciliation cycle.
    ///
    /// Only failures of the shared collaborators (directory, tunnel device)
    /// do; everything scoped to a single node is skipped for the cycle.
    pub fn aborts_cycle(&self) -> bool {
        matches!(self, Error::Discovery(_) | Error::Configuration(_))
    }

    /// Check if this error is retryable on the next interval
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Discovery(_)
                | Error::Handshake { .. }
                | Error::Configuration(_)
                | Error::Resolution { .. }
                | Error::Probe { .. }
                | Error::HostNetwork(_)
        )
    }
}
