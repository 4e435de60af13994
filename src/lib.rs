//! Hetznat64 - WireGuard mesh control plane for NAT64 egress
//!
//! Builds a hub-and-spoke WireGuard overlay between a control node and a
//! fleet of cloud servers so that IPv6-only servers reach the IPv4 internet
//! through the control node's NAT64 gateway.
//!
//! # Architecture
//!
//! The control node discovers servers through the cloud API by label,
//! allocates each one an overlay address derived from its numeric ID and
//! performs an HTTP handshake with the agent running on it. The agent
//! configures its side of the tunnel and routes the NAT64 prefix through
//! the control node. Peers that prove reachable are labelled connected; a
//! connected node that loses its peer is handshaken again.
//!
//! # Features
//!
//! - Deterministic overlay addressing, no allocation state
//! - Hetzner Cloud and static node directories
//! - Idempotent, concurrency-safe agent handshakes
//! - Peer reconciliation that replaces re-keyed or moved nodes
//! - Reachability sweeps and agent connectivity tracking
//! - Optional mutual TLS on the handshake endpoint

pub mod agent;
pub mod allocator;
pub mod config;
pub mod control;
pub mod directory;
pub mod error;
pub mod handshake;
pub mod host;
pub mod keys;
pub mod liveness;
pub mod reconcile;
pub mod tls;
pub mod tunnel;

#[cfg(test)]
mod testutil;

pub use config::Hetznat64Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::agent::Agent;
    pub use crate::config::Hetznat64Config;
    pub use crate::control::{ControlDeps, ControlLoop};
    pub use crate::directory::{Node, NodeDirectory};
    pub use crate::error::{Error, Result};
    pub use crate::handshake::{HandshakeClient, HandshakeServer};
    pub use crate::keys::TunnelKeyPair;
    pub use crate::tunnel::{PeerEntry, TunnelConfiguration, TunnelDevice, UapiDevice, WgCommandDevice};
}
