//! Handshake Protocol
//!
//! The control node offers its public key and the overlay address it picked
//! for an agent; the agent answers with its own public key and listen port.

mod client;
mod server;

pub use client::{endpoint_host, HandshakeClient};
pub use server::{resolve_ipv6, AgentSettings, AgentState, HandshakeServer};

use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::directory::Node;
use crate::error::{Error, Result};
use crate::tunnel::PeerEntry;

/// Body of `POST /handshake`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Overlay address assigned to the agent
    pub agent_ip: String,
    /// Control node's overlay interface address, with its prefix length
    pub control_ip: String,
    /// Control node's WireGuard listen port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_port: Option<u16>,
    /// Control node's public key (base64)
    pub public_key: String,
    /// Optional preshared key (base64)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,
}

/// Handshake answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Agent's public key (base64)
    pub public_key: String,
    /// Agent's WireGuard listen port
    pub port: u16,
}

impl HandshakeRequest {
    /// Agent address parsed from `agent_ip` (a prefix length is allowed)
    pub fn agent_address(&self) -> Result<IpAddr> {
        parse_interface(&self.agent_ip).map(|net| net.addr())
    }

    /// Control interface parsed from `control_ip`
    pub fn control_interface(&self) -> Result<IpNet> {
        parse_interface(&self.control_ip)
    }
}

/// Parse `addr/len`, or a bare address as a host network
pub fn parse_interface(value: &str) -> Result<IpNet> {
    let value = value.trim();
    value
        .parse::<IpNet>()
        .or_else(|_| value.parse::<IpAddr>().map(IpNet::from))
        .map_err(|_| Error::InvalidAddress(value.to_string()))
}

/// What the control node tells agents about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlIdentity {
    /// Overlay interface address; its network is the allocation prefix
    pub interface: IpNet,
    /// WireGuard listen port
    pub port: u16,
    /// Public key (base64)
    pub public_key: String,
}

/// Performs handshakes with agents
#[async_trait::async_trait]
pub trait Handshaker: Send + Sync {
    /// Handshake with a node's agent and return the peer to install for it
    async fn handshake(&self, node: &Node, control: &ControlIdentity) -> Result<PeerEntry>;
}
