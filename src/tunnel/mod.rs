//! Tunnel Module
//!
//! Configuration model of a WireGuard interface and the `TunnelDevice`
//! capability used to read and replace it.

mod uapi;
mod wg;

pub use uapi::UapiDevice;
pub use wg::WgCommandDevice;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A WireGuard peer as seen by the tunnel device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Peer public key (base64)
    pub public_key: String,
    /// Optional preshared key (base64)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,
    /// Endpoint host: an address, or a hostname that could not be resolved
    #[serde(default)]
    pub endpoint_host: Option<String>,
    /// Endpoint UDP port
    #[serde(default)]
    pub endpoint_port: Option<u16>,
    /// Addresses routed to this peer
    #[serde(default)]
    pub allowed_ips: BTreeSet<IpNet>,
    /// Keepalive interval in seconds
    #[serde(default)]
    pub persistent_keepalive: Option<u16>,
    /// Last completed cryptographic handshake, reported by the device
    #[serde(default)]
    pub last_handshake_time: Option<DateTime<Utc>>,
}

impl PeerEntry {
    /// Create a peer with only a public key
    pub fn new(public_key: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            preshared_key: None,
            endpoint_host: None,
            endpoint_port: None,
            allowed_ips: BTreeSet::new(),
            persistent_keepalive: None,
            last_handshake_time: None,
        }
    }

    /// Set the endpoint
    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.endpoint_host = Some(host.into());
        self.endpoint_port = Some(port);
        self
    }

    /// Add an allowed network
    pub fn with_allowed_ip(mut self, net: IpNet) -> Self {
        self.allowed_ips.insert(net);
        self
    }

    /// Set the keepalive interval
    pub fn with_keepalive(mut self, secs: u16) -> Self {
        self.persistent_keepalive = (secs > 0).then_some(secs);
        self
    }

    /// Whether any allowed network covers `addr`
    pub fn routes(&self, addr: &IpAddr) -> bool {
        self.allowed_ips.iter().any(|net| net.contains(addr))
    }

    /// Whether the endpoint host is `addr`
    pub fn endpoint_is(&self, addr: &IpAddr) -> bool {
        self.endpoint_addr().as_ref() == Some(addr)
    }

    /// Endpoint host parsed as an address, if it is one
    pub fn endpoint_addr(&self) -> Option<IpAddr> {
        self.endpoint_host
            .as_deref()
            .and_then(|h| h.trim_start_matches('[').trim_end_matches(']').parse().ok())
    }

    /// `host:port` form of the endpoint, bracketing IPv6 literals
    pub fn endpoint(&self) -> Option<String> {
        let host = self.endpoint_host.as_deref()?;
        let port = self.endpoint_port?;
        Some(match self.endpoint_addr() {
            Some(IpAddr::V6(v6)) => format!("[{}]:{}", v6, port),
            Some(IpAddr::V4(v4)) => format!("{}:{}", v4, port),
            None => format!("{}:{}", host, port),
        })
    }

    /// Whether a handshake happened within `window` of `now`
    pub fn handshake_within(&self, window: std::time::Duration, now: DateTime<Utc>) -> bool {
        match (self.last_handshake_time, chrono::Duration::from_std(window)) {
            (Some(at), Ok(window)) => now.signed_duration_since(at) <= window,
            _ => false,
        }
    }

    /// The fields that make up the desired state of a peer
    fn desired(&self) -> DesiredPeer<'_> {
        DesiredPeer {
            preshared_key: self.preshared_key.as_deref(),
            endpoint: self.endpoint(),
            allowed_ips: &self.allowed_ips,
            persistent_keepalive: self.persistent_keepalive,
        }
    }
}

#[derive(PartialEq, Eq)]
struct DesiredPeer<'a> {
    preshared_key: Option<&'a str>,
    endpoint: Option<String>,
    allowed_ips: &'a BTreeSet<IpNet>,
    persistent_keepalive: Option<u16>,
}

/// Full configuration of a tunnel interface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfiguration {
    /// Interface private key (base64)
    #[serde(default, skip_serializing)]
    pub private_key: Option<String>,
    /// UDP listen port
    #[serde(default)]
    pub listen_port: Option<u16>,
    /// Interface addresses; managed by the host, not the device
    #[serde(default)]
    pub addresses: Vec<IpNet>,
    /// Peers
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
}

impl TunnelConfiguration {
    /// Find a peer by public key
    pub fn peer(&self, public_key: &str) -> Option<&PeerEntry> {
        self.peers.iter().find(|p| p.public_key == public_key)
    }

    /// Public keys of all peers
    pub fn peer_keys(&self) -> BTreeSet<&str> {
        self.peers.iter().map(|p| p.public_key.as_str()).collect()
    }

    /// Remove peers matching a predicate, returning them
    pub fn remove_peers<F>(&mut self, mut pred: F) -> Vec<PeerEntry>
    where
        F: FnMut(&PeerEntry) -> bool,
    {
        let (removed, kept) = std::mem::take(&mut self.peers)
            .into_iter()
            .partition(|p| pred(p));
        self.peers = kept;
        removed
    }

    /// Structural comparison of the desired state.
    ///
    /// Peers are compared as a set keyed by public key. Device-reported
    /// runtime state (handshake timestamps) and ordering are ignored.
    pub fn same_as(&self, other: &TunnelConfiguration) -> bool {
        if self.private_key != other.private_key || self.listen_port != other.listen_port {
            return false;
        }
        let addrs = |c: &TunnelConfiguration| c.addresses.iter().copied().collect::<BTreeSet<_>>();
        if addrs(self) != addrs(other) {
            return false;
        }
        self.desired_peers() == other.desired_peers()
    }

    fn desired_peers(&self) -> BTreeMap<&str, DesiredPeer<'_>> {
        self.peers
            .iter()
            .map(|p| (p.public_key.as_str(), p.desired()))
            .collect()
    }

    /// Render in wg-quick format, with the private key redacted
    pub fn to_wg_quick(&self) -> String {
        self.render(true)
    }

    /// Render in `wg setconf` format: real keys, no `Address`
    pub fn to_wg_config(&self) -> String {
        self.render(false)
    }

    fn render(&self, redacted: bool) -> String {
        let secret = |value: &str| if redacted { "(hidden)".to_string() } else { value.to_string() };

        let mut out = String::from("[Interface]\n");
        if redacted && !self.addresses.is_empty() {
            let addrs: Vec<String> = self.addresses.iter().map(|a| a.to_string()).collect();
            let _ = writeln!(out, "Address = {}", addrs.join(", "));
        }
        if let Some(key) = &self.private_key {
            let _ = writeln!(out, "PrivateKey = {}", secret(key));
        }
        if let Some(port) = self.listen_port {
            let _ = writeln!(out, "ListenPort = {}", port);
        }

        let mut peers: Vec<&PeerEntry> = self.peers.iter().collect();
        peers.sort_by(|a, b| a.public_key.cmp(&b.public_key));
        for peer in peers {
            out.push_str("\n[Peer]\n");
            let _ = writeln!(out, "PublicKey = {}", peer.public_key);
            if let Some(psk) = &peer.preshared_key {
                let _ = writeln!(out, "PresharedKey = {}", secret(psk));
            }
            if let Some(endpoint) = peer.endpoint() {
                let _ = writeln!(out, "Endpoint = {}", endpoint);
            }
            if !peer.allowed_ips.is_empty() {
                let ips: Vec<String> = peer.allowed_ips.iter().map(|a| a.to_string()).collect();
                let _ = writeln!(out, "AllowedIPs = {}", ips.join(", "));
            }
            if let Some(keepalive) = peer.persistent_keepalive {
                let _ = writeln!(out, "PersistentKeepalive = {}", keepalive);
            }
        }
        out
    }
}

/// Local tunnel device capability
#[async_trait::async_trait]
pub trait TunnelDevice: Send + Sync {
    /// Read the active configuration
    async fn get(&self) -> Result<TunnelConfiguration>;

    /// Replace the active configuration
    async fn set(&self, config: &TunnelConfiguration) -> Result<()>;

    /// Names of all tunnel interfaces on this host
    async fn list(&self) -> Result<Vec<String>>;
}

/// Poll a device until it answers, as a freshly started userspace
/// implementation takes a moment to open its socket
pub async fn wait_ready(
    device: &dyn TunnelDevice,
    attempts: u32,
    delay: std::time::Duration,
) -> Result<TunnelConfiguration> {
    let mut attempt = 1;
    loop {
        match device.get().await {
            Ok(config) => return Ok(config),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                tracing::info!("Tunnel device not ready ({}), retrying...", e);
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryTunnel;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_wait_ready() {
        let device = MemoryTunnel::new();
        assert!(wait_ready(&device, 3, std::time::Duration::from_millis(1)).await.is_ok());

        device.fail_reads(true);
        assert!(wait_ready(&device, 3, std::time::Duration::from_millis(1)).await.is_err());
    }

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn sample_peer(key: &str, addr: &str) -> PeerEntry {
        PeerEntry::new(key)
            .with_endpoint("2001:db8::10", 51820)
            .with_allowed_ip(net(addr))
            .with_keepalive(25)
    }

    #[test]
    fn test_same_as_ignores_order_and_handshakes() {
        let a = TunnelConfiguration {
            private_key: Some("key".into()),
            listen_port: Some(51820),
            addresses: vec![net("fd00:6464::1/64")],
            peers: vec![sample_peer("A", "fd00:6464::10/128"), sample_peer("B", "fd00:6464::11/128")],
        };
        let mut b = a.clone();
        b.peers.reverse();
        b.peers[0].last_handshake_time = Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        assert!(a.same_as(&b));

        b.peers[0].endpoint_port = Some(51821);
        assert!(!a.same_as(&b));
    }

    #[test]
    fn test_same_as_detects_peer_changes() {
        let base = TunnelConfiguration {
            peers: vec![sample_peer("A", "fd00:6464::10/128")],
            ..Default::default()
        };

        let mut added = base.clone();
        added.peers.push(sample_peer("B", "fd00:6464::11/128"));
        assert!(!base.same_as(&added));

        let mut rekeyed = base.clone();
        rekeyed.peers[0].public_key = "C".into();
        assert!(!base.same_as(&rekeyed));
    }

    #[test]
    fn test_endpoint_formatting() {
        let v6 = PeerEntry::new("A").with_endpoint("2001:db8::1", 51820);
        assert_eq!(v6.endpoint().unwrap(), "[2001:db8::1]:51820");

        let v4 = PeerEntry::new("A").with_endpoint("192.0.2.1", 51820);
        assert_eq!(v4.endpoint().unwrap(), "192.0.2.1:51820");

        let name = PeerEntry::new("A").with_endpoint("control.example", 51820);
        assert_eq!(name.endpoint().unwrap(), "control.example:51820");
        assert_eq!(name.endpoint_addr(), None);
    }

    #[test]
    fn test_routes_and_remove() {
        let mut config = TunnelConfiguration {
            peers: vec![sample_peer("A", "fd00:6464::10/128"), sample_peer("B", "fd00:6464::11/128")],
            ..Default::default()
        };
        let target: IpAddr = "fd00:6464::11".parse().unwrap();
        let removed = config.remove_peers(|p| p.routes(&target));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].public_key, "B");
        assert_eq!(config.peer_keys().into_iter().collect::<Vec<_>>(), vec!["A"]);
    }

    #[test]
    fn test_handshake_window() {
        let now = Utc.timestamp_opt(1_700_000_600, 0).unwrap();
        let mut peer = sample_peer("A", "fd00:6464::10/128");
        assert!(!peer.handshake_within(std::time::Duration::from_secs(180), now));

        peer.last_handshake_time = Some(Utc.timestamp_opt(1_700_000_500, 0).unwrap());
        assert!(peer.handshake_within(std::time::Duration::from_secs(180), now));

        peer.last_handshake_time = Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        assert!(!peer.handshake_within(std::time::Duration::from_secs(180), now));
    }

    #[test]
    fn test_wg_quick_rendering() {
        let config = TunnelConfiguration {
            private_key: Some("secret".into()),
            listen_port: Some(51820),
            addresses: vec![net("fd00:6464::1/64")],
            peers: vec![sample_peer("A", "fd00:6464::10/128")],
        };
        let text = config.to_wg_quick();
        assert!(text.contains("Address = fd00:6464::1/64"));
        assert!(text.contains("Endpoint = [2001:db8::10]:51820"));
        assert!(text.contains("AllowedIPs = fd00:6464::10/128"));
        assert!(text.contains("PersistentKeepalive = 25"));
        assert!(!text.contains("secret"));
    }

    #[test]
    fn test_wg_config_rendering() {
        let config = TunnelConfiguration {
            private_key: Some("secret".into()),
            listen_port: Some(51820),
            addresses: vec![net("fd00:6464::1/64")],
            peers: vec![sample_peer("A", "fd00:6464::10/128")],
        };
        let text = config.to_wg_config();
        assert!(text.contains("PrivateKey = secret\n"));
        assert!(!text.contains("Address"));
        assert!(text.contains("PublicKey = A\n"));
        assert!(text.contains("AllowedIPs = fd00:6464::10/128"));
    }
}
