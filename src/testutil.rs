//! In-memory doubles for the capability traits

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ipnet::IpNet;

use crate::allocator;
use crate::directory::Node;
use crate::error::{Error, Result};
use crate::handshake::{endpoint_host, ControlIdentity, Handshaker};
use crate::host::HostNetwork;
use crate::liveness::Prober;
use crate::tunnel::{PeerEntry, TunnelConfiguration, TunnelDevice};

/// Tunnel device holding its configuration in memory
#[derive(Debug, Default)]
pub struct MemoryTunnel {
    config: Mutex<TunnelConfiguration>,
    writes: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryTunnel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: TunnelConfiguration) -> Self {
        Self {
            config: Mutex::new(config),
            ..Default::default()
        }
    }

    pub fn current(&self) -> TunnelConfiguration {
        self.config.lock().unwrap().clone()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Simulate a completed handshake with a peer
    pub fn record_handshake(&self, public_key: &str, at: DateTime<Utc>) {
        let mut config = self.config.lock().unwrap();
        if let Some(peer) = config.peers.iter_mut().find(|p| p.public_key == public_key) {
            peer.last_handshake_time = Some(at);
        }
    }
}

#[async_trait::async_trait]
impl TunnelDevice for MemoryTunnel {
    async fn get(&self) -> Result<TunnelConfiguration> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Configuration("device unavailable".into()));
        }
        Ok(self.current())
    }

    async fn set(&self, config: &TunnelConfiguration) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Configuration("device rejected configuration".into()));
        }
        let mut stored = config.clone();
        // Runtime state survives only for peers whose key stays
        let current = self.current();
        for peer in &mut stored.peers {
            peer.last_handshake_time = current
                .peer(&peer.public_key)
                .and_then(|p| p.last_handshake_time);
        }
        *self.config.lock().unwrap() = stored;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(vec!["memory0".to_string()])
    }
}

/// Host network that records calls
#[derive(Debug, Default)]
pub struct RecordingHost {
    interfaces: Mutex<Vec<String>>,
    addresses: Mutex<Vec<IpNet>>,
    routes: Mutex<Vec<(IpNet, IpAddr)>>,
    fail_next_route: AtomicBool,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interfaces(&self) -> Vec<String> {
        self.interfaces.lock().unwrap().clone()
    }

    pub fn addresses(&self) -> Vec<IpNet> {
        self.addresses.lock().unwrap().clone()
    }

    pub fn routes(&self) -> Vec<(IpNet, IpAddr)> {
        self.routes.lock().unwrap().clone()
    }

    /// Fail the next route install once
    pub fn fail_next_route(&self) {
        self.fail_next_route.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl HostNetwork for RecordingHost {
    async fn ensure_interface(&self, name: &str) -> Result<()> {
        self.interfaces.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn assign_address(&self, _iface: &str, addr: IpNet) -> Result<()> {
        self.addresses.lock().unwrap().push(addr);
        Ok(())
    }

    async fn install_nat64_route(&self, _iface: &str, prefix: IpNet, via: IpAddr) -> Result<()> {
        if self.fail_next_route.swap(false, Ordering::SeqCst) {
            return Err(Error::HostNetwork("route install failed".into()));
        }
        self.routes.lock().unwrap().push((prefix, via));
        Ok(())
    }
}

/// Prober answering from a fixed set of reachable addresses
#[derive(Debug, Default)]
pub struct ScriptedProber {
    reachable: Mutex<HashSet<IpAddr>>,
    calls: Mutex<Vec<IpAddr>>,
}

impl ScriptedProber {
    pub fn reachable(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            reachable: Mutex::new(addrs.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_reachable(&self, addr: IpAddr, reachable: bool) {
        let mut set = self.reachable.lock().unwrap();
        if reachable {
            set.insert(addr);
        } else {
            set.remove(&addr);
        }
    }

    pub fn calls(&self) -> Vec<IpAddr> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, addr: IpAddr) -> Result<Duration> {
        self.calls.lock().unwrap().push(addr);
        if self.reachable.lock().unwrap().contains(&addr) {
            Ok(Duration::from_millis(1))
        } else {
            Err(Error::Probe {
                address: addr,
                reason: "no reply".into(),
            })
        }
    }
}

/// Handshaker answering with preset agent keys per node id
#[derive(Debug, Default)]
pub struct ScriptedHandshaker {
    keys: Mutex<HashMap<u64, String>>,
    calls: Mutex<Vec<u64>>,
}

impl ScriptedHandshaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make handshakes with a node succeed with this agent key
    pub fn answer(&self, node_id: u64, public_key: impl Into<String>) {
        self.keys.lock().unwrap().insert(node_id, public_key.into());
    }

    /// Make handshakes with a node fail
    pub fn fail(&self, node_id: u64) {
        self.keys.lock().unwrap().remove(&node_id);
    }

    pub fn calls(&self) -> Vec<u64> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Handshaker for ScriptedHandshaker {
    async fn handshake(&self, node: &Node, control: &ControlIdentity) -> Result<PeerEntry> {
        self.calls.lock().unwrap().push(node.id);
        let key = self
            .keys
            .lock()
            .unwrap()
            .get(&node.id)
            .cloned()
            .ok_or_else(|| Error::handshake(node, "connection refused"))?;
        let target = allocator::allocate(&control.interface, node.id);
        Ok(PeerEntry::new(key)
            .with_endpoint(endpoint_host(node.endpoint_address).to_string(), 51820)
            .with_allowed_ip(allocator::host_net(target))
            .with_keepalive(25))
    }
}
