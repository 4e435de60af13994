//! Agent-side handshake handling
//!
//! The agent owns one key pair for its whole lifetime, created on the first
//! handshake. Every handshake recomputes the single-peer configuration
//! pointing at the control node and applies it only when the peer identity
//! actually changed.

use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ipnet::IpNet;
use tokio::sync::watch;

use super::{HandshakeRequest, HandshakeResponse};
use crate::allocator;
use crate::config::Hetznat64Config;
use crate::error::{Error, Result};
use crate::host::HostNetwork;
use crate::keys::{validate_key, TunnelKeyPair};
use crate::liveness::ConnectivityState;
use crate::tunnel::{PeerEntry, TunnelConfiguration, TunnelDevice};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// State shared between the handshake handler and the liveness monitor
#[derive(Debug)]
pub struct AgentState {
    key: Mutex<Option<TunnelKeyPair>>,
    control_address: Mutex<Option<IpAddr>>,
    assigned_address: Mutex<Option<IpNet>>,
    installed_route: Mutex<Option<(IpNet, IpAddr)>>,
    connectivity: watch::Sender<ConnectivityState>,
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentState {
    pub fn new() -> Self {
        let (connectivity, _) = watch::channel(ConnectivityState::Initializing);
        Self {
            key: Mutex::new(None),
            control_address: Mutex::new(None),
            assigned_address: Mutex::new(None),
            installed_route: Mutex::new(None),
            connectivity,
        }
    }

    /// The agent key pair, generated on first use
    pub fn key_or_generate(&self) -> TunnelKeyPair {
        lock(&self.key)
            .get_or_insert_with(|| {
                let generated = TunnelKeyPair::generate();
                tracing::info!("Generated agent key {}", generated.public_key());
                generated
            })
            .clone()
    }

    /// Public key, if one has been generated
    pub fn public_key(&self) -> Option<String> {
        lock(&self.key).as_ref().map(|k| k.public_key())
    }

    /// Control node's overlay address, once a handshake has happened
    pub fn control_address(&self) -> Option<IpAddr> {
        *lock(&self.control_address)
    }

    pub fn set_control_address(&self, addr: IpAddr) {
        *lock(&self.control_address) = Some(addr);
    }

    /// Overlay address currently assigned to the interface
    pub fn assigned_address(&self) -> Option<IpNet> {
        *lock(&self.assigned_address)
    }

    pub fn set_assigned_address(&self, addr: IpNet) {
        *lock(&self.assigned_address) = Some(addr);
    }

    /// NAT64 route last installed successfully, as (prefix, via)
    pub fn installed_route(&self) -> Option<(IpNet, IpAddr)> {
        *lock(&self.installed_route)
    }

    pub fn set_installed_route(&self, prefix: IpNet, via: IpAddr) {
        *lock(&self.installed_route) = Some((prefix, via));
    }

    /// Current connectivity
    pub fn connectivity(&self) -> ConnectivityState {
        *self.connectivity.borrow()
    }

    /// Record connectivity, logging transitions
    pub fn set_connectivity(&self, next: ConnectivityState) {
        let previous = self.connectivity.send_replace(next);
        if previous != next {
            tracing::info!("Connectivity {} -> {}", previous, next);
        }
    }

    /// Watch connectivity changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.connectivity.subscribe()
    }
}

/// Agent settings that shape the generated configuration
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub interface: String,
    pub listen_port: u16,
    pub control_hostname: String,
    pub control_port: u16,
    pub nat64_prefix: IpNet,
    pub persistent_keepalive: u16,
    pub resolve_timeout: Duration,
}

impl AgentSettings {
    pub fn from_config(config: &Hetznat64Config) -> Self {
        Self {
            interface: config.wireguard.interface.clone(),
            listen_port: config.wireguard.listen_port,
            control_hostname: config.agent.control_hostname.clone(),
            control_port: config.agent.control_port,
            nat64_prefix: config.agent.nat64_prefix,
            persistent_keepalive: config.wireguard.persistent_keepalive_secs,
            resolve_timeout: Duration::from_secs(5),
        }
    }
}

/// Resolve a hostname to an IPv6 address, bounded by a timeout
pub async fn resolve_ipv6(host: &str, timeout: Duration) -> Result<IpAddr> {
    if let Ok(addr) = host.parse::<IpAddr>() {
        return Ok(addr);
    }
    let failed = |reason: String| Error::Resolution {
        host: host.to_string(),
        reason,
    };

    let addrs = tokio::time::timeout(timeout, tokio::net::lookup_host((host, 0)))
        .await
        .map_err(|_| failed("timed out".into()))?
        .map_err(|e| failed(e.to_string()))?;
    addrs
        .map(|a| a.ip())
        .find(IpAddr::is_ipv6)
        .ok_or_else(|| failed("no IPv6 address".into()))
}

/// Handles handshakes on the agent
pub struct HandshakeServer {
    state: Arc<AgentState>,
    device: Arc<dyn TunnelDevice>,
    host: Arc<dyn HostNetwork>,
    settings: AgentSettings,
    apply: tokio::sync::Mutex<()>,
}

impl HandshakeServer {
    pub fn new(
        state: Arc<AgentState>,
        device: Arc<dyn TunnelDevice>,
        host: Arc<dyn HostNetwork>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            state,
            device,
            host,
            settings,
            apply: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> &Arc<AgentState> {
        &self.state
    }

    async fn control_endpoint(&self) -> String {
        let host = &self.settings.control_hostname;
        match resolve_ipv6(host, self.settings.resolve_timeout).await {
            Ok(addr) => addr.to_string(),
            Err(e) => {
                tracing::warn!("{}; using '{}' as the endpoint", e, host);
                host.clone()
            }
        }
    }

    /// Configuration the agent should run after this handshake
    fn desired_config(
        &self,
        key: &TunnelKeyPair,
        request: &HandshakeRequest,
        agent: IpNet,
        control: IpAddr,
        endpoint: String,
    ) -> TunnelConfiguration {
        let mut peer = PeerEntry::new(request.public_key.clone())
            .with_endpoint(endpoint, request.control_port.unwrap_or(self.settings.control_port))
            .with_allowed_ip(allocator::host_net(control))
            .with_allowed_ip(self.settings.nat64_prefix)
            .with_keepalive(self.settings.persistent_keepalive);
        peer.preshared_key = request.preshared_key.clone();

        TunnelConfiguration {
            private_key: Some(key.private_key()),
            listen_port: Some(self.settings.listen_port),
            addresses: vec![agent],
            peers: vec![peer],
        }
    }

    /// Handle one handshake request
    pub async fn handshake(&self, request: &HandshakeRequest) -> Result<HandshakeResponse> {
        let control_net = request.control_interface()?;
        let agent_net = allocator::with_prefix_of(request.agent_address()?, &control_net)?;
        let control_addr = control_net.addr();
        validate_key(&request.public_key)?;
        if let Some(psk) = &request.preshared_key {
            validate_key(psk)?;
        }

        let key = self.state.key_or_generate();
        let endpoint = self.control_endpoint().await;
        let desired = self.desired_config(&key, request, agent_net, control_addr, endpoint);

        {
            let _guard = self.apply.lock().await;

            let active = self.device.get().await?;
            let identity_changed = active.peer_keys() != desired.peer_keys()
                || active.private_key != desired.private_key
                || active.listen_port != desired.listen_port;
            let address_changed = self.state.assigned_address() != Some(agent_net);

            if address_changed {
                self.host.assign_address(&self.settings.interface, agent_net).await?;
                self.state.set_assigned_address(agent_net);
            }

            if identity_changed {
                tracing::info!(
                    "Applying configuration for control node {}:\n{}",
                    control_addr,
                    desired.to_wg_quick()
                );
                self.device.set(&desired).await?;
            } else {
                tracing::debug!("Control peer unchanged, configuration left alone");
            }

            let route = (self.settings.nat64_prefix, control_addr);
            if identity_changed || address_changed || self.state.installed_route() != Some(route) {
                self.host
                    .install_nat64_route(&self.settings.interface, route.0, route.1)
                    .await?;
                self.state.set_installed_route(route.0, route.1);
            }
        }

        self.state.set_control_address(control_addr);

        Ok(HandshakeResponse {
            public_key: key.public_key(),
            port: self.settings.listen_port,
        })
    }
}
