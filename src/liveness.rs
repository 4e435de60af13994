//! Liveness Monitoring
//!
//! Reachability checks over the overlay. The control node sweeps every peer
//! that has not completed a cryptographic handshake yet; an agent tracks
//! whether it can reach the control node and exposes that as its health.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::handshake::AgentState;
use crate::tunnel::{PeerEntry, TunnelConfiguration};

/// Agent connectivity towards the control node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// Started, nothing checked yet
    Initializing,
    /// No control node known, or it is unreachable
    Waiting,
    /// Control node reachable over the overlay
    Connected,
}

impl std::fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityState::Initializing => write!(f, "initializing"),
            ConnectivityState::Waiting => write!(f, "waiting"),
            ConnectivityState::Connected => write!(f, "connected"),
        }
    }
}

/// Reachability probe
#[async_trait::async_trait]
pub trait Prober: Send + Sync {
    /// Probe an address, returning the round-trip time
    async fn probe(&self, addr: IpAddr) -> Result<Duration>;
}

/// ICMP echo through the system `ping`
#[derive(Debug, Clone)]
pub struct PingProber {
    timeout: Duration,
}

impl PingProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait::async_trait]
impl Prober for PingProber {
    async fn probe(&self, addr: IpAddr) -> Result<Duration> {
        let start = Instant::now();
        let wait = self.timeout.as_secs().max(1).to_string();

        let output = tokio::time::timeout(
            self.timeout + Duration::from_secs(1),
            Command::new("ping")
                .args(["-c", "1", "-W", &wait, &addr.to_string()])
                .kill_on_drop(true)
                .output(),
        )
        .await;

        let reason = match output {
            Ok(Ok(result)) if result.status.success() => return Ok(start.elapsed()),
            Ok(Ok(_)) => "no reply".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "timeout".to_string(),
        };
        Err(Error::Probe { address: addr, reason })
    }
}

// ============ Control-side sweep ============

/// Outcome of checking one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerHealth {
    /// The device reports a completed handshake
    Handshaken,
    /// No handshake yet, but the probe answered
    Reachable(Duration),
    /// No handshake and no answer
    Unreachable(String),
    /// No single-host allowed address to probe
    NoAddress,
}

impl PeerHealth {
    /// Whether the peer is known to work
    pub fn is_confirmed(&self) -> bool {
        matches!(self, PeerHealth::Handshaken | PeerHealth::Reachable(_))
    }
}

/// Result of a sweep for one peer
#[derive(Debug, Clone)]
pub struct PeerReport {
    pub public_key: String,
    pub address: Option<IpAddr>,
    pub health: PeerHealth,
}

/// Result of a full sweep
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub peers: Vec<PeerReport>,
}

impl SweepReport {
    /// Whether the peer with this key is confirmed
    pub fn is_confirmed(&self, public_key: &str) -> bool {
        self.peers
            .iter()
            .any(|p| p.public_key == public_key && p.health.is_confirmed())
    }

    /// Number of peers that were probed
    pub fn probed(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| matches!(p.health, PeerHealth::Reachable(_) | PeerHealth::Unreachable(_)))
            .count()
    }

    /// Number of peers that failed their probe
    pub fn unreachable(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| matches!(p.health, PeerHealth::Unreachable(_)))
            .count()
    }
}

/// The overlay address a peer answers on: its first single-host allowed IP
pub fn overlay_address(peer: &PeerEntry) -> Option<IpAddr> {
    peer.allowed_ips
        .iter()
        .find(|net| net.prefix_len() == net.max_prefix_len())
        .map(|net| net.addr())
}

/// Probe every peer without a recorded handshake, concurrently.
///
/// Failures are logged and reported, never returned.
pub async fn sweep(config: &TunnelConfiguration, prober: &dyn Prober) -> SweepReport {
    let checks = config.peers.iter().map(|peer| async move {
        let address = overlay_address(peer);
        let health = if peer.last_handshake_time.is_some() {
            PeerHealth::Handshaken
        } else if let Some(addr) = address {
            match prober.probe(addr).await {
                Ok(rtt) => {
                    tracing::info!("Peer {} at {} reachable ({:?})", peer.public_key, addr, rtt);
                    PeerHealth::Reachable(rtt)
                }
                Err(e) => {
                    tracing::warn!("Peer {} at {} not reachable: {}", peer.public_key, addr, e);
                    PeerHealth::Unreachable(e.to_string())
                }
            }
        } else {
            tracing::debug!("Peer {} has no overlay address to probe", peer.public_key);
            PeerHealth::NoAddress
        };
        PeerReport {
            public_key: peer.public_key.clone(),
            address,
            health,
        }
    });

    SweepReport {
        peers: futures::future::join_all(checks).await,
    }
}

// ============ Agent-side monitor ============

/// Tracks the agent's connectivity to the control node
pub struct LivenessMonitor {
    state: Arc<AgentState>,
    prober: Arc<dyn Prober>,
    interval: Duration,
    recheck_every: u32,
    ticks_since_probe: u32,
}

impl LivenessMonitor {
    pub fn new(state: Arc<AgentState>, prober: Arc<dyn Prober>, interval: Duration, recheck_every: u32) -> Self {
        Self {
            state,
            prober,
            interval,
            recheck_every: recheck_every.max(1),
            ticks_since_probe: 0,
        }
    }

    /// Advance the state machine by one tick
    pub async fn tick(&mut self) -> ConnectivityState {
        let Some(control) = self.state.control_address() else {
            self.ticks_since_probe = 0;
            self.state.set_connectivity(ConnectivityState::Waiting);
            return ConnectivityState::Waiting;
        };

        if self.state.connectivity() == ConnectivityState::Connected {
            self.ticks_since_probe += 1;
            if self.ticks_since_probe < self.recheck_every {
                return ConnectivityState::Connected;
            }
        }

        self.ticks_since_probe = 0;
        let next = match self.prober.probe(control).await {
            Ok(_) => ConnectivityState::Connected,
            Err(e) => {
                tracing::debug!("Control node unreachable: {}", e);
                ConnectivityState::Waiting
            }
        };
        self.state.set_connectivity(next);
        next
    }

    /// Tick until shutdown is signalled
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "Liveness monitor started (every {:?}, recheck every {} ticks)",
            self.interval,
            self.recheck_every
        );
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    tracing::info!("Liveness monitor stopping");
                    break;
                }
            }
        }
    }
}
