//! Control Loop
//!
//! Polls the directory for mesh nodes, hands out overlay addresses,
//! handshakes with each node's agent and keeps the control node's tunnel
//! configuration in line with the results.
//!
//! Nodes labelled `connected` stay in the listing: a node without a live
//! peer is handshaken again whatever its label says, which rebuilds the
//! mesh after a control restart or an agent re-key.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::allocator;
use crate::config::Hetznat64Config;
use crate::directory::{Node, NodeDirectory};
use crate::error::Result;
use crate::handshake::{endpoint_host, ControlIdentity, Handshaker};
use crate::host::HostNetwork;
use crate::keys::TunnelKeyPair;
use crate::liveness::{self, Prober, SweepReport};
use crate::reconcile::{self, DesiredPeer};
use crate::tunnel::{wait_ready, TunnelConfiguration, TunnelDevice};

/// How long startup waits for the tunnel device, in one-second attempts
pub const DEVICE_ATTEMPTS: u32 = 30;

const WAITING: &str = "waiting";
const CONNECTED: &str = "connected";

/// Summary of one reconciliation cycle
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Waiting and connected nodes reported by the directory
    pub discovered: usize,
    /// Nodes already served by a live peer
    pub skipped: usize,
    /// Successful handshakes
    pub handshaken: usize,
    /// Failed handshakes
    pub failed: usize,
    /// Whether the tunnel device was written
    pub applied: bool,
    /// Liveness sweep after the update
    pub sweep: SweepReport,
    /// Nodes whose status label changed
    pub labelled: usize,
}

/// Collaborators of the control loop
pub struct ControlDeps {
    pub directory: Arc<dyn NodeDirectory>,
    pub handshaker: Arc<dyn Handshaker>,
    pub device: Arc<dyn TunnelDevice>,
    pub host: Arc<dyn HostNetwork>,
    pub prober: Arc<dyn Prober>,
}

/// The control node's reconciliation loop
pub struct ControlLoop {
    config: Hetznat64Config,
    key: TunnelKeyPair,
    identity: ControlIdentity,
    deps: ControlDeps,
}

impl ControlLoop {
    pub fn new(config: Hetznat64Config, key: TunnelKeyPair, deps: ControlDeps) -> Self {
        let identity = ControlIdentity {
            interface: config.wireguard.address,
            port: config.wireguard.listen_port,
            public_key: key.public_key(),
        };
        Self {
            config,
            key,
            identity,
            deps,
        }
    }

    /// Bring up the interface and install the control identity.
    ///
    /// Peers already on the device are kept when it runs our key.
    pub async fn startup(&self) -> Result<()> {
        let iface = &self.config.wireguard.interface;
        self.deps.host.ensure_interface(iface).await?;
        self.deps
            .host
            .assign_address(iface, self.config.wireguard.address)
            .await?;

        let existing = wait_ready(self.deps.device.as_ref(), DEVICE_ATTEMPTS, Duration::from_secs(1)).await?;
        let peers = if existing.private_key == Some(self.key.private_key()) {
            tracing::info!("Keeping {} existing peers", existing.peers.len());
            existing.peers
        } else {
            Vec::new()
        };
        let mut initial = TunnelConfiguration {
            peers,
            ..Default::default()
        };
        self.normalize(&mut initial);
        self.deps.device.set(&initial).await?;

        tracing::info!(
            "Control node {} listening on port {} with key {}",
            self.identity.interface,
            self.identity.port,
            self.identity.public_key
        );
        match self.deps.device.list().await {
            Ok(interfaces) => {
                for name in interfaces {
                    tracing::info!("Found tunnel interface {}", name);
                }
            }
            Err(e) => tracing::warn!("Could not list tunnel interfaces: {}", e),
        }
        Ok(())
    }

    fn normalize(&self, config: &mut TunnelConfiguration) {
        config.private_key = Some(self.key.private_key());
        config.listen_port = Some(self.config.wireguard.listen_port);
        config.addresses = vec![self.config.wireguard.address];
    }

    /// Whether the device already holds a working peer for a node
    fn has_live_peer(&self, config: &TunnelConfiguration, target: IpAddr, endpoint: IpAddr) -> bool {
        let now = Utc::now();
        let freshness = self.config.handshake_freshness();
        config.peers.iter().any(|p| {
            p.routes(&target) && p.endpoint_is(&endpoint) && p.handshake_within(freshness, now)
        })
    }

    /// Run one reconciliation cycle.
    ///
    /// Directory and device failures abort the cycle; per-node failures
    /// only skip that node.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let label = self.config.status_label();
        let nodes: Vec<Node> = self
            .deps
            .directory
            .list_all(&self.config.member_selector())
            .await?
            .into_iter()
            .filter(|n| matches!(n.labels.get(&label).map(String::as_str), Some(WAITING | CONNECTED)))
            .collect();
        report.discovered = nodes.len();

        // The device does not report interface addresses
        let mut baseline = self.deps.device.get().await?;
        baseline.addresses = vec![self.config.wireguard.address];

        let mut desired = Vec::new();
        for node in &nodes {
            let target = allocator::allocate(&self.identity.interface, node.id);
            let endpoint = endpoint_host(node.endpoint_address);

            if self.has_live_peer(&baseline, target, endpoint) {
                tracing::debug!("Node {} already connected at {}", node, target);
                report.skipped += 1;
                continue;
            }

            tracing::info!("Node {} at {} has no live peer, handshaking (overlay {})", node, endpoint, target);
            match self.deps.handshaker.handshake(node, &self.identity).await {
                Ok(peer) => {
                    report.handshaken += 1;
                    desired.push(DesiredPeer {
                        node_id: node.id,
                        target,
                        endpoint,
                        peer,
                    });
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!("{}", e);
                }
            }
        }

        let mut start = baseline.clone();
        self.normalize(&mut start);
        let plan = reconcile::plan(&start, &desired);
        report.applied = reconcile::apply_if_changed(self.deps.device.as_ref(), &baseline, &plan).await?;

        let live = if report.applied {
            match self.deps.device.get().await {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Could not re-read tunnel configuration: {}", e);
                    plan.config.clone()
                }
            }
        } else {
            baseline
        };

        report.sweep = liveness::sweep(&live, self.deps.prober.as_ref()).await;
        if self.config.control.publish_status {
            report.labelled = self.publish_status(&nodes, &live, &report.sweep).await;
        }

        tracing::debug!(
            "Cycle done: {} nodes, {} skipped, {} handshaken, {} failed, applied={}",
            report.discovered,
            report.skipped,
            report.handshaken,
            report.failed,
            report.applied
        );
        Ok(report)
    }

    /// Label confirmed nodes connected and unconfirmed ones waiting
    async fn publish_status(&self, nodes: &[Node], live: &TunnelConfiguration, sweep: &SweepReport) -> usize {
        let label = self.config.status_label();
        let mut labelled = 0;
        for node in nodes {
            let target = allocator::allocate(&self.identity.interface, node.id);
            let endpoint = endpoint_host(node.endpoint_address);
            let confirmed = live
                .peers
                .iter()
                .filter(|p| p.routes(&target) && p.endpoint_is(&endpoint))
                .any(|p| sweep.is_confirmed(&p.public_key));

            let status = if confirmed { CONNECTED } else { WAITING };
            if node.labels.get(&label).map(String::as_str) == Some(status) {
                continue;
            }
            match self.deps.directory.set_label(node.id, &label, status).await {
                Ok(()) => {
                    tracing::info!("Node {} is now {}", node, status);
                    labelled += 1;
                }
                Err(e) => tracing::warn!("Failed to label node {}: {}", node, e),
            }
        }
        labelled
    }

    /// Run cycles until shutdown is signalled
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.poll_interval();
        tracing::info!("Control loop started (poll every {:?})", interval);

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_cycle().await {
                Ok(_) => {}
                Err(e) if e.is_retryable() => tracing::warn!("Reconciliation cycle failed, retrying: {}", e),
                Err(e) => tracing::error!("Reconciliation cycle failed: {}", e),
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("Control loop stopped");
    }
}

/// Load the control key from the configured file, or generate one
pub fn control_key(config: &Hetznat64Config) -> Result<TunnelKeyPair> {
    match &config.wireguard.private_key_file {
        Some(path) => TunnelKeyPair::load_or_generate(path),
        None => {
            tracing::info!("No private_key_file configured, using a fresh key");
            Ok(TunnelKeyPair::generate())
        }
    }
}
