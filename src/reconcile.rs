//! Peer Reconciliation
//!
//! Merges freshly handshaken peers into the live tunnel configuration. A new
//! peer displaces every existing peer that routes its overlay address or
//! uses its endpoint, so a node that re-keyed or moved never ends up with
//! two competing entries.

use std::net::IpAddr;

use crate::error::Result;
use crate::tunnel::{PeerEntry, TunnelConfiguration, TunnelDevice};

/// A peer the control node wants installed for a node
#[derive(Debug, Clone)]
pub struct DesiredPeer {
    /// Directory ID of the node
    pub node_id: u64,
    /// Overlay address allocated to the node
    pub target: IpAddr,
    /// Endpoint address the node is reached on
    pub endpoint: IpAddr,
    pub peer: PeerEntry,
}

/// Changes computed for one cycle
#[derive(Debug, Clone)]
pub struct ReconcilePlan {
    /// Existing peers taken out
    pub removed: Vec<PeerEntry>,
    /// Peers put in
    pub added: Vec<PeerEntry>,
    /// Resulting configuration
    pub config: TunnelConfiguration,
}

impl ReconcilePlan {
    /// Whether the resulting configuration differs from `baseline`
    pub fn changes(&self, baseline: &TunnelConfiguration) -> bool {
        !self.config.same_as(baseline)
    }
}

/// Compute the configuration with every desired peer merged in
pub fn plan(baseline: &TunnelConfiguration, desired: &[DesiredPeer]) -> ReconcilePlan {
    let mut config = baseline.clone();
    let mut removed = Vec::new();
    let mut added = Vec::with_capacity(desired.len());

    for want in desired {
        let displaced = config.remove_peers(|p| p.routes(&want.target) || p.endpoint_is(&want.endpoint));
        for old in displaced.iter().filter(|p| p.public_key != want.peer.public_key) {
            tracing::debug!(
                "Node {} peer {} replaces {}",
                want.node_id,
                want.peer.public_key,
                old.public_key
            );
        }
        removed.extend(displaced);
        // A key can only appear once on a device
        removed.extend(config.remove_peers(|p| p.public_key == want.peer.public_key));
        config.peers.push(want.peer.clone());
        added.push(want.peer.clone());
    }

    ReconcilePlan {
        removed,
        added,
        config,
    }
}

/// Write the planned configuration if it differs from `baseline`.
///
/// Returns whether the device was written.
pub async fn apply_if_changed(
    device: &dyn TunnelDevice,
    baseline: &TunnelConfiguration,
    plan: &ReconcilePlan,
) -> Result<bool> {
    if !plan.changes(baseline) {
        tracing::debug!("Tunnel configuration unchanged");
        return Ok(false);
    }

    for peer in &plan.removed {
        if plan.config.peer(&peer.public_key).is_none() {
            tracing::info!("Removing peer {} ({:?})", peer.public_key, peer.endpoint());
        }
    }
    tracing::info!(
        "Applying tunnel configuration ({} peers):\n{}",
        plan.config.peers.len(),
        plan.config.to_wg_quick()
    );
    device.set(&plan.config).await?;
    Ok(true)
}
