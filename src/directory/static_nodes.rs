//! Config-driven node directory
//!
//! Serves a fixed node list from `[[discovery.nodes]]`. Labels written by the
//! control node are kept in memory, so a connected node stops matching the
//! waiting selector just as it would with the cloud provider.

use std::collections::BTreeMap;

use tokio::sync::RwLock;

use super::{LabelSelector, Node, NodeDirectory, NodePage};
use crate::config::DiscoveryConfig;
use crate::error::{Error, Result};

/// In-memory node directory
#[derive(Debug, Default)]
pub struct StaticDirectory {
    nodes: RwLock<BTreeMap<u64, Node>>,
}

impl StaticDirectory {
    /// Create from a node list
    pub fn new(nodes: impl IntoIterator<Item = Node>) -> Self {
        Self {
            nodes: RwLock::new(nodes.into_iter().map(|n| (n.id, n)).collect()),
        }
    }

    /// Create from the discovery configuration.
    ///
    /// Nodes without a status label start out waiting.
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        let status_key = format!("{}.status", config.label_prefix);
        Self::new(config.nodes.iter().map(|n| {
            let mut labels = n.labels.clone();
            labels
                .entry(status_key.clone())
                .or_insert_with(|| "waiting".to_string());
            Node {
                id: n.id,
                name: n.name.clone().unwrap_or_else(|| format!("node-{}", n.id)),
                endpoint_address: n.address,
                labels,
            }
        }))
    }

    /// Current labels of a node
    pub async fn labels(&self, node_id: u64) -> Option<BTreeMap<String, String>> {
        self.nodes.read().await.get(&node_id).map(|n| n.labels.clone())
    }
}

#[async_trait::async_trait]
impl NodeDirectory for StaticDirectory {
    async fn list_page(&self, selector: &str, page: u32) -> Result<NodePage> {
        if page > 1 {
            return Ok(NodePage::default());
        }
        let selector = LabelSelector::parse(selector);
        let nodes = self
            .nodes
            .read()
            .await
            .values()
            .filter(|n| selector.matches(&n.labels))
            .cloned()
            .collect();
        Ok(NodePage { nodes, next_page: None })
    }

    async fn set_label(&self, node_id: u64, key: &str, value: &str) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(&node_id)
            .ok_or_else(|| Error::Discovery(format!("unknown node {}", node_id)))?;
        node.labels.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
