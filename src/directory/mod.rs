//! Node Directory
//!
//! Discovery of the nodes waiting to join the mesh, and the status labels
//! fed back once they have.

mod hetzner;
mod static_nodes;

pub use hetzner::HetznerDirectory;
pub use static_nodes::StaticDirectory;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{DiscoveryProvider, Hetznat64Config};
use crate::error::{Error, Result};

/// Upper bound on pages fetched by `list_all`
const MAX_PAGES: u32 = 1000;

/// A discovered node. Snapshot of a single poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Provider-assigned identifier
    pub id: u64,
    /// Display name
    pub name: String,
    /// Public endpoint address
    pub endpoint_address: IpAddr,
    /// Provider labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// One page of a listing
#[derive(Debug, Clone, Default)]
pub struct NodePage {
    pub nodes: Vec<Node>,
    /// Next page number, if there is one
    pub next_page: Option<u32>,
}

/// Cloud node discovery capability
#[async_trait::async_trait]
pub trait NodeDirectory: Send + Sync {
    /// List one page of nodes matching a label selector (pages start at 1)
    async fn list_page(&self, selector: &str, page: u32) -> Result<NodePage>;

    /// Set a label on a node
    async fn set_label(&self, node_id: u64, key: &str, value: &str) -> Result<()>;

    /// List every node matching a label selector, following pagination
    async fn list_all(&self, selector: &str) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        let mut page = 1;
        loop {
            let result = self.list_page(selector, page).await?;
            nodes.extend(result.nodes);
            match result.next_page {
                Some(next) if next > page && next <= MAX_PAGES => page = next,
                Some(next) if next <= page => {
                    return Err(Error::Discovery(format!(
                        "pagination did not advance past page {} (next={})",
                        page, next
                    )));
                }
                Some(_) => {
                    return Err(Error::Discovery(format!(
                        "more than {} pages of nodes",
                        MAX_PAGES
                    )));
                }
                None => return Ok(nodes),
            }
        }
    }
}

/// Build the configured directory
pub fn from_config(config: &Hetznat64Config) -> Result<Arc<dyn NodeDirectory>> {
    match config.discovery.provider {
        DiscoveryProvider::Hetzner => Ok(Arc::new(HetznerDirectory::from_config(config)?)),
        DiscoveryProvider::Static => Ok(Arc::new(StaticDirectory::from_config(&config.discovery))),
    }
}

/// A parsed label selector: comma-separated `key=value` or bare `key` terms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSelector {
    terms: Vec<(String, Option<String>)>,
}

impl LabelSelector {
    /// Parse a selector string
    pub fn parse(selector: &str) -> Self {
        let terms = selector
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| match t.split_once('=') {
                Some((k, v)) => (k.trim().to_string(), Some(v.trim().to_string())),
                None => (t.to_string(), None),
            })
            .collect();
        Self { terms }
    }

    /// Whether a label set satisfies every term
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.terms.iter().all(|(key, value)| match (labels.get(key), value) {
            (Some(actual), Some(expected)) => actual == expected,
            (Some(_), None) => true,
            (None, _) => false,
        })
    }
}
