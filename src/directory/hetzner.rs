//! Hetzner Cloud directory
//!
//! Lists servers through the Hetzner Cloud REST API and writes status labels
//! back to them.

use std::collections::BTreeMap;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::Deserialize;

use super::{Node, NodeDirectory, NodePage};
use crate::config::Hetznat64Config;
use crate::error::{Error, Result};

/// Hetzner Cloud API client
#[derive(Debug, Clone)]
pub struct HetznerDirectory {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl HetznerDirectory {
    /// Create a client for an API endpoint
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>, timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Discovery(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    /// Create from the discovery section of the configuration
    pub fn from_config(config: &Hetznat64Config) -> Result<Self> {
        let token = config
            .discovery
            .api_token
            .clone()
            .ok_or_else(|| Error::Config("discovery.api_token is not set".into()))?;
        Self::new(config.discovery.api_endpoint.clone(), token, config.api_timeout())
    }

    async fn get_server(&self, node_id: u64) -> Result<ServerRecord> {
        let url = format!("{}/servers/{}", self.endpoint, node_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| Error::Discovery(format!("GET {}: {}", url, e)))?;
        let body: ServerResponse = decode(response, &url).await?;
        Ok(body.server)
    }
}

#[async_trait::async_trait]
impl NodeDirectory for HetznerDirectory {
    async fn list_page(&self, selector: &str, page: u32) -> Result<NodePage> {
        let url = format!("{}/servers", self.endpoint);
        let page_param = page.to_string();
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[("label_selector", selector), ("page", page_param.as_str())])
            .send()
            .await
            .map_err(|e| Error::Discovery(format!("GET {}: {}", url, e)))?;

        let body: ServersResponse = decode(response, &url).await?;
        tracing::debug!("Page {} of '{}': {} servers", page, selector, body.servers.len());
        body.into_page()
    }

    async fn set_label(&self, node_id: u64, key: &str, value: &str) -> Result<()> {
        // The API replaces the whole label set, so merge into the current one
        let mut labels = self.get_server(node_id).await?.labels;
        labels.insert(key.to_string(), value.to_string());

        let url = format!("{}/servers/{}", self.endpoint, node_id);
        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "labels": labels }))
            .send()
            .await
            .map_err(|e| Error::Discovery(format!("PUT {}: {}", url, e)))?;
        let _: ServerResponse = decode(response, &url).await?;
        Ok(())
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response, url: &str) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(Error::Discovery(format!("{} returned {}: {}", url, status, text.trim())));
    }
    response
        .json()
        .await
        .map_err(|e| Error::Discovery(format!("{}: malformed response: {}", url, e)))
}

// ============ Response Types ============

#[derive(Debug, Deserialize)]
struct ServersResponse {
    servers: Vec<ServerRecord>,
    #[serde(default)]
    meta: Option<Meta>,
}

#[derive(Debug, Deserialize)]
struct ServerResponse {
    server: ServerRecord,
}

#[derive(Debug, Deserialize)]
struct ServerRecord {
    id: u64,
    #[serde(default)]
    name: String,
    public_net: PublicNet,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct PublicNet {
    #[serde(default)]
    ipv6: Option<AddressRecord>,
    #[serde(default)]
    ipv4: Option<AddressRecord>,
}

#[derive(Debug, Deserialize)]
struct AddressRecord {
    ip: String,
}

#[derive(Debug, Deserialize)]
struct Meta {
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    next_page: Option<u32>,
}

impl ServersResponse {
    fn into_page(self) -> Result<NodePage> {
        let next_page = self.meta.and_then(|m| m.pagination).and_then(|p| p.next_page);
        let mut nodes = Vec::with_capacity(self.servers.len());
        for server in self.servers {
            match server.into_node() {
                Some(node) => nodes.push(node),
                None => tracing::warn!("Skipping server without a usable public address"),
            }
        }
        Ok(NodePage { nodes, next_page })
    }
}

impl ServerRecord {
    fn into_node(self) -> Option<Node> {
        // IPv6 comes as the assigned network ("2a01:db8:1:2::/64"); IPv4 as an address
        let endpoint_address = self
            .public_net
            .ipv6
            .as_ref()
            .and_then(|a| parse_public_address(&a.ip))
            .or_else(|| self.public_net.ipv4.as_ref().and_then(|a| parse_public_address(&a.ip)))?;
        let name = if self.name.is_empty() {
            format!("server-{}", self.id)
        } else {
            self.name
        };
        Some(Node {
            id: self.id,
            name,
            endpoint_address,
            labels: self.labels,
        })
    }
}

fn parse_public_address(value: &str) -> Option<IpAddr> {
    value
        .parse::<IpNet>()
        .map(|net| net.addr())
        .or_else(|_| value.parse::<IpAddr>())
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    const LISTING: &str = r#"{
        "servers": [
            {
                "id": 42,
                "name": "web-1",
                "status": "running",
                "public_net": {
                    "ipv4": {"id": 1, "ip": "192.0.2.10", "blocked": false},
                    "ipv6": {"id": 2, "ip": "2001:db8:42::/64", "blocked": false}
                },
                "labels": {"hetznat64.status": "waiting"}
            },
            {
                "id": 43,
                "name": "v4-only",
                "public_net": {"ipv4": {"ip": "192.0.2.11"}, "ipv6": null},
                "labels": {}
            }
        ],
        "meta": {"pagination": {"page": 1, "per_page": 25, "next_page": 2, "last_page": 2}}
    }"#;

    #[test]
    fn test_parse_listing() {
        let response: ServersResponse = serde_json::from_str(LISTING).unwrap();
        let page = response.into_page().unwrap();
        assert_eq!(page.next_page, Some(2));
        assert_eq!(page.nodes.len(), 2);

        let web = &page.nodes[0];
        assert_eq!(web.id, 42);
        assert_eq!(web.name, "web-1");
        assert_eq!(web.endpoint_address, "2001:db8:42::".parse::<IpAddr>().unwrap());
        assert_eq!(web.labels["hetznat64.status"], "waiting");

        assert_eq!(page.nodes[1].endpoint_address, "192.0.2.11".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_parse_without_meta() {
        let response: ServersResponse = serde_json::from_str(r#"{"servers": []}"#).unwrap();
        let page = response.into_page().unwrap();
        assert!(page.nodes.is_empty());
        assert!(page.next_page.is_none());
    }

    #[test]
    fn test_parse_public_address() {
        assert_eq!(parse_public_address("2001:db8::/64"), Some("2001:db8::".parse().unwrap()));
        assert_eq!(parse_public_address("192.0.2.1"), Some("192.0.2.1".parse().unwrap()));
        assert_eq!(parse_public_address("garbage"), None);
    }

    fn server_json(id: u64, labels: &BTreeMap<String, String>) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "name": format!("srv-{}", id),
            "public_net": {"ipv6": {"ip": format!("2001:db8:{:x}::/64", id)}},
            "labels": labels,
        })
    }

    #[tokio::test]
    async fn test_list_and_label_against_api() {
        let labels = Arc::new(Mutex::new(BTreeMap::from([
            ("hetznat64.status".to_string(), "waiting".to_string()),
            ("team".to_string(), "infra".to_string()),
        ])));

        let list_labels = labels.clone();
        let get_labels = labels.clone();
        let put_labels = labels.clone();
        let app = Router::new()
            .route(
                "/servers",
                get(move |Query(q): Query<HashMap<String, String>>| {
                    let labels = list_labels.clone();
                    async move {
                        assert_eq!(q["label_selector"], "hetznat64.status=waiting");
                        let labels = labels.lock().unwrap().clone();
                        let (servers, next) = match q["page"].as_str() {
                            "1" => (vec![server_json(1, &labels)], serde_json::json!(2)),
                            _ => (vec![server_json(2, &labels)], serde_json::Value::Null),
                        };
                        Json(serde_json::json!({
                            "servers": servers,
                            "meta": {"pagination": {"next_page": next}}
                        }))
                    }
                }),
            )
            .route(
                "/servers/:id",
                get(move |Path(id): Path<u64>| {
                    let labels = get_labels.clone();
                    async move {
                        let labels = labels.lock().unwrap().clone();
                        Json(serde_json::json!({ "server": server_json(id, &labels) }))
                    }
                })
                .put(move |Path(id): Path<u64>, Json(body): Json<serde_json::Value>| {
                    let labels = put_labels.clone();
                    async move {
                        let new: BTreeMap<String, String> =
                            serde_json::from_value(body["labels"].clone()).unwrap();
                        *labels.lock().unwrap() = new.clone();
                        Json(serde_json::json!({ "server": server_json(id, &new) }))
                    }
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let directory = HetznerDirectory::new(
            format!("http://{}/", addr),
            "token",
            std::time::Duration::from_secs(5),
        )
        .unwrap();

        let nodes = directory.list_all("hetznat64.status=waiting").await.unwrap();
        assert_eq!(nodes.iter().map(|n| n.id).collect::<Vec<_>>(), vec![1, 2]);

        directory.set_label(1, "hetznat64.status", "connected").await.unwrap();
        let stored = labels.lock().unwrap().clone();
        assert_eq!(stored["hetznat64.status"], "connected");
        assert_eq!(stored["team"], "infra");
    }

    #[tokio::test]
    async fn test_http_error_is_discovery_error() {
        let app = Router::new().route(
            "/servers",
            get(|| async { (axum::http::StatusCode::UNAUTHORIZED, "unauthorized") }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let directory =
            HetznerDirectory::new(format!("http://{}", addr), "bad", std::time::Duration::from_secs(5))
                .unwrap();
        let err = directory.list_page("x", 1).await.unwrap_err();
        assert!(matches!(err, Error::Discovery(_)));
    }

    #[test]
    fn test_from_config_requires_token() {
        let mut config = Hetznat64Config::default();
        config.discovery.api_token = None;
        assert!(matches!(HetznerDirectory::from_config(&config), Err(Error::Config(_))));

        config.discovery.api_token = Some("token".into());
        config.discovery.request_timeout_secs = 3;
        assert_eq!(config.api_timeout(), std::time::Duration::from_secs(3));
        assert!(HetznerDirectory::from_config(&config).is_ok());
    }
}
