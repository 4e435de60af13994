//! Control-side handshake client

use std::net::{IpAddr, Ipv6Addr};
use std::time::Duration;

use super::{ControlIdentity, HandshakeRequest, HandshakeResponse, Handshaker};
use crate::allocator;
use crate::config::Hetznat64Config;
use crate::directory::Node;
use crate::error::{Error, Result};
use crate::keys::validate_key;
use crate::tunnel::PeerEntry;

/// Correct a provider-reported endpoint.
///
/// IPv6 endpoints arrive as the node's /64 network; the subnet-router
/// anycast address (all host bits zero) is not the node, so the first host
/// address `::1` is used instead.
pub fn endpoint_host(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) if u128::from(v6) & u128::from(u64::MAX) == 0 => {
            IpAddr::V6(Ipv6Addr::from(u128::from(v6) | 1))
        }
        other => other,
    }
}

/// HTTP(S) handshake client
#[derive(Debug, Clone)]
pub struct HandshakeClient {
    client: reqwest::Client,
    scheme: &'static str,
    agent_port: u16,
    persistent_keepalive: u16,
}

impl HandshakeClient {
    pub fn new(client: reqwest::Client, tls: bool, agent_port: u16, persistent_keepalive: u16) -> Self {
        Self {
            client,
            scheme: if tls { "https" } else { "http" },
            agent_port,
            persistent_keepalive,
        }
    }

    /// Build from configuration, with mTLS when TLS material is configured
    pub fn from_config(config: &Hetznat64Config) -> Result<Self> {
        let client = crate::tls::http_client(&config.tls, config.handshake_timeout())?;
        Ok(Self::new(
            client,
            config.tls_enabled(),
            config.control.agent_port,
            config.wireguard.persistent_keepalive_secs,
        ))
    }

    /// Plain HTTP client with a request timeout
    pub fn plain(timeout: Duration, agent_port: u16, persistent_keepalive: u16) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::new(client, false, agent_port, persistent_keepalive))
    }

    fn url(&self, host: IpAddr) -> String {
        match host {
            IpAddr::V6(v6) => format!("{}://[{}]:{}/handshake", self.scheme, v6, self.agent_port),
            IpAddr::V4(v4) => format!("{}://{}:{}/handshake", self.scheme, v4, self.agent_port),
        }
    }

    /// Handshake with a node's agent
    pub async fn request_handshake(&self, node: &Node, control: &ControlIdentity) -> Result<PeerEntry> {
        let target = allocator::allocate(&control.interface, node.id);
        let host = endpoint_host(node.endpoint_address);
        let url = self.url(host);

        let request = HandshakeRequest {
            agent_ip: allocator::host_net(target).to_string(),
            control_ip: control.interface.to_string(),
            control_port: Some(control.port),
            public_key: control.public_key.clone(),
            preshared_key: None,
        };

        tracing::debug!("Handshake with {} at {} (overlay {})", node, url, target);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                let reason = if e.is_timeout() {
                    "timed out".to_string()
                } else {
                    e.to_string()
                };
                Error::handshake(node, reason)
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::handshake(node, format!("agent returned {}", status)));
        }

        let answer: HandshakeResponse = response
            .json()
            .await
            .map_err(|e| Error::handshake(node, format!("malformed response: {}", e)))?;
        validate_key(&answer.public_key)
            .map_err(|e| Error::handshake(node, e))?;

        Ok(PeerEntry::new(answer.public_key)
            .with_endpoint(host.to_string(), answer.port)
            .with_allowed_ip(allocator::host_net(target))
            .with_keepalive(self.persistent_keepalive))
    }
}

#[async_trait::async_trait]
impl Handshaker for HandshakeClient {
    async fn handshake(&self, node: &Node, control: &ControlIdentity) -> Result<PeerEntry> {
        self.request_handshake(node, control).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::TunnelKeyPair;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::collections::BTreeMap;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    fn node(id: u64, addr: &str) -> Node {
        Node {
            id,
            name: format!("node-{}", id),
            endpoint_address: addr.parse().unwrap(),
            labels: BTreeMap::new(),
        }
    }

    fn control() -> ControlIdentity {
        ControlIdentity {
            interface: "fd00:6464::1/64".parse().unwrap(),
            port: 51820,
            public_key: TunnelKeyPair::generate().public_key(),
        }
    }

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[test]
    fn test_endpoint_host_correction() {
        let network: IpAddr = "2001:db8:1:2::".parse().unwrap();
        assert_eq!(endpoint_host(network), "2001:db8:1:2::1".parse::<IpAddr>().unwrap());

        let host: IpAddr = "2001:db8:1:2::5".parse().unwrap();
        assert_eq!(endpoint_host(host), host);

        let v4: IpAddr = "192.0.2.1".parse().unwrap();
        assert_eq!(endpoint_host(v4), v4);
    }

    #[tokio::test]
    async fn test_successful_handshake() {
        let agent_key = TunnelKeyPair::generate().public_key();
        let seen = Arc::new(Mutex::new(None));

        let key = agent_key.clone();
        let recorded = seen.clone();
        let app = Router::new().route(
            "/handshake",
            post(move |Json(request): Json<HandshakeRequest>| {
                let key = key.clone();
                let recorded = recorded.clone();
                async move {
                    *recorded.lock().unwrap() = Some(request);
                    Json(HandshakeResponse { public_key: key, port: 51999 })
                }
            }),
        );
        let addr = serve(app).await;

        let client = HandshakeClient::plain(Duration::from_secs(5), addr.port(), 25).unwrap();
        let control = control();
        let peer = client
            .request_handshake(&node(100, "127.0.0.1"), &control)
            .await
            .unwrap();

        assert_eq!(peer.public_key, agent_key);
        assert_eq!(peer.endpoint_host.as_deref(), Some("127.0.0.1"));
        assert_eq!(peer.endpoint_port, Some(51999));
        assert_eq!(peer.persistent_keepalive, Some(25));
        assert!(peer.routes(&"fd00:6464::6c".parse().unwrap()));
        assert_eq!(peer.allowed_ips.len(), 1);

        let request = seen.lock().unwrap().clone().unwrap();
        assert_eq!(request.agent_ip, "fd00:6464::6c/128");
        assert_eq!(request.control_ip, "fd00:6464::1/64");
        assert_eq!(request.control_port, Some(51820));
        assert_eq!(request.public_key, control.public_key);
    }

    #[tokio::test]
    async fn test_error_status_is_handshake_error() {
        let app = Router::new().route(
            "/handshake",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let addr = serve(app).await;

        let client = HandshakeClient::plain(Duration::from_secs(5), addr.port(), 25).unwrap();
        let err = client
            .request_handshake(&node(1, "127.0.0.1"), &control())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handshake { .. }));
    }

    #[tokio::test]
    async fn test_malformed_body_is_handshake_error() {
        let app = Router::new().route(
            "/handshake",
            post(|| async { Json(serde_json::json!({"public_key": "short", "port": 1})) }),
        );
        let addr = serve(app).await;

        let client = HandshakeClient::plain(Duration::from_secs(5), addr.port(), 25).unwrap();
        let err = client
            .request_handshake(&node(1, "127.0.0.1"), &control())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handshake { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_handshake_error() {
        // Bind then drop to get a port with nothing listening
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = HandshakeClient::plain(Duration::from_millis(500), port, 25).unwrap();
        let err = client
            .request_handshake(&node(1, "127.0.0.1"), &control())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handshake { .. }));
    }

    #[tokio::test]
    async fn test_slow_agent_times_out() {
        let app = Router::new().route(
            "/handshake",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                StatusCode::OK
            }),
        );
        let addr = serve(app).await;

        let client = HandshakeClient::plain(Duration::from_millis(200), addr.port(), 25).unwrap();
        let err = client
            .request_handshake(&node(1, "127.0.0.1"), &control())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
