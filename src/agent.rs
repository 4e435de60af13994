//! Agent HTTP API
//!
//! Serves `/handshake` for the control node plus `/health` and `/ready` for
//! orchestrators, over TLS when a certificate is configured.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tower::Service;
use tower_http::trace::TraceLayer;

use crate::config::Hetznat64Config;
use crate::error::{Error, Result};
use crate::handshake::{AgentSettings, AgentState, HandshakeRequest, HandshakeServer};
use crate::host::HostNetwork;
use crate::liveness::{ConnectivityState, LivenessMonitor, Prober};
use crate::tunnel::{wait_ready, TunnelDevice};

/// Build the agent router
pub fn create_router(server: Arc<HandshakeServer>) -> Router {
    Router::new()
        .route("/handshake", post(handle_handshake))
        .route("/health", get(handle_health))
        .route("/ready", get(handle_ready))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

/// The agent process: handshake endpoint plus liveness monitor
pub struct Agent {
    config: Hetznat64Config,
    server: Arc<HandshakeServer>,
    device: Arc<dyn TunnelDevice>,
    host: Arc<dyn HostNetwork>,
    prober: Arc<dyn Prober>,
}

impl Agent {
    pub fn new(
        config: Hetznat64Config,
        device: Arc<dyn TunnelDevice>,
        host: Arc<dyn HostNetwork>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let server = Arc::new(HandshakeServer::new(
            Arc::new(AgentState::new()),
            device.clone(),
            host.clone(),
            AgentSettings::from_config(&config),
        ));
        Self {
            config,
            server,
            device,
            host,
            prober,
        }
    }

    /// Shared agent state
    pub fn state(&self) -> Arc<AgentState> {
        self.server.state().clone()
    }

    /// Make sure the tunnel interface exists and answers
    pub async fn startup(&self) -> Result<()> {
        let iface = &self.config.wireguard.interface;
        self.host.ensure_interface(iface).await?;
        let config = wait_ready(self.device.as_ref(), crate::control::DEVICE_ATTEMPTS, Duration::from_secs(1)).await?;
        tracing::info!(
            "Tunnel interface {} ready ({} peers configured)",
            iface,
            config.peers.len()
        );
        Ok(())
    }

    /// Serve until shutdown is signalled
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let acceptor = crate::tls::server_acceptor(&self.config.tls)?;
        let listener = TcpListener::bind(&self.config.agent.bind_address).await?;
        let monitor = LivenessMonitor::new(
            self.state(),
            self.prober.clone(),
            self.config.liveness_interval(),
            self.config.agent.recheck_every,
        );
        let monitor_handle = tokio::spawn(monitor.run(shutdown.clone()));

        let router = create_router(self.server.clone());
        let result = match acceptor {
            Some(acceptor) => {
                tracing::info!("Agent listening on https://{}", self.config.agent.bind_address);
                serve_tls(listener, acceptor, router, shutdown).await
            }
            None => {
                tracing::info!("Agent listening on http://{}", self.config.agent.bind_address);
                serve_plain(listener, router, shutdown).await
            }
        };

        if result.is_err() {
            monitor_handle.abort();
        }
        match monitor_handle.await {
            Err(e) if e.is_panic() => tracing::error!("Liveness monitor panicked: {}", e),
            _ => {}
        }
        result
    }
}

async fn wait_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

async fn serve_plain(listener: TcpListener, router: Router, shutdown: watch::Receiver<bool>) -> Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(wait_shutdown(shutdown))
        .await
        .map_err(|e| Error::Internal(format!("HTTP server error: {}", e)))
}

async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let stop = wait_shutdown(shutdown);
    tokio::pin!(stop);

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    continue;
                }
            },
            _ = &mut stop => break,
        };

        let acceptor = acceptor.clone();
        let router = router.clone();
        tokio::spawn(async move {
            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(e) => {
                    tracing::debug!("TLS handshake with {} failed: {}", peer, e);
                    return;
                }
            };
            let service = service_fn(move |req: hyper::Request<Incoming>| router.clone().call(req));
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(tls), service)
                .await
            {
                tracing::debug!("Connection from {} ended: {}", peer, e);
            }
        });
    }
    Ok(())
}

// ============ Request/Response Types ============

/// Error body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Health body
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ConnectivityState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_address: Option<String>,
}

/// Readiness body
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadyResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

fn error_response(err: &Error) -> Response {
    let (status, code) = match err {
        Error::InvalidAddress(_) | Error::InvalidKey(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
        Error::Configuration(_) => (StatusCode::INTERNAL_SERVER_ERROR, "configuration_failed"),
        Error::HostNetwork(_) => (StatusCode::INTERNAL_SERVER_ERROR, "host_network_failed"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

// ============ Handlers ============

async fn handle_handshake(
    State(server): State<Arc<HandshakeServer>>,
    Json(req): Json<HandshakeRequest>,
) -> Response {
    tracing::info!("Handshake from control node {} (agent address {})", req.control_ip, req.agent_ip);
    match server.handshake(&req).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            tracing::error!("Handshake failed: {}", e);
            error_response(&e)
        }
    }
}

async fn handle_health(State(server): State<Arc<HandshakeServer>>) -> impl IntoResponse {
    let state = server.state();
    let connectivity = state.connectivity();
    let status = if connectivity == ConnectivityState::Connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: connectivity,
            control_address: state.control_address().map(|a| a.to_string()),
        }),
    )
}

async fn handle_ready(State(server): State<Arc<HandshakeServer>>) -> impl IntoResponse {
    Json(ReadyResponse {
        status: "ready".to_string(),
        public_key: server.state().public_key(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::HandshakeResponse;
    use crate::keys::TunnelKeyPair;
    use crate::testutil::{MemoryTunnel, RecordingHost};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn settings() -> AgentSettings {
        AgentSettings {
            interface: "hetznat64".into(),
            listen_port: 51820,
            control_hostname: "2001:db8::1".into(),
            control_port: 51820,
            nat64_prefix: "64:ff9b::/96".parse().unwrap(),
            persistent_keepalive: 25,
            resolve_timeout: Duration::from_secs(1),
        }
    }

    fn server(device: Arc<MemoryTunnel>) -> Arc<HandshakeServer> {
        Arc::new(HandshakeServer::new(
            Arc::new(AgentState::new()),
            device,
            Arc::new(RecordingHost::new()),
            settings(),
        ))
    }

    fn handshake_request(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/handshake")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_handshake_endpoint() {
        let device = Arc::new(MemoryTunnel::new());
        let router = create_router(server(device.clone()));
        let control_key = TunnelKeyPair::generate().public_key();

        let response = router
            .oneshot(handshake_request(serde_json::json!({
                "agent_ip": "fd00:6464::6c/128",
                "control_ip": "fd00:6464::1/64",
                "public_key": control_key,
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: HandshakeResponse = body_json(response).await;
        assert_eq!(body.port, 51820);
        assert_eq!(body.public_key.len(), 44);
        assert_eq!(device.writes(), 1);
    }

    #[tokio::test]
    async fn test_handshake_bad_address_is_400() {
        let device = Arc::new(MemoryTunnel::new());
        let router = create_router(server(device.clone()));

        let response = router
            .oneshot(handshake_request(serde_json::json!({
                "agent_ip": "garbage",
                "control_ip": "fd00:6464::1/64",
                "public_key": TunnelKeyPair::generate().public_key(),
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorResponse = body_json(response).await;
        assert_eq!(body.code, "invalid_request");
        assert_eq!(device.writes(), 0);
    }

    #[tokio::test]
    async fn test_handshake_device_failure_is_500() {
        let device = Arc::new(MemoryTunnel::new());
        device.fail_writes(true);
        let router = create_router(server(device));

        let response = router
            .oneshot(handshake_request(serde_json::json!({
                "agent_ip": "fd00:6464::6c/128",
                "control_ip": "fd00:6464::1/64",
                "public_key": TunnelKeyPair::generate().public_key(),
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorResponse = body_json(response).await;
        assert_eq!(body.code, "configuration_failed");
    }

    #[tokio::test]
    async fn test_health_follows_connectivity() {
        let server = server(Arc::new(MemoryTunnel::new()));
        let router = create_router(server.clone());

        let get_health = || Request::builder().uri("/health").body(Body::empty()).unwrap();

        let response = router.clone().oneshot(get_health()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        server.state().set_connectivity(ConnectivityState::Connected);
        let response = router.clone().oneshot(get_health()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: HealthResponse = body_json(response).await;
        assert_eq!(body.status, ConnectivityState::Connected);

        server.state().set_connectivity(ConnectivityState::Waiting);
        let response = router.oneshot(get_health()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_ready() {
        let router = create_router(server(Arc::new(MemoryTunnel::new())));
        let response = router
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: ReadyResponse = body_json(response).await;
        assert_eq!(body.status, "ready");
        assert!(body.public_key.is_none());
    }

    #[tokio::test]
    async fn test_agent_serves_and_shuts_down() {
        let mut config = Hetznat64Config::default();
        config.agent.bind_address = "127.0.0.1:0".into();
        config.agent.liveness_interval_ms = 10;

        let agent = Agent::new(
            config,
            Arc::new(MemoryTunnel::new()),
            Arc::new(RecordingHost::new()),
            Arc::new(crate::testutil::ScriptedProber::reachable(Vec::<std::net::IpAddr>::new())),
        );
        agent.startup().await.unwrap();

        let (tx, rx) = watch::channel(false);
        let state = agent.state();
        let handle = tokio::spawn(async move { agent.run(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.connectivity(), ConnectivityState::Waiting);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    struct PanickingProber;

    #[async_trait::async_trait]
    impl crate::liveness::Prober for PanickingProber {
        async fn probe(&self, _addr: std::net::IpAddr) -> Result<Duration> {
            panic!("prober exploded");
        }
    }

    #[tokio::test]
    async fn test_agent_survives_monitor_panic() {
        let mut config = Hetznat64Config::default();
        config.agent.bind_address = "127.0.0.1:0".into();
        config.agent.liveness_interval_ms = 10;

        let agent = Agent::new(
            config,
            Arc::new(MemoryTunnel::new()),
            Arc::new(RecordingHost::new()),
            Arc::new(PanickingProber),
        );
        agent.startup().await.unwrap();
        agent.state().set_control_address("fd00:6464::1".parse().unwrap());

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { agent.run(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
