//! WireGuard userspace control socket
//!
//! Speaks the `get=1` / `set=1` protocol on `/var/run/wireguard/<iface>.sock`.
//! Only userspace implementations (wireguard-go, boringtun) create the
//! socket; kernel links go through [`super::WgCommandDevice`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use ipnet::IpNet;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use super::{PeerEntry, TunnelConfiguration, TunnelDevice};
use crate::error::{Error, Result};
use crate::keys::{base64_to_hex, hex_to_base64};

/// Tunnel device backed by the userspace control socket
#[derive(Debug, Clone)]
pub struct UapiDevice {
    interface: String,
    socket_dir: PathBuf,
    timeout: Duration,
}

impl UapiDevice {
    /// Device for an interface in a custom socket directory
    pub fn with_socket_dir(interface: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            interface: interface.into(),
            socket_dir: dir.into(),
            timeout: Duration::from_secs(5),
        }
    }

    fn socket_path(&self) -> PathBuf {
        self.socket_dir.join(format!("{}.sock", self.interface))
    }

    async fn exchange(&self, request: &str) -> Result<String> {
        let path = self.socket_path();
        let fut = async {
            let mut stream = UnixStream::connect(&path).await?;
            stream.write_all(request.as_bytes()).await?;
            stream.shutdown().await?;
            let mut response = String::new();
            stream.read_to_string(&mut response).await?;
            Ok::<_, std::io::Error>(response)
        };

        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(Error::Configuration(format!(
                "{}: {}",
                path.display(),
                e
            ))),
            Err(_) => Err(Error::Configuration(format!(
                "{}: timed out",
                path.display()
            ))),
        }
    }
}

#[async_trait::async_trait]
impl TunnelDevice for UapiDevice {
    async fn get(&self) -> Result<TunnelConfiguration> {
        let response = self.exchange("get=1\n\n").await?;
        check_errno(&response)?;
        parse_get_response(&response)
    }

    async fn set(&self, config: &TunnelConfiguration) -> Result<()> {
        let body = render_set_request(config).await?;
        let response = self.exchange(&body).await?;
        check_errno(&response)?;
        tracing::debug!(
            "Applied configuration to {} ({} peers)",
            self.interface,
            config.peers.len()
        );
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        list_sockets(&self.socket_dir).await
    }
}

async fn list_sockets(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(Error::Configuration(format!("{}: {}", dir.display(), e))),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("sock") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn check_errno(response: &str) -> Result<()> {
    let errno = response
        .lines()
        .rev()
        .find_map(|l| l.trim().strip_prefix("errno="));
    match errno {
        Some("0") => Ok(()),
        Some(code) => Err(Error::Configuration(format!("device returned errno={}", code))),
        None => Err(Error::Configuration("device response missing errno".into())),
    }
}

/// Parse a `get=1` response.
///
/// Interface fields come first; each `public_key=` line opens a peer block.
fn parse_get_response(response: &str) -> Result<TunnelConfiguration> {
    let mut config = TunnelConfiguration::default();
    let mut current: Option<PeerEntry> = None;

    for line in response.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("errno=") {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };

        match (key, current.as_mut()) {
            ("private_key", None) => {
                if !is_zero_key(value) {
                    config.private_key = Some(hex_to_base64(value)?);
                }
            }
            ("listen_port", None) => {
                config.listen_port = value.parse().ok().filter(|p| *p != 0);
            }
            ("public_key", _) => {
                if let Some(peer) = current.take() {
                    config.peers.push(peer);
                }
                current = Some(PeerEntry::new(hex_to_base64(value)?));
            }
            ("preshared_key", Some(peer)) => {
                if !is_zero_key(value) {
                    peer.preshared_key = Some(hex_to_base64(value)?);
                }
            }
            ("endpoint", Some(peer)) => {
                if let Some((host, port)) = split_endpoint(value) {
                    peer.endpoint_host = Some(host);
                    peer.endpoint_port = Some(port);
                }
            }
            ("allowed_ip", Some(peer)) => {
                let net: IpNet = value
                    .parse()
                    .map_err(|_| Error::Configuration(format!("bad allowed_ip '{}'", value)))?;
                peer.allowed_ips.insert(net);
            }
            ("persistent_keepalive_interval", Some(peer)) => {
                peer.persistent_keepalive = value.parse().ok().filter(|k| *k != 0);
            }
            ("last_handshake_time_sec", Some(peer)) => {
                if let Ok(secs) = value.parse::<i64>() {
                    if secs > 0 {
                        peer.last_handshake_time = Utc.timestamp_opt(secs, 0).single();
                    }
                }
            }
            // fwmark, rx_bytes, tx_bytes, protocol_version, ...
            _ => {}
        }
    }

    if let Some(peer) = current {
        config.peers.push(peer);
    }
    Ok(config)
}

fn is_zero_key(hex_key: &str) -> bool {
    hex_key.bytes().all(|b| b == b'0')
}

fn split_endpoint(value: &str) -> Option<(String, u16)> {
    if value == "(none)" {
        return None;
    }
    let (host, port) = value.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Some((host.to_string(), port.parse().ok()?))
}

/// Render a full-replacement `set=1` request.
///
/// The socket only accepts literal endpoints, so hostnames are resolved
/// here, preferring IPv6.
async fn render_set_request(config: &TunnelConfiguration) -> Result<String> {
    let mut body = String::from("set=1\n");
    if let Some(key) = &config.private_key {
        body.push_str(&format!("private_key={}\n", base64_to_hex(key)?));
    }
    if let Some(port) = config.listen_port {
        body.push_str(&format!("listen_port={}\n", port));
    }
    body.push_str("replace_peers=true\n");

    for peer in &config.peers {
        body.push_str(&format!("public_key={}\n", base64_to_hex(&peer.public_key)?));
        if let Some(psk) = &peer.preshared_key {
            body.push_str(&format!("preshared_key={}\n", base64_to_hex(psk)?));
        }
        if let Some(endpoint) = literal_endpoint(peer).await {
            body.push_str(&format!("endpoint={}\n", endpoint));
        }
        body.push_str(&format!(
            "persistent_keepalive_interval={}\n",
            peer.persistent_keepalive.unwrap_or(0)
        ));
        body.push_str("replace_allowed_ips=true\n");
        for net in &peer.allowed_ips {
            body.push_str(&format!("allowed_ip={}\n", net));
        }
    }
    body.push('\n');
    Ok(body)
}

/// Literal `addr:port` endpoint of a peer.
///
/// An unresolvable hostname leaves the peer without an endpoint; it can
/// still be reached once the other side initiates.
async fn literal_endpoint(peer: &PeerEntry) -> Option<String> {
    let (Some(host), Some(port)) = (peer.endpoint_host.as_deref(), peer.endpoint_port) else {
        return None;
    };
    if peer.endpoint_addr().is_some() {
        return peer.endpoint();
    }

    match tokio::net::lookup_host((host, port)).await {
        Ok(addrs) => {
            let addrs: Vec<_> = addrs.collect();
            let chosen = addrs.iter().find(|a| a.is_ipv6()).or_else(|| addrs.first());
            if chosen.is_none() {
                tracing::warn!("Endpoint {} has no addresses, leaving it unset", host);
            }
            chosen.map(|a| a.to_string())
        }
        Err(e) => {
            tracing::warn!("Failed to resolve endpoint {}: {}, leaving it unset", host, e);
            None
        }
    }
}
