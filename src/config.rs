//! Hetznat64 Configuration
//!
//! Configuration structures shared by the control node and the agents.
//! Values come from a TOML file and can be overridden by the environment
//! variables the container images have always used (`WG_INTERFACE`,
//! `HCLOUD_API_TOKEN`, ...).

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Main Hetznat64 configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hetznat64Config {
    /// Local WireGuard interface configuration
    #[serde(default)]
    pub wireguard: WireGuardConfig,

    /// Control loop configuration
    #[serde(default)]
    pub control: ControlConfig,

    /// Agent configuration
    #[serde(default)]
    pub agent: AgentConfig,

    /// Node discovery configuration
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// TLS material for the handshake endpoint
    #[serde(default)]
    pub tls: TlsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// WireGuard interface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireGuardConfig {
    /// Interface name
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Overlay address of this node, with the overlay prefix length
    #[serde(default = "default_address")]
    pub address: IpNet,

    /// UDP listen port
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Private key file (base64). Generated when missing.
    /// Without it the control node uses a fresh key per process.
    #[serde(default)]
    pub private_key_file: Option<PathBuf>,

    /// Keepalive interval for peers behind NAT, in seconds
    #[serde(default = "default_keepalive")]
    pub persistent_keepalive_secs: u16,

    /// Userspace WireGuard binary started when the interface is missing
    /// (for example `wireguard-go`). Without it a kernel link is created.
    #[serde(default)]
    pub userspace_command: Option<String>,

    /// Directory holding the userspace control sockets
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
}

/// Control loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Seconds between reconciliation cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Timeout for a single handshake request in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Port the agents serve the handshake endpoint on
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,

    /// Relabel confirmed nodes as connected in the directory
    #[serde(default = "default_true")]
    pub publish_status: bool,

    /// A peer whose last handshake is older than this is re-handshaken
    #[serde(default = "default_handshake_freshness")]
    pub handshake_freshness_secs: u64,

    /// Timeout for a single reachability probe in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Address the handshake/health API binds to
    #[serde(default = "default_agent_bind")]
    pub bind_address: String,

    /// Hostname of the control node's WireGuard endpoint
    #[serde(default = "default_control_hostname")]
    pub control_hostname: String,

    /// WireGuard port of the control node
    #[serde(default = "default_listen_port")]
    pub control_port: u16,

    /// NAT64 prefix routed through the tunnel
    #[serde(default = "default_nat64_prefix")]
    pub nat64_prefix: IpNet,

    /// Liveness tick in milliseconds
    #[serde(default = "default_liveness_interval")]
    pub liveness_interval_ms: u64,

    /// While connected, probe only every Nth tick
    #[serde(default = "default_recheck_every")]
    pub recheck_every: u32,
}

/// Directory backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryProvider {
    /// Hetzner Cloud API
    Hetzner,
    /// Nodes listed in this file
    Static,
}

/// Node discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Directory backend
    #[serde(default = "default_provider")]
    pub provider: DiscoveryProvider,

    /// Prefix of the labels nodes set to get picked up
    #[serde(default = "default_label_prefix")]
    pub label_prefix: String,

    /// Cloud API endpoint
    #[serde(default = "default_api_endpoint")]
    pub api_endpoint: String,

    /// Cloud API token
    #[serde(default)]
    pub api_token: Option<String>,

    /// Cloud API request timeout in seconds
    #[serde(default = "default_api_timeout")]
    pub request_timeout_secs: u64,

    /// Nodes for the static provider
    #[serde(default)]
    pub nodes: Vec<StaticNodeConfig>,
}

/// A node served by the static directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticNodeConfig {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    pub address: IpAddr,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// TLS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Certificate chain (PEM)
    #[serde(default)]
    pub cert_file: Option<PathBuf>,

    /// Private key (PEM)
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// CA bundle used to verify the other side (PEM)
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_interface() -> String {
    "hetznat64".to_string()
}

fn default_address() -> IpNet {
    IpNet::V6("fd00:6464::1/64".parse().expect("valid default address"))
}

fn default_listen_port() -> u16 {
    51820
}

fn default_keepalive() -> u16 {
    25
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/var/run/wireguard")
}

fn default_poll_interval() -> u64 {
    5
}

fn default_handshake_timeout() -> u64 {
    5
}

fn default_agent_port() -> u16 {
    5001
}

fn default_true() -> bool {
    true
}

fn default_handshake_freshness() -> u64 {
    180
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_agent_bind() -> String {
    "[::]:5001".to_string()
}

fn default_control_hostname() -> String {
    "server".to_string()
}

fn default_nat64_prefix() -> IpNet {
    IpNet::V6("64:ff9b::/96".parse().expect("valid default prefix"))
}

fn default_liveness_interval() -> u64 {
    1000
}

fn default_recheck_every() -> u32 {
    30
}

fn default_provider() -> DiscoveryProvider {
    DiscoveryProvider::Hetzner
}

fn default_label_prefix() -> String {
    "hetznat64".to_string()
}

fn default_api_endpoint() -> String {
    "https://api.hetzner.cloud/v1".to_string()
}

fn default_api_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for WireGuardConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            address: default_address(),
            listen_port: default_listen_port(),
            private_key_file: None,
            persistent_keepalive_secs: default_keepalive(),
            userspace_command: None,
            socket_dir: default_socket_dir(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            handshake_timeout_secs: default_handshake_timeout(),
            agent_port: default_agent_port(),
            publish_status: true,
            handshake_freshness_secs: default_handshake_freshness(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_address: default_agent_bind(),
            control_hostname: default_control_hostname(),
            control_port: default_listen_port(),
            nat64_prefix: default_nat64_prefix(),
            liveness_interval_ms: default_liveness_interval(),
            recheck_every: default_recheck_every(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            label_prefix: default_label_prefix(),
            api_endpoint: default_api_endpoint(),
            api_token: None,
            request_timeout_secs: default_api_timeout(),
            nodes: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Hetznat64Config {
    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Hetznat64Config = toml::from_str(&content)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: Hetznat64Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for deployments without a file
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> crate::Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
    }

    /// Apply overrides from an arbitrary lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> crate::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("WG_INTERFACE") {
            self.wireguard.interface = v;
        }
        if let Some(v) = lookup("WG_IPV6") {
            self.wireguard.address = parse_value("WG_IPV6", &v)?;
        }
        if let Some(v) = lookup("WG_PORT") {
            self.wireguard.listen_port = parse_value("WG_PORT", &v)?;
        }
        if let Some(v) = lookup("CONTROL_SERVER_HOSTNAME") {
            self.agent.control_hostname = v;
        }
        if let Some(v) = lookup("CONTROL_SERVER_PORT") {
            self.agent.control_port = parse_value("CONTROL_SERVER_PORT", &v)?;
        }
        if let Some(v) = lookup("PORT") {
            let port: u16 = parse_value("PORT", &v)?;
            self.agent.bind_address = format!("[::]:{}", port);
            self.control.agent_port = port;
        }
        if let Some(v) = lookup("NAT64_PREFIX") {
            self.agent.nat64_prefix = parse_value("NAT64_PREFIX", &v)?;
        }
        if let Some(v) = lookup("POLL_INTERVAL") {
            self.control.poll_interval_secs = parse_value("POLL_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("CERT_FILE") {
            self.tls.cert_file = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("KEY_FILE") {
            self.tls.key_file = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("CA_FILE") {
            self.tls.ca_file = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("HCLOUD_API_TOKEN") {
            self.discovery.api_token = Some(v);
        }
        if let Some(v) = lookup("HCLOUD_API_ENDPOINT") {
            self.discovery.api_endpoint = v;
        }
        if let Some(v) = lookup("DISCOVERY_LABEL_PREFIX") {
            self.discovery.label_prefix = v;
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.wireguard.interface.is_empty() {
            return Err(crate::Error::Config("wireguard.interface cannot be empty".into()));
        }

        if self.wireguard.interface.len() > 15 {
            return Err(crate::Error::Config(format!(
                "wireguard.interface '{}' is longer than 15 characters",
                self.wireguard.interface
            )));
        }

        if self.control.poll_interval_secs == 0 {
            return Err(crate::Error::Config("control.poll_interval_secs must be positive".into()));
        }

        if self.agent.recheck_every == 0 {
            return Err(crate::Error::Config("agent.recheck_every must be positive".into()));
        }

        if self.discovery.label_prefix.is_empty() {
            return Err(crate::Error::Config("discovery.label_prefix cannot be empty".into()));
        }

        if self.tls.cert_file.is_some() != self.tls.key_file.is_some() {
            return Err(crate::Error::Config(
                "tls.cert_file and tls.key_file must be set together".into(),
            ));
        }

        Ok(())
    }

    /// Extra checks for running the control loop
    pub fn validate_control(&self) -> crate::Result<()> {
        if self.discovery.provider == DiscoveryProvider::Hetzner
            && self.discovery.api_token.as_deref().map_or(true, str::is_empty)
        {
            return Err(crate::Error::Config(
                "discovery.api_token (or HCLOUD_API_TOKEN) is required for the hetzner provider".into(),
            ));
        }
        Ok(())
    }

    /// Label key carrying a node's status
    pub fn status_label(&self) -> String {
        format!("{}.status", self.discovery.label_prefix)
    }

    /// Label selector matching every node that carries a status.
    ///
    /// Connected nodes are listed too, so the mesh can be rebuilt after
    /// either side loses its tunnel state.
    pub fn member_selector(&self) -> String {
        self.status_label()
    }

    /// Get poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.control.poll_interval_secs)
    }

    /// Get handshake request timeout as Duration
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.control.handshake_timeout_secs)
    }

    /// Get handshake freshness window as Duration
    pub fn handshake_freshness(&self) -> Duration {
        Duration::from_secs(self.control.handshake_freshness_secs)
    }

    /// Get probe timeout as Duration
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.control.probe_timeout_secs)
    }

    /// Get agent liveness tick as Duration
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.agent.liveness_interval_ms)
    }

    /// Get cloud API request timeout as Duration
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery.request_timeout_secs)
    }

    /// Whether TLS material is configured
    pub fn tls_enabled(&self) -> bool {
        self.tls.cert_file.is_some() && self.tls.key_file.is_some()
    }

    /// URL scheme the agent endpoint is served on
    pub fn agent_scheme(&self) -> &'static str {
        if self.tls_enabled() {
            "https"
        } else {
            "http"
        }
    }
}

fn parse_value<T>(key: &str, value: &str) -> crate::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| crate::Error::Config(format!("{}={}: {}", key, value, e)))
}
