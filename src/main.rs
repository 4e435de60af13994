//! Hetznat64 - WireGuard mesh control plane for NAT64 egress
//!
//! One binary for both sides of the mesh: `control` runs on the NAT64
//! gateway, `agent` on every server that should reach the IPv4 internet.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hetznat64::agent::Agent;
use hetznat64::config::{DiscoveryProvider, Hetznat64Config};
use hetznat64::control::{control_key, ControlDeps, ControlLoop};
use hetznat64::error::{Error, Result};
use hetznat64::handshake::HandshakeClient;
use hetznat64::host::IpCommandHost;
use hetznat64::keys::TunnelKeyPair;
use hetznat64::liveness::PingProber;
use hetznat64::tunnel::{TunnelDevice, UapiDevice, WgCommandDevice};

/// Hetznat64 - WireGuard mesh control plane for NAT64 egress
#[derive(Parser)]
#[command(name = "hetznat64")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (environment only when missing)
    #[arg(short, long, default_value = "hetznat64.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control loop on the NAT64 gateway
    Control {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },

    /// Run the agent on a mesh node
    Agent,

    /// Generate a WireGuard key pair
    Genkey {
        /// Write the private key to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "hetznat64.toml")]
        output: PathBuf,

        /// Write a static directory example instead of the Hetzner one
        #[arg(long)]
        static_nodes: bool,
    },

    /// Validate configuration file
    Validate,

    /// Query an agent's readiness and health
    Status {
        /// Agent address (host:port)
        #[arg(short, long, default_value = "localhost:5001")]
        address: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Control { once } => {
            let config = load_config(&cli.config)?;
            init_logging(cli.log_level.as_deref().unwrap_or(&config.logging.level), &config.logging.format);
            run_control(config, once).await
        }
        Commands::Agent => {
            let config = load_config(&cli.config)?;
            init_logging(cli.log_level.as_deref().unwrap_or(&config.logging.level), &config.logging.format);
            run_agent(config).await
        }
        Commands::Genkey { output } => run_genkey(output),
        Commands::Init { output, static_nodes } => run_init(output, static_nodes),
        Commands::Validate => run_validate(&cli.config),
        Commands::Status { address } => {
            let config = load_config(&cli.config)?;
            run_status(&config, address).await
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Load the configuration file, falling back to defaults plus environment
fn load_config(path: &Path) -> Result<Hetznat64Config> {
    if path.exists() {
        Hetznat64Config::from_file(path)
    } else {
        Hetznat64Config::from_env()
    }
}

fn require_root() -> Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        return Err(Error::Config(
            "managing the tunnel interface requires root (or CAP_NET_ADMIN)".into(),
        ));
    }
    Ok(())
}

/// Flip the shutdown channel on Ctrl-C
fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
        }
        let _ = tx.send(true);
    });
    rx
}

fn host_for(config: &Hetznat64Config) -> IpCommandHost {
    IpCommandHost::new().with_userspace(config.wireguard.userspace_command.clone())
}

/// Userspace implementations expose a control socket; kernel links need `wg`
fn device_for(config: &Hetznat64Config) -> Arc<dyn TunnelDevice> {
    let interface = &config.wireguard.interface;
    match config.wireguard.userspace_command {
        Some(_) => Arc::new(UapiDevice::with_socket_dir(interface, &config.wireguard.socket_dir)),
        None => Arc::new(WgCommandDevice::new(interface)),
    }
}

/// Run the control node
async fn run_control(config: Hetznat64Config, once: bool) -> Result<()> {
    tracing::info!("Starting Hetznat64 control node...");
    require_root()?;
    config.validate_control()?;

    let deps = ControlDeps {
        directory: hetznat64::directory::from_config(&config)?,
        handshaker: Arc::new(HandshakeClient::from_config(&config)?),
        device: device_for(&config),
        host: Arc::new(host_for(&config)),
        prober: Arc::new(PingProber::new(config.probe_timeout())),
    };
    let key = control_key(&config)?;
    let control = ControlLoop::new(config, key, deps);

    if let Err(e) = control.startup().await {
        tracing::error!("Control node startup failed: {}", e);
        return Err(e);
    }

    if once {
        let report = control.run_cycle().await?;
        tracing::info!("Cycle finished: {:?}", report);
        return Ok(());
    }

    control.run(shutdown_channel()).await;
    tracing::info!("Control node stopped");
    Ok(())
}

/// Run the agent
async fn run_agent(config: Hetznat64Config) -> Result<()> {
    tracing::info!("Starting Hetznat64 agent...");
    require_root()?;

    let prober = Arc::new(PingProber::new(config.probe_timeout()));
    let device = device_for(&config);
    let host = Arc::new(host_for(&config));
    let agent = Agent::new(config, device, host, prober);

    if let Err(e) = agent.startup().await {
        tracing::error!("Agent startup failed: {}", e);
        return Err(e);
    }

    agent.run(shutdown_channel()).await?;
    tracing::info!("Agent stopped");
    Ok(())
}

fn run_genkey(output: Option<PathBuf>) -> Result<()> {
    let key = TunnelKeyPair::generate();
    match output {
        Some(path) => {
            key.save(&path)?;
            println!("Private key written to {}", path.display());
        }
        None => println!("{}", key.private_key()),
    }
    println!("{}", key.public_key());
    Ok(())
}

fn run_init(output: PathBuf, static_nodes: bool) -> Result<()> {
    let discovery = if static_nodes {
        r#"[discovery]
provider = "static"
label_prefix = "hetznat64"

[[discovery.nodes]]
id = 100
name = "worker-1"
address = "2001:db8:100::1"
labels = { "hetznat64.status" = "waiting" }
"#
    } else {
        r#"[discovery]
provider = "hetzner"
label_prefix = "hetznat64"
api_endpoint = "https://api.hetzner.cloud/v1"
# api_token = "..."   # or HCLOUD_API_TOKEN
request_timeout_secs = 10
"#
    };

    let config_content = format!(
        r#"# Hetznat64 Configuration
# Generated configuration file

[wireguard]
interface = "hetznat64"
address = "fd00:6464::1/64"
listen_port = 51820
persistent_keepalive_secs = 25
# private_key_file = "/var/lib/hetznat64/private.key"
# userspace_command = "wireguard-go"
socket_dir = "/var/run/wireguard"

[control]
poll_interval_secs = 5
handshake_timeout_secs = 5
handshake_freshness_secs = 180
probe_timeout_secs = 5
agent_port = 5001
publish_status = true

[agent]
bind_address = "[::]:5001"
control_hostname = "server"
control_port = 51820
nat64_prefix = "64:ff9b::/96"
liveness_interval_ms = 1000
recheck_every = 30

{discovery}
[tls]
# cert_file = "/etc/hetznat64/tls.crt"
# key_file = "/etc/hetznat64/tls.key"
# ca_file = "/etc/hetznat64/ca.crt"

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure discovery and the overlay network.");
    println!("Then start with: hetznat64 --config {} control", output.display());

    Ok(())
}

fn run_validate(config_path: &Path) -> Result<()> {
    match Hetznat64Config::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Interface: {} ({})", config.wireguard.interface, config.wireguard.address);
            println!("  Listen Port: {}", config.wireguard.listen_port);
            match config.discovery.provider {
                DiscoveryProvider::Hetzner => println!(
                    "  Discovery: hetzner at {} (token {})",
                    config.discovery.api_endpoint,
                    if config.discovery.api_token.is_some() { "set" } else { "missing" }
                ),
                DiscoveryProvider::Static => {
                    println!("  Discovery: static ({} nodes)", config.discovery.nodes.len())
                }
            }
            println!("  Member Selector: {}", config.member_selector());
            println!("  NAT64 Prefix: {}", config.agent.nat64_prefix);
            println!("  TLS: {}", if config.tls_enabled() { "enabled" } else { "disabled" });
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

async fn run_status(config: &Hetznat64Config, address: String) -> Result<()> {
    let client = hetznat64::tls::http_client(&config.tls, std::time::Duration::from_secs(5))?;
    let scheme = config.agent_scheme();

    for path in ["ready", "health"] {
        let url = format!("{}://{}/{}", scheme, address, path);
        let response = match client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                eprintln!("Failed to query {}: {}", url, e);
                return Err(Error::Internal(e.to_string()));
            }
        };
        let code = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;
        println!("{} ({}):", path, code);
        println!("{}", serde_json::to_string_pretty(&body)?);
    }
    Ok(())
}
