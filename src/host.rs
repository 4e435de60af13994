//! Host network plumbing
//!
//! Interface creation, address assignment and the NAT64 route. The tunnel
//! device itself carries no addresses, so these go through `ip(8)`.

use std::net::IpAddr;

use ipnet::IpNet;
use tokio::process::Command;

use crate::error::{Error, Result};

/// Host network capability
#[async_trait::async_trait]
pub trait HostNetwork: Send + Sync {
    /// Make sure a WireGuard interface exists and is up
    async fn ensure_interface(&self, name: &str) -> Result<()>;

    /// Make `addr` the only global address of the interface
    async fn assign_address(&self, iface: &str, addr: IpNet) -> Result<()>;

    /// Route the NAT64 prefix through the control node's overlay address
    async fn install_nat64_route(&self, iface: &str, prefix: IpNet, via: IpAddr) -> Result<()>;
}

/// `HostNetwork` backed by the `ip` command
#[derive(Debug, Clone)]
pub struct IpCommandHost {
    program: String,
    userspace: Option<String>,
}

impl Default for IpCommandHost {
    fn default() -> Self {
        Self::new()
    }
}

impl IpCommandHost {
    pub fn new() -> Self {
        Self::with_program("ip")
    }

    /// Use a different binary in place of `ip`
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            userspace: None,
        }
    }

    /// Create missing interfaces with a userspace implementation
    /// (`<command> <interface>`) instead of a kernel link
    pub fn with_userspace(mut self, command: Option<String>) -> Self {
        self.userspace = command;
        self
    }

    async fn start_userspace(&self, command: &str, name: &str) -> Result<()> {
        tracing::info!("Starting {} for {}", command, name);
        let status = Command::new(command)
            .arg(name)
            .status()
            .await
            .map_err(|e| Error::HostNetwork(format!("failed to run {}: {}", command, e)))?;
        if !status.success() {
            return Err(Error::HostNetwork(format!("{} {} exited with {}", command, name, status)));
        }
        Ok(())
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        tracing::debug!("{} {}", self.program, args.join(" "));
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::HostNetwork(format!("failed to run {}: {}", self.program, e)))?;
        if !output.status.success() {
            return Err(Error::HostNetwork(format!(
                "{} {} failed: {}",
                self.program,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn interface_exists(&self, name: &str) -> bool {
        self.run(&["link", "show", "dev", name]).await.is_ok()
    }
}

fn family_flag(addr: &IpAddr) -> &'static str {
    match addr {
        IpAddr::V4(_) => "-4",
        IpAddr::V6(_) => "-6",
    }
}

#[async_trait::async_trait]
impl HostNetwork for IpCommandHost {
    async fn ensure_interface(&self, name: &str) -> Result<()> {
        if !self.interface_exists(name).await {
            match &self.userspace {
                Some(command) => self.start_userspace(command, name).await?,
                None => {
                    tracing::info!("Creating WireGuard interface {}", name);
                    self.run(&["link", "add", "dev", name, "type", "wireguard"]).await?;
                }
            }
        }
        self.run(&["link", "set", "dev", name, "up"]).await?;
        Ok(())
    }

    async fn assign_address(&self, iface: &str, addr: IpNet) -> Result<()> {
        let family = family_flag(&addr.addr());
        self.run(&[family, "addr", "flush", "dev", iface, "scope", "global"]).await?;
        self.run(&[family, "addr", "add", &addr.to_string(), "dev", iface]).await?;
        tracing::info!("Assigned {} to {}", addr, iface);
        Ok(())
    }

    async fn install_nat64_route(&self, iface: &str, prefix: IpNet, via: IpAddr) -> Result<()> {
        self.run(&[
            family_flag(&via),
            "route",
            "replace",
            &prefix.to_string(),
            "via",
            &via.to_string(),
            "dev",
            iface,
        ])
        .await?;
        tracing::info!("Routing {} via {} on {}", prefix, via, iface);
        Ok(())
    }
}
