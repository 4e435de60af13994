//! Kernel WireGuard links through the `wg` tool
//!
//! Links created with `ip link add type wireguard` are configured over
//! netlink and have no control socket; `wg show dump` and `wg syncconf`
//! cover the same ground.

use std::process::Stdio;

use chrono::{TimeZone, Utc};
use ipnet::IpNet;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{PeerEntry, TunnelConfiguration, TunnelDevice};
use crate::error::{Error, Result};

/// Tunnel device driven by the `wg` command line tool
#[derive(Debug, Clone)]
pub struct WgCommandDevice {
    interface: String,
    program: String,
}

impl WgCommandDevice {
    /// Device for an interface, using `wg` from `PATH`
    pub fn new(interface: impl Into<String>) -> Self {
        Self::with_program(interface, "wg")
    }

    /// Device for an interface, using a specific `wg` binary
    pub fn with_program(interface: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Configuration(format!("{}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Configuration(format!(
                "{} {} failed: {}",
                self.program,
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait::async_trait]
impl TunnelDevice for WgCommandDevice {
    async fn get(&self) -> Result<TunnelConfiguration> {
        let dump = self.run(&["show", &self.interface, "dump"]).await?;
        parse_dump(&dump)
    }

    async fn set(&self, config: &TunnelConfiguration) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(["syncconf", &self.interface, "/dev/stdin"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Configuration(format!("{}: {}", self.program, e)))?;

        // A write error means wg exited early; its status explains why
        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(config.to_wg_config().as_bytes()).await,
            None => Ok(()),
        };

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::Configuration(format!("{}: {}", self.program, e)))?;
        if !output.status.success() {
            return Err(Error::Configuration(format!(
                "{} syncconf {} failed: {}",
                self.program,
                self.interface,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        written.map_err(|e| Error::Configuration(format!("{}: {}", self.program, e)))?;

        tracing::debug!(
            "Applied configuration to {} ({} peers)",
            self.interface,
            config.peers.len()
        );
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let out = self.run(&["show", "interfaces"]).await?;
        let mut names: Vec<String> = out.split_whitespace().map(String::from).collect();
        names.sort();
        Ok(names)
    }
}

fn field(value: &str) -> Option<&str> {
    match value {
        "" | "(none)" | "off" => None,
        v => Some(v),
    }
}

/// Parse `wg show <iface> dump`.
///
/// The first line holds the interface (private key, public key, port,
/// fwmark); every further line is a peer.
fn parse_dump(dump: &str) -> Result<TunnelConfiguration> {
    let mut config = TunnelConfiguration::default();
    let mut lines = dump.lines().filter(|l| !l.trim().is_empty());

    let Some(interface) = lines.next() else {
        return Err(Error::Configuration("empty wg dump".into()));
    };
    let cols: Vec<&str> = interface.split('\t').collect();
    if cols.len() < 3 {
        return Err(Error::Configuration(format!("bad interface line '{}'", interface)));
    }
    config.private_key = field(cols[0]).map(String::from);
    config.listen_port = cols[2].parse().ok().filter(|p| *p != 0);

    for line in lines {
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() < 8 {
            return Err(Error::Configuration(format!("bad peer line '{}'", line)));
        }

        let mut peer = PeerEntry::new(cols[0]);
        peer.preshared_key = field(cols[1]).map(String::from);
        if let Some((host, port)) = field(cols[2]).and_then(|e| e.rsplit_once(':')) {
            if let Ok(port) = port.parse() {
                peer.endpoint_host = Some(host.trim_start_matches('[').trim_end_matches(']').to_string());
                peer.endpoint_port = Some(port);
            }
        }
        if let Some(ips) = field(cols[3]) {
            for ip in ips.split(',') {
                let net: IpNet = ip
                    .trim()
                    .parse()
                    .map_err(|_| Error::Configuration(format!("bad allowed ip '{}'", ip)))?;
                peer.allowed_ips.insert(net);
            }
        }
        if let Ok(secs) = cols[4].parse::<i64>() {
            if secs > 0 {
                peer.last_handshake_time = Utc.timestamp_opt(secs, 0).single();
            }
        }
        peer.persistent_keepalive = field(cols[7]).and_then(|k| k.parse().ok()).filter(|k| *k != 0);
        config.peers.push(peer);
    }

    Ok(config)
}
