//! Port forwarding to the device agent.
//!
//! The engine only needs "after `establish` succeeds, the agent is reachable
//! at host:port". [`AdbTunnel`] does that with `adb forward`.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::TunnelConfig;
use crate::error::{Error, Result};

#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Makes the agent reachable on the local port. Not retried on failure.
    async fn establish(&self, config: &TunnelConfig) -> Result<()>;
}

/// Forwards `tcp:<port>` to the agent's abstract socket with adb.
#[derive(Debug, Clone)]
pub struct AdbTunnel {
    adb: PathBuf,
}

/// One line of `adb forward --list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    pub serial: String,
    pub local: String,
    pub remote: String,
}

impl AdbTunnel {
    pub fn new(adb: impl Into<PathBuf>) -> Self {
        Self { adb: adb.into() }
    }

    /// Arguments for the forward command, without the adb binary.
    pub fn forward_args(config: &TunnelConfig) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(device) = &config.device {
            args.push("-s".to_string());
            args.push(device.clone());
        }
        args.push("forward".to_string());
        args.push(format!("tcp:{}", config.port));
        args.push(format!("localabstract:{}", config.remote_socket()));
        args
    }

    /// Lists the forwards adb currently has in place.
    pub async fn list(&self) -> Result<Vec<ForwardRule>> {
        let stdout = self.run(&["forward".to_string(), "--list".to_string()]).await?;
        Ok(parse_forward_list(&stdout))
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        tracing::debug!(adb = %self.adb.display(), ?args, "running adb");

        let output = Command::new(&self.adb)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Tunnel(format!("failed to run {}: {e}", self.adb.display())))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Tunnel(format!(
                "adb {} exited with {}: {}",
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for AdbTunnel {
    fn default() -> Self {
        Self::new("adb")
    }
}

#[async_trait]
impl Tunnel for AdbTunnel {
    async fn establish(&self, config: &TunnelConfig) -> Result<()> {
        self.run(&Self::forward_args(config)).await?;
        tracing::debug!(
            port = config.port,
            remote = %config.remote_socket(),
            "adb forward established"
        );
        Ok(())
    }
}

/// For agents that are already reachable (existing forward, local agent).
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectTunnel;

#[async_trait]
impl Tunnel for DirectTunnel {
    async fn establish(&self, _config: &TunnelConfig) -> Result<()> {
        Ok(())
    }
}

/// Parses `adb forward --list` output (`<serial> <local> <remote>` per line).
pub fn parse_forward_list(output: &str) -> Vec<ForwardRule> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            Some(ForwardRule {
                serial: parts.next()?.to_string(),
                local: parts.next()?.to_string(),
                remote: parts.next()?.to_string(),
            })
        })
        .collect()
}
