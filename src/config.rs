//! Engine configuration.
//!
//! Loaded from an optional TOML file and then overridden by CLI flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::RetryPolicy;
use crate::error::{Error, Result};
use crate::protocol::DEFAULT_PORT;

/// Suffix of the abstract socket the agent listens on.
pub const DEFAULT_SOCKET_SUFFIX: &str = "livesync";

/// Default do-sync acknowledgment deadline.
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 6_000;

/// Default overall budget for the connect retry loop.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 100_000;

/// Default pause between connect attempts.
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Full application identifier, e.g. `com.example.app`. Required.
    pub application_id: String,
    /// Directory that outgoing paths are made relative to. Required.
    pub base_dir: PathBuf,
    /// Local port forwarded to the device agent.
    pub port: u16,
    /// Local address the forwarded port is bound on.
    pub host: String,
    /// Device serial, for when more than one device is attached.
    pub device: Option<String>,
    pub socket_suffix: String,
    pub adb_path: PathBuf,
    pub operation_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub retry_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            application_id: String::new(),
            base_dir: PathBuf::new(),
            port: DEFAULT_PORT,
            host: "127.0.0.1".to_string(),
            device: None,
            socket_suffix: DEFAULT_SOCKET_SUFFIX.to_string(),
            adb_path: PathBuf::from("adb"),
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
        }
    }
}

impl Config {
    pub fn new(application_id: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            application_id: application_id.into(),
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_toml(&text)
    }

    /// Checks the fields the engine cannot run without.
    pub fn validate(&self) -> Result<()> {
        if self.application_id.trim().is_empty() {
            return Err(Error::Configuration(
                "application_id is required (e.g. com.example.app)".into(),
            ));
        }
        if self.base_dir.as_os_str().is_empty() {
            return Err(Error::Configuration("base_dir is required".into()));
        }
        if self.host.is_empty() {
            return Err(Error::Configuration("host must not be empty".into()));
        }
        if self.retry_interval_ms == 0 {
            return Err(Error::Configuration(
                "retry_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// `host:port` of the forwarded agent socket.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(self.connect_timeout_ms),
            interval: Duration::from_millis(self.retry_interval_ms),
        }
    }

    pub fn tunnel(&self) -> TunnelConfig {
        TunnelConfig {
            application_id: self.application_id.clone(),
            port: self.port,
            device: self.device.clone(),
            socket_suffix: self.socket_suffix.clone(),
        }
    }
}

/// What the tunnel needs to know to forward a local port to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub application_id: String,
    pub port: u16,
    pub device: Option<String>,
    pub socket_suffix: String,
}

impl TunnelConfig {
    /// Name of the abstract socket the agent listens on.
    pub fn remote_socket(&self) -> String {
        let suffix = if self.socket_suffix.is_empty() {
            DEFAULT_SOCKET_SUFFIX
        } else {
            &self.socket_suffix
        };
        format!("{}-{}", self.application_id, suffix)
    }
}
