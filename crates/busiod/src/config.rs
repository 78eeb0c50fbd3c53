//! Daemon configuration (TOML)
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 18090
//!
//! [node]
//! heartbeat_timeout_ms = 5000
//!
//! [worker]
//! max_update_period_ms = 1000
//!
//! [[iface]]
//! iface_id = 1
//! [iface.transport]
//! type = "udp"
//! local_nic_address = "127.0.0.1"
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use busio_core::{IfaceConfig, IoConfig};
use busio_io::WorkerConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Interfaces configured at startup
    #[serde(default)]
    pub iface: Vec<IfaceConfig>,
}

/// HTTP bridge listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    18090
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Close the node when no heartbeat arrives for this long; 0 disables
    #[serde(default)]
    pub heartbeat_timeout_ms: u64,
}

impl NodeConfig {
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        (self.heartbeat_timeout_ms > 0).then(|| Duration::from_millis(self.heartbeat_timeout_ms))
    }
}

impl DaemonConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Startup interface set, if any
    pub fn initial_io_config(&self) -> Option<IoConfig> {
        (!self.iface.is_empty()).then(|| IoConfig::new(self.iface.clone()))
    }
}
