//! Worker configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// I/O worker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Longest interval between two status reports
    #[serde(default = "default_max_update_period_ms")]
    pub max_update_period_ms: u64,
    /// Concurrent blocking jobs (interface construction and close)
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// How long shutdown waits for outstanding background jobs
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default)]
    pub ports: PortNames,
}

fn default_max_update_period_ms() -> u64 {
    1000
}

fn default_pool_size() -> usize {
    16
}

fn default_shutdown_grace_ms() -> u64 {
    1000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_update_period_ms: default_max_update_period_ms(),
            pool_size: default_pool_size(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            ports: PortNames::default(),
        }
    }
}

impl WorkerConfig {
    pub fn max_update_period(&self) -> Duration {
        Duration::from_millis(self.max_update_period_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Logical port names the worker binds to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortNames {
    #[serde(default = "default_config_port")]
    pub config: String,
    #[serde(default = "default_status_port")]
    pub status: String,
    #[serde(default = "default_capture_port")]
    pub capture: String,
    #[serde(default = "default_spoof_port")]
    pub spoof: String,
}

fn default_config_port() -> String {
    "io_config".to_string()
}

fn default_status_port() -> String {
    "io_status".to_string()
}

fn default_capture_port() -> String {
    "capture".to_string()
}

fn default_spoof_port() -> String {
    "spoof".to_string()
}

impl Default for PortNames {
    fn default() -> Self {
        Self {
            config: default_config_port(),
            status: default_status_port(),
            capture: default_capture_port(),
            spoof: default_spoof_port(),
        }
    }
}
