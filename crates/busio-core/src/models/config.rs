//! Interface configuration messages
//!
//! A configuration message lists every interface that should exist. An
//! interface id that disappears from a later message is removed.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Desired set of interfaces
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IoConfig {
    #[serde(default)]
    pub iface_config: Vec<IfaceConfig>,
}

impl IoConfig {
    pub fn new(iface_config: Vec<IfaceConfig>) -> Self {
        Self { iface_config }
    }
}

/// One interface: caller-assigned id plus transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IfaceConfig {
    pub iface_id: u16,
    pub transport: TransportConfig,
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Transport configuration; exactly one transport family per interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// In-memory medium reflecting spoofed transfers back as captures
    Loopback(LoopbackConfig),
    /// Datagram transport over IPv4 multicast
    Udp(UdpConfig),
    /// Classic CAN through SocketCAN (Linux only)
    Can(CanConfig),
}

impl TransportConfig {
    /// Lowercase transport family name
    pub fn name(&self) -> &'static str {
        match self {
            TransportConfig::Loopback(_) => "loopback",
            TransportConfig::Udp(_) => "udp",
            TransportConfig::Can(_) => "can",
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Loopback(LoopbackConfig::default())
    }
}

/// What a loopback interface does with a spoofed transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpoofBehavior {
    /// Transmit and reflect as a capture
    #[default]
    Deliver,
    /// Report that the deadline expired
    Timeout,
    /// Raise a transmission error
    Fail,
}

/// Loopback transport configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopbackConfig {
    /// Simulated transmission latency in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub spoof_result: SpoofBehavior,
    /// When set, construction fails with this reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub construction_error: Option<String>,
}

/// UDP transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UdpConfig {
    /// Address of the local NIC used for multicast membership and egress
    pub local_nic_address: IpAddr,
    /// UDP port shared by all groups
    #[serde(default = "default_udp_port")]
    pub port: u16,
    /// Maximum transfer payload bytes per datagram
    #[serde(default = "default_udp_mtu")]
    pub mtu: usize,
    /// Send every service transfer twice
    #[serde(default)]
    pub duplicate_service_transfers: bool,
    /// Subject groups to join for capture
    #[serde(default)]
    pub capture_subjects: Vec<u16>,
    /// Service destination groups to join for capture
    #[serde(default)]
    pub capture_service_nodes: Vec<u16>,
}

fn default_udp_port() -> u16 {
    9382
}

fn default_udp_mtu() -> usize {
    1408
}

/// CAN transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanConfig {
    /// CAN interface name (e.g., "can0", "vcan0")
    pub interface: String,
    /// Bus bitrate; enables the media utilization estimate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
}
