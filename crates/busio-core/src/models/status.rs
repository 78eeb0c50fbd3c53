//! Status report messages

use serde::{Deserialize, Serialize};

/// Longest failure reason carried on the wire, in bytes
pub const MAX_FAILURE_REASON_LEN: usize = 255;

/// Aggregated status of every tracked interface, ordered by id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IoStatus {
    #[serde(default)]
    pub iface_status: Vec<IfaceStatus>,
}

impl IoStatus {
    pub fn get(&self, iface_id: u16) -> Option<&IfaceState> {
        self.iface_status
            .iter()
            .find(|s| s.iface_id == iface_id)
            .map(|s| &s.state)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IfaceStatus {
    pub iface_id: u16,
    pub state: IfaceState,
}

/// Lifecycle state as reported on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IfaceState {
    Initializing,
    Operational(OperationalInfo),
    Failure(String),
}

impl IfaceState {
    /// Failure state with the reason truncated to the wire limit
    pub fn failure(reason: impl Into<String>) -> Self {
        IfaceState::Failure(truncate_utf8(reason.into(), MAX_FAILURE_REASON_LEN))
    }

    pub fn is_operational(&self) -> bool {
        matches!(self, IfaceState::Operational(_))
    }
}

/// Live counters of an operational interface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationalInfo {
    pub media_frames: u64,
    pub media_bytes: u64,
    /// Absent when the adapter cannot tell
    pub media_utilization_pct: Option<u8>,
    pub errors: u64,
    pub spoof_bytes: u64,
    pub spoof_transfers: u64,
    pub spoof_timeouts: u64,
    pub spoof_failures: u64,
    pub spoof_backlog_current: u64,
    pub spoof_backlog_peak: u64,
}

fn truncate_utf8(mut s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    s
}
