//! Spoof requests

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::session::{Priority, Session};

/// Request to inject a synthetic transfer onto one, several or all interfaces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spoof {
    /// Transmission timeout in seconds
    pub timeout: f32,
    #[serde(default)]
    pub priority: Priority,
    pub session: Session,
    /// Explicit transfer-ID; assigned automatically when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<u64>,
    /// Target interfaces; empty means every live interface
    #[serde(default)]
    pub iface_id: BTreeSet<u16>,
    #[serde(with = "super::hex_bytes")]
    pub payload: Vec<u8>,
}

impl Spoof {
    /// Timeout as a duration.
    ///
    /// Negative and NaN values mean "no time"; values too large for a
    /// `Duration` (including +inf) saturate to `Duration::MAX`.
    pub fn timeout(&self) -> Duration {
        if self.timeout.is_nan() || self.timeout <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f32(self.timeout).unwrap_or(Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spoof_from_json() {
        let spoof: Spoof = serde_json::from_str(
            r#"{"timeout":1.5,"priority":3,"session":{"subject":{"subject_id":6666}},"iface_id":[2,1,2],"payload":"48656c6c6f"}"#,
        )
        .unwrap();
        assert_eq!(spoof.priority, Priority::High);
        assert_eq!(spoof.transfer_id, None);
        assert_eq!(spoof.iface_id.iter().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(spoof.payload, b"Hello");
        assert_eq!(spoof.timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn test_negative_timeout_is_zero() {
        let mut spoof = Spoof {
            timeout: -1.0,
            priority: Priority::Nominal,
            session: Session::Subject {
                subject_id: 1,
                source: None,
            },
            transfer_id: Some(5),
            iface_id: BTreeSet::new(),
            payload: vec![],
        };
        assert_eq!(spoof.timeout(), Duration::ZERO);

        spoof.timeout = f32::NAN;
        assert_eq!(spoof.timeout(), Duration::ZERO);
    }

    #[test]
    fn test_huge_timeout_saturates() {
        let mut spoof = Spoof {
            timeout: 1e20,
            priority: Priority::Nominal,
            session: Session::Subject {
                subject_id: 1,
                source: None,
            },
            transfer_id: None,
            iface_id: BTreeSet::new(),
            payload: vec![],
        };
        assert_eq!(spoof.timeout(), Duration::MAX);

        spoof.timeout = f32::INFINITY;
        assert_eq!(spoof.timeout(), Duration::MAX);
    }
}
