//! Timestamps: local (system + monotonic) and the shared wire form

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Local timestamp pairing the wall clock with the monotonic clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub system: SystemTime,
    pub monotonic: Instant,
}

impl Timestamp {
    pub fn now() -> Self {
        Self {
            system: SystemTime::now(),
            monotonic: Instant::now(),
        }
    }

    /// Repackage into the wire form.
    ///
    /// Only the system time survives; monotonic time is meaningful inside
    /// this process alone.
    pub fn to_wire(&self) -> SyncTimestamp {
        let micros = self
            .system
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_micros();
        SyncTimestamp {
            microsecond: u64::try_from(micros).unwrap_or(u64::MAX),
        }
    }
}

/// Synchronized (wall clock) timestamp as carried on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncTimestamp {
    /// Microseconds since the Unix epoch
    pub microsecond: u64,
}

impl SyncTimestamp {
    /// Convert back into a local timestamp; the monotonic part is sampled now
    pub fn to_local(&self) -> Timestamp {
        Timestamp {
            system: UNIX_EPOCH + Duration::from_micros(self.microsecond),
            monotonic: Instant::now(),
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        let micros = i64::try_from(self.microsecond).ok()?;
        DateTime::from_timestamp_micros(micros)
    }
}
