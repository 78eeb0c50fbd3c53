//! Media-layer statistics

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Running counters sampled from an interface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IfaceStatistics {
    /// Frames seen on the medium
    pub n_frames: u64,
    /// Media-layer bytes seen on the medium
    pub n_media_layer_bytes: u64,
    /// Bus load estimate, when the medium can provide one
    pub media_utilization_pct: Option<u8>,
    /// Media-layer errors (error frames, failed reads)
    pub n_errors: u64,
}

/// Thread-safe holder for [`IfaceStatistics`]
#[derive(Debug, Default)]
pub struct StatsCell {
    inner: Mutex<IfaceStatistics>,
}

impl StatsCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&self, media_bytes: usize) {
        let mut stats = self.inner.lock();
        stats.n_frames += 1;
        stats.n_media_layer_bytes += media_bytes as u64;
    }

    pub fn record_error(&self) {
        self.inner.lock().n_errors += 1;
    }

    pub fn set_utilization(&self, pct: Option<u8>) {
        self.inner.lock().media_utilization_pct = pct;
    }

    pub fn snapshot(&self) -> IfaceStatistics {
        *self.inner.lock()
    }
}

/// Bus load estimator over fixed windows
///
/// The estimate is `None` until the first window has elapsed.
#[derive(Debug)]
pub struct UtilizationMeter {
    capacity_bps: u64,
    window: Duration,
    window_start: Instant,
    bits: u64,
    last_pct: Option<u8>,
}

impl UtilizationMeter {
    pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

    pub fn new(capacity_bps: u64, window: Duration, now: Instant) -> Self {
        Self {
            capacity_bps: capacity_bps.max(1),
            window,
            window_start: now,
            bits: 0,
            last_pct: None,
        }
    }

    pub fn add_bits(&mut self, bits: u64, now: Instant) {
        self.roll(now);
        self.bits += bits;
    }

    pub fn sample(&mut self, now: Instant) -> Option<u8> {
        self.roll(now);
        self.last_pct
    }

    fn roll(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.window || elapsed.is_zero() {
            return;
        }
        let capacity = self.capacity_bps as f64 * elapsed.as_secs_f64();
        let pct = (self.bits as f64 * 100.0 / capacity).round().min(100.0);
        self.last_pct = Some(pct as u8);
        self.bits = 0;
        self.window_start = now;
    }
}
