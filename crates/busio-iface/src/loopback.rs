//! Loopback interface
//!
//! An in-process medium. Every spoofed transfer is reflected back to the
//! capture handlers as a whole-transfer frame. Latency, spoof outcome and
//! construction failure are configurable so the I/O worker can be exercised
//! without hardware.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use busio_core::{
    AlienTransfer, Frame, LoopbackConfig, LoopbackFrame, Session, SpoofBehavior, Timestamp,
};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::adapter::{CaptureHandler, CaptureHandlers, Iface, IfaceCapture};
use crate::error::IfaceError;
use crate::stats::{IfaceStatistics, StatsCell};

pub struct LoopbackIface {
    latency: Duration,
    spoof_result: Mutex<SpoofBehavior>,
    handlers: CaptureHandlers,
    stats: StatsCell,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl LoopbackIface {
    pub fn new(config: &LoopbackConfig) -> Result<Self, IfaceError> {
        if let Some(reason) = &config.construction_error {
            return Err(IfaceError::ConnectionFailed(reason.clone()));
        }
        tracing::debug!(latency_ms = config.latency_ms, "Loopback interface created");
        Ok(Self {
            latency: Duration::from_millis(config.latency_ms),
            spoof_result: Mutex::new(config.spoof_result),
            handlers: CaptureHandlers::new(),
            stats: StatsCell::new(),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        })
    }

    /// Change what subsequent spoofs do
    pub fn set_spoof_result(&self, behavior: SpoofBehavior) {
        *self.spoof_result.lock() = behavior;
    }

    /// Number of times [`Iface::close`] has been called
    pub fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), IfaceError> {
        if self.is_closed() {
            Err(IfaceError::ResourceClosed)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for LoopbackIface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackIface")
            .field("latency", &self.latency)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Iface for LoopbackIface {
    fn transport_name(&self) -> &'static str {
        "loopback"
    }

    fn begin_capture(&self, handler: CaptureHandler) {
        self.handlers.add(handler);
    }

    async fn spoof(&self, transfer: &AlienTransfer, deadline: Instant) -> Result<bool, IfaceError> {
        self.ensure_open()?;
        let session = Session::try_from(&transfer.session)
            .map_err(|e| IfaceError::InvalidTransfer(e.to_string()))?;

        if !self.latency.is_zero() {
            let done = Instant::now() + self.latency;
            if done > deadline {
                tokio::time::sleep_until(deadline).await;
                return Ok(false);
            }
            tokio::time::sleep_until(done).await;
            self.ensure_open()?;
        }

        let behavior = *self.spoof_result.lock();
        match behavior {
            SpoofBehavior::Deliver => {
                let frame = LoopbackFrame {
                    priority: transfer.priority,
                    session,
                    transfer_id: transfer.transfer_id,
                    payload: transfer.payload.to_vec(),
                };
                self.stats.record_frame(frame.payload.len());
                self.handlers.dispatch(IfaceCapture {
                    timestamp: Timestamp::now(),
                    frame: Frame::Loopback(frame),
                });
                Ok(true)
            }
            SpoofBehavior::Timeout => Ok(false),
            SpoofBehavior::Fail => {
                self.stats.record_error();
                Err(IfaceError::SendFailed("Intended failure".to_string()))
            }
        }
    }

    fn sample_statistics(&self) -> IfaceStatistics {
        self.stats.snapshot()
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("Loopback interface closed");
        }
    }
}
