//! Interface contract

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use busio_core::{AlienTransfer, Frame, Timestamp};
use parking_lot::RwLock;
use tokio::time::Instant;

use crate::error::IfaceError;
use crate::stats::IfaceStatistics;

/// One frame seen on the medium
#[derive(Debug, Clone, PartialEq)]
pub struct IfaceCapture {
    pub timestamp: Timestamp,
    pub frame: Frame,
}

/// Callback invoked for every captured frame.
///
/// May be called from any thread, including blocking reader threads.
pub type CaptureHandler = Arc<dyn Fn(IfaceCapture) + Send + Sync>;

/// Live connection to one transport medium
#[async_trait]
pub trait Iface: Send + Sync + fmt::Debug {
    /// Short transport name for logs
    fn transport_name(&self) -> &'static str;

    /// Register a handler that receives every frame from now on
    fn begin_capture(&self, handler: CaptureHandler);

    /// Transmit a transfer, giving up at `deadline`.
    ///
    /// Returns `Ok(true)` when transmitted and `Ok(false)` when the deadline
    /// expired first.
    async fn spoof(&self, transfer: &AlienTransfer, deadline: Instant) -> Result<bool, IfaceError>;

    /// Snapshot of the running media-layer counters
    fn sample_statistics(&self) -> IfaceStatistics;

    /// Release the medium. Idempotent.
    fn close(&self);
}

/// Registry of capture handlers shared with reader threads
#[derive(Default)]
pub struct CaptureHandlers {
    handlers: RwLock<Vec<CaptureHandler>>,
}

impl CaptureHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, handler: CaptureHandler) {
        self.handlers.write().push(handler);
    }

    /// Drop every handler; later captures go nowhere
    pub fn clear(&self) {
        self.handlers.write().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Deliver a capture to every registered handler
    pub fn dispatch(&self, capture: IfaceCapture) {
        let handlers = self.handlers.read().clone();
        if let Some((last, rest)) = handlers.split_last() {
            for handler in rest {
                handler(capture.clone());
            }
            last(capture);
        }
    }
}

impl fmt::Debug for CaptureHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureHandlers")
            .field("count", &self.handlers.read().len())
            .finish()
    }
}
