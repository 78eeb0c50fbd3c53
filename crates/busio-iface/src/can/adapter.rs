//! SocketCAN interface

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};

use async_trait::async_trait;
use busio_core::{AlienTransfer, CanConfig, CanFrameData, Frame, Timestamp};
use parking_lot::Mutex;
use socketcan::{
    CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame as _, Id, Socket, StandardId,
};
use tokio::time::Instant;

use super::frame::{self, frame_bits};
use crate::adapter::{CaptureHandler, CaptureHandlers, Iface, IfaceCapture};
use crate::error::IfaceError;
use crate::stats::{IfaceStatistics, StatsCell, UtilizationMeter};

const IDLE_POLL: Duration = Duration::from_millis(1);
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Raw CAN interface on a SocketCAN device
pub struct CanIface {
    config: CanConfig,
    socket: Arc<Mutex<CanSocket>>,
    handlers: Arc<CaptureHandlers>,
    stats: Arc<StatsCell>,
    meter: Option<Arc<Mutex<UtilizationMeter>>>,
    closed: Arc<AtomicBool>,
}

impl CanIface {
    /// Open the device and start the reader. Must be called within a tokio runtime.
    pub fn new(config: &CanConfig) -> Result<Self, IfaceError> {
        let socket = CanSocket::open(&config.interface).map_err(|e| {
            IfaceError::ConnectionFailed(format!("Failed to open {}: {}", config.interface, e))
        })?;
        socket.set_nonblocking(true).map_err(|e| {
            IfaceError::InvalidConfig(format!("Failed to set non-blocking: {}", e))
        })?;

        let meter = config.bitrate.map(|bps| {
            Arc::new(Mutex::new(UtilizationMeter::new(
                u64::from(bps),
                UtilizationMeter::DEFAULT_WINDOW,
                StdInstant::now(),
            )))
        });

        let iface = Self {
            config: config.clone(),
            socket: Arc::new(Mutex::new(socket)),
            handlers: Arc::new(CaptureHandlers::new()),
            stats: Arc::new(StatsCell::new()),
            meter,
            closed: Arc::new(AtomicBool::new(false)),
        };
        iface.start_reader();

        tracing::info!(interface = %config.interface, bitrate = ?config.bitrate, "CAN interface opened");
        Ok(iface)
    }

    fn start_reader(&self) {
        let socket = self.socket.clone();
        let handlers = self.handlers.clone();
        let stats = self.stats.clone();
        let meter = self.meter.clone();
        let closed = self.closed.clone();
        let interface = self.config.interface.clone();

        tokio::task::spawn_blocking(move || {
            while !closed.load(Ordering::SeqCst) {
                let result = socket.lock().read_frame();
                match result {
                    Ok(_) if closed.load(Ordering::SeqCst) => break,
                    Ok(CanFrame::Error(err)) => {
                        stats.record_error();
                        tracing::debug!(interface = %interface, error = ?err, "CAN error frame");
                    }
                    Ok(can_frame) => {
                        let data = can_frame.data().to_vec();
                        if let Some(meter) = &meter {
                            meter.lock().add_bits(frame_bits(data.len()), StdInstant::now());
                        }
                        stats.record_frame(data.len());
                        handlers.dispatch(IfaceCapture {
                            timestamp: Timestamp::now(),
                            frame: Frame::Can(CanFrameData {
                                can_id: can_frame.raw_id(),
                                extended: EmbeddedFrame::is_extended(&can_frame),
                                data,
                            }),
                        });
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        std::thread::sleep(IDLE_POLL);
                    }
                    Err(e) => {
                        if closed.load(Ordering::SeqCst) {
                            break;
                        }
                        stats.record_error();
                        tracing::error!(interface = %interface, error = %e, "CAN read error");
                        std::thread::sleep(ERROR_BACKOFF);
                    }
                }
            }
            tracing::debug!(interface = %interface, "CAN reader stopped");
        });
    }

    fn to_socket_frame(data: &CanFrameData) -> Result<CanFrame, IfaceError> {
        let id: Id = if data.extended {
            ExtendedId::new(data.can_id)
                .ok_or_else(|| IfaceError::InvalidTransfer(format!("Invalid extended CAN ID: 0x{:X}", data.can_id)))?
                .into()
        } else {
            u16::try_from(data.can_id)
                .ok()
                .and_then(StandardId::new)
                .ok_or_else(|| IfaceError::InvalidTransfer(format!("Invalid standard CAN ID: 0x{:X}", data.can_id)))?
                .into()
        };
        CanFrame::new(id, &data.data)
            .ok_or_else(|| IfaceError::InvalidTransfer(format!("Frame too long: {} bytes", data.data.len())))
    }
}

/// Transmit queue full; retry until the deadline
fn is_backpressure(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::ENOBUFS)
}

impl fmt::Debug for CanIface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanIface")
            .field("interface", &self.config.interface)
            .field("bitrate", &self.config.bitrate)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Iface for CanIface {
    fn transport_name(&self) -> &'static str {
        "can"
    }

    fn begin_capture(&self, handler: CaptureHandler) {
        self.handlers.add(handler);
    }

    async fn spoof(&self, transfer: &AlienTransfer, deadline: Instant) -> Result<bool, IfaceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IfaceError::ResourceClosed);
        }
        let frames = frame::serialize_transfer(transfer)?
            .iter()
            .map(Self::to_socket_frame)
            .collect::<Result<Vec<_>, _>>()?;

        let socket = self.socket.clone();
        let closed = self.closed.clone();
        let meter = self.meter.clone();
        let std_deadline = deadline.into_std();

        let send = tokio::task::spawn_blocking(move || -> Result<bool, IfaceError> {
            for can_frame in &frames {
                loop {
                    if closed.load(Ordering::SeqCst) {
                        return Err(IfaceError::ResourceClosed);
                    }
                    let result = socket.lock().write_frame(can_frame);
                    match result {
                        Ok(()) => break,
                        Err(ref e) if is_backpressure(e) => {
                            if StdInstant::now() >= std_deadline {
                                return Ok(false);
                            }
                            std::thread::sleep(IDLE_POLL);
                        }
                        Err(e) => return Err(IfaceError::SendFailed(e.to_string())),
                    }
                }
                if let Some(meter) = &meter {
                    meter
                        .lock()
                        .add_bits(frame_bits(can_frame.data().len()), StdInstant::now());
                }
            }
            Ok(true)
        });

        match tokio::time::timeout_at(deadline, send).await {
            Err(_) => Ok(false),
            Ok(Err(join)) => Err(IfaceError::SendFailed(join.to_string())),
            Ok(Ok(result)) => {
                if matches!(result, Err(IfaceError::SendFailed(_))) {
                    self.stats.record_error();
                }
                result
            }
        }
    }

    fn sample_statistics(&self) -> IfaceStatistics {
        if let Some(meter) = &self.meter {
            let pct = meter.lock().sample(StdInstant::now());
            self.stats.set_utilization(pct);
        }
        self.stats.snapshot()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.handlers.clear();
            tracing::info!(interface = %self.config.interface, "CAN interface closed");
        }
    }
}

impl Drop for CanIface {
    fn drop(&mut self) {
        self.close();
    }
}
