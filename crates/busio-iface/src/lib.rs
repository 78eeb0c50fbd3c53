//! Interface adapters for bus I/O
//!
//! An interface ("iface") is a live connection to one transport medium. It
//! reports every frame it sees to registered capture handlers, injects
//! synthetic (spoofed) transfers, and keeps running statistics.
//!
//! Adapters:
//! - Loopback: in-process medium that reflects spoofed transfers as captures
//! - UDP: Cyphal/UDP-style datagrams over IPv4 multicast
//! - CAN: Cyphal/CAN frames over SocketCAN (Linux only, `socketcan` feature)
//!
//! Construction is blocking and may take a long time (opening sockets,
//! joining multicast groups), so callers are expected to run [`construct`]
//! off the async executor.

pub mod adapter;
pub mod can;
pub mod error;
pub mod loopback;
pub mod stats;
pub mod udp;

pub use adapter::{CaptureHandler, CaptureHandlers, Iface, IfaceCapture};
pub use error::IfaceError;
pub use loopback::LoopbackIface;
pub use stats::{IfaceStatistics, StatsCell, UtilizationMeter};
pub use udp::UdpIface;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub use can::CanIface;

use std::sync::Arc;

use busio_core::TransportConfig;

/// Create an interface from its transport configuration (blocking)
pub fn construct(config: &TransportConfig) -> Result<Arc<dyn Iface>, IfaceError> {
    match config {
        TransportConfig::Loopback(cfg) => {
            let iface = LoopbackIface::new(cfg)?;
            Ok(Arc::new(iface))
        }
        TransportConfig::Udp(cfg) => {
            let iface = UdpIface::new(cfg)?;
            Ok(Arc::new(iface))
        }
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        TransportConfig::Can(cfg) => {
            let iface = CanIface::new(cfg)?;
            Ok(Arc::new(iface))
        }
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        TransportConfig::Can(_) => Err(IfaceError::Unsupported(
            "CAN requires Linux and the 'socketcan' feature".to_string(),
        )),
    }
}
