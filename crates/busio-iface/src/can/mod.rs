//! Cyphal/CAN transport over SocketCAN

pub mod frame;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
mod adapter;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub use adapter::CanIface;
