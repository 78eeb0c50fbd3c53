//! Cyphal/UDP-style transport over IPv4 multicast

mod adapter;
pub mod frame;

pub use adapter::UdpIface;
