//! Capture records published for every frame seen on an interface

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::session::{Priority, Session};
use super::timestamp::SyncTimestamp;

/// One captured frame, stamped and sequenced per interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capture {
    pub timestamp: SyncTimestamp,
    pub iface_id: u16,
    /// Starts at 0 for each newly created interface, increments by one
    pub sequence_number: u64,
    pub frame: Frame,
}

/// Transport-specific frame payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frame {
    Loopback(LoopbackFrame),
    Udp(UdpFrame),
    Can(CanFrameData),
}

impl Frame {
    /// Bytes carried by the medium for this frame
    pub fn media_len(&self) -> usize {
        match self {
            Frame::Loopback(f) => f.payload.len(),
            Frame::Udp(f) => f.payload.len(),
            Frame::Can(f) => f.data.len(),
        }
    }
}

/// Whole transfer observed on a loopback medium
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopbackFrame {
    pub priority: Priority,
    pub session: Session,
    pub transfer_id: u64,
    #[serde(with = "super::hex_bytes")]
    pub payload: Vec<u8>,
}

/// One datagram
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpFrame {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    #[serde(with = "super::hex_bytes")]
    pub payload: Vec<u8>,
}

/// One CAN data frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFrameData {
    pub can_id: u32,
    pub extended: bool,
    #[serde(with = "super::hex_bytes")]
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_payload_as_hex() {
        let cap = Capture {
            timestamp: SyncTimestamp { microsecond: 42 },
            iface_id: 3,
            sequence_number: 0,
            frame: Frame::Can(CanFrameData {
                can_id: 0x107D_5501,
                extended: true,
                data: vec![0xDE, 0xAD, 0xE0],
            }),
        };
        let json = serde_json::to_value(&cap).unwrap();
        assert_eq!(json["frame"]["can"]["data"], "deade0");
        let back: Capture = serde_json::from_value(json).unwrap();
        assert_eq!(back, cap);
        assert_eq!(back.frame.media_len(), 3);
    }
}
