//! Datagram framing
//!
//! Every datagram starts with a 24-byte header:
//!
//! ```text
//! 0      version (1)
//! 1      priority
//! 2..4   source node-ID          (LE, 0xFFFF = anonymous)
//! 4..6   destination node-ID     (LE, 0xFFFF = broadcast)
//! 6..8   data specifier          (LE, bit 15 service, bit 14 request)
//! 8..16  transfer-ID             (LE)
//! 16..20 frame index             (LE, bit 31 end of transfer)
//! 20..22 user data               (zero)
//! 22..24 header CRC-16/CCITT-FALSE (BE)
//! ```
//!
//! The transfer payload is followed by its CRC-32C (LE) and split across
//! datagrams of at most `mtu` bytes each.

use std::net::Ipv4Addr;

use busio_core::{AlienTransfer, DataSpecifier, ServiceRole, SessionSpecifier};
use crc::{Crc, CRC_16_IBM_3740, CRC_32_ISCSI};

use crate::error::IfaceError;

pub const HEADER_SIZE: usize = 24;
pub const HEADER_VERSION: u8 = 1;
pub const ANONYMOUS_NODE_ID: u16 = 0xFFFF;
pub const SUBJECT_ID_MAX: u16 = 8191;
pub const SERVICE_ID_MAX: u16 = 511;
pub const TRANSFER_CRC_SIZE: usize = 4;

const SERVICE_NOT_MESSAGE: u16 = 0x8000;
const REQUEST_NOT_RESPONSE: u16 = 0x4000;
const END_OF_TRANSFER: u32 = 1 << 31;

const SUBJECT_GROUP_BASE: u32 = 0xEF00_0000; // 239.0.0.0
const SERVICE_GROUP_BASE: u32 = 0xEF01_0000; // 239.1.0.0

pub(crate) const HEADER_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);
pub(crate) const TRANSFER_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Decoded datagram header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub priority: u8,
    pub source_node_id: u16,
    pub destination_node_id: u16,
    pub data_specifier: u16,
    pub transfer_id: u64,
    pub frame_index: u32,
    pub end_of_transfer: bool,
}

impl UdpHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0] = HEADER_VERSION;
        out[1] = self.priority;
        out[2..4].copy_from_slice(&self.source_node_id.to_le_bytes());
        out[4..6].copy_from_slice(&self.destination_node_id.to_le_bytes());
        out[6..8].copy_from_slice(&self.data_specifier.to_le_bytes());
        out[8..16].copy_from_slice(&self.transfer_id.to_le_bytes());
        let index = self.frame_index | if self.end_of_transfer { END_OF_TRANSFER } else { 0 };
        out[16..20].copy_from_slice(&index.to_le_bytes());
        let crc = HEADER_CRC.checksum(&out[..HEADER_SIZE - 2]);
        out[HEADER_SIZE - 2..].copy_from_slice(&crc.to_be_bytes());
        out
    }

    /// Parse the header at the start of `datagram`; `None` if absent or corrupt
    pub fn decode(datagram: &[u8]) -> Option<Self> {
        let raw = datagram.get(..HEADER_SIZE)?;
        if raw[0] != HEADER_VERSION {
            return None;
        }
        let crc = u16::from_be_bytes([raw[22], raw[23]]);
        if HEADER_CRC.checksum(&raw[..HEADER_SIZE - 2]) != crc {
            return None;
        }
        let index = u32::from_le_bytes([raw[16], raw[17], raw[18], raw[19]]);
        let mut tid = [0u8; 8];
        tid.copy_from_slice(&raw[8..16]);
        Some(Self {
            priority: raw[1],
            source_node_id: u16::from_le_bytes([raw[2], raw[3]]),
            destination_node_id: u16::from_le_bytes([raw[4], raw[5]]),
            data_specifier: u16::from_le_bytes([raw[6], raw[7]]),
            transfer_id: u64::from_le_bytes(tid),
            frame_index: index & !END_OF_TRANSFER,
            end_of_transfer: index & END_OF_TRANSFER != 0,
        })
    }

    pub fn is_service(&self) -> bool {
        self.data_specifier & SERVICE_NOT_MESSAGE != 0
    }

    /// Multicast group this header addresses
    pub fn destination_group(&self) -> Ipv4Addr {
        if self.is_service() {
            service_group(self.destination_node_id)
        } else {
            subject_group(self.data_specifier & SUBJECT_ID_MAX)
        }
    }
}

pub fn subject_group(subject_id: u16) -> Ipv4Addr {
    Ipv4Addr::from(SUBJECT_GROUP_BASE | u32::from(subject_id))
}

pub fn service_group(node_id: u16) -> Ipv4Addr {
    Ipv4Addr::from(SERVICE_GROUP_BASE | u32::from(node_id))
}

/// Multicast group a transfer on `session` is sent to
pub fn destination_group(session: &SessionSpecifier) -> Result<Ipv4Addr, IfaceError> {
    match session.data_specifier {
        DataSpecifier::Message { subject_id } => {
            check_subject(subject_id)?;
            Ok(subject_group(subject_id))
        }
        DataSpecifier::Service { .. } => {
            let dst = session.destination_node_id.ok_or_else(|| {
                IfaceError::InvalidTransfer(format!("Service transfer without destination: {}", session))
            })?;
            Ok(service_group(dst))
        }
    }
}

fn check_subject(subject_id: u16) -> Result<(), IfaceError> {
    if subject_id > SUBJECT_ID_MAX {
        return Err(IfaceError::InvalidTransfer(format!(
            "Subject-ID {} exceeds {}",
            subject_id, SUBJECT_ID_MAX
        )));
    }
    Ok(())
}

fn data_specifier(session: &SessionSpecifier) -> Result<u16, IfaceError> {
    match session.data_specifier {
        DataSpecifier::Message { subject_id } => {
            check_subject(subject_id)?;
            Ok(subject_id)
        }
        DataSpecifier::Service { service_id, role } => {
            if service_id > SERVICE_ID_MAX {
                return Err(IfaceError::InvalidTransfer(format!(
                    "Service-ID {} exceeds {}",
                    service_id, SERVICE_ID_MAX
                )));
            }
            let request = if role == ServiceRole::Request {
                REQUEST_NOT_RESPONSE
            } else {
                0
            };
            Ok(SERVICE_NOT_MESSAGE | request | service_id)
        }
    }
}

/// Split a transfer into datagrams carrying at most `mtu` payload bytes each
pub fn serialize_transfer(transfer: &AlienTransfer, mtu: usize) -> Result<Vec<Vec<u8>>, IfaceError> {
    if mtu == 0 {
        return Err(IfaceError::InvalidConfig("MTU must be positive".to_string()));
    }
    let ds = data_specifier(&transfer.session)?;
    if transfer.session.is_service()
        && (transfer.session.source_node_id.is_none() || transfer.session.destination_node_id.is_none())
    {
        return Err(IfaceError::InvalidTransfer(format!(
            "Service transfer must be addressed: {}",
            transfer.session
        )));
    }

    let mut body = Vec::with_capacity(transfer.payload.len() + TRANSFER_CRC_SIZE);
    body.extend_from_slice(&transfer.payload);
    body.extend_from_slice(&TRANSFER_CRC.checksum(&transfer.payload).to_le_bytes());

    let chunks: Vec<&[u8]> = body.chunks(mtu).collect();
    let last = chunks.len().saturating_sub(1);
    chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| {
            let frame_index = u32::try_from(index)
                .ok()
                .filter(|i| i & END_OF_TRANSFER == 0)
                .ok_or_else(|| IfaceError::InvalidTransfer("Transfer too large".to_string()))?;
            let header = UdpHeader {
                priority: u8::from(transfer.priority),
                source_node_id: transfer.session.source_node_id.unwrap_or(ANONYMOUS_NODE_ID),
                destination_node_id: transfer
                    .session
                    .destination_node_id
                    .unwrap_or(ANONYMOUS_NODE_ID),
                data_specifier: ds,
                transfer_id: transfer.transfer_id,
                frame_index,
                end_of_transfer: index == last,
            };
            let mut datagram = Vec::with_capacity(HEADER_SIZE + chunk.len());
            datagram.extend_from_slice(&header.encode());
            datagram.extend_from_slice(chunk);
            Ok(datagram)
        })
        .collect()
}
