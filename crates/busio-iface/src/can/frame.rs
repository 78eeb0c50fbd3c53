//! Cyphal/CAN framing for classic CAN
//!
//! Transfers use 29-bit identifiers:
//!
//! ```text
//! message: prio[28:26] 0[25] anon[24] 0[23] 11[22:21] subject[20:8] 0[7] src[6:0]
//! service: prio[28:26] 1[25] req[24] service[23:14] dst[13:7] src[6:0]
//! ```
//!
//! Each frame ends with a tail byte `SOT | EOT | toggle | transfer-ID % 32`.
//! Multi-frame transfers append a CRC-16/CCITT-FALSE (BE) of the payload and
//! alternate the toggle bit starting from 1.

use busio_core::{AlienTransfer, CanFrameData, DataSpecifier, ServiceRole};
use crc::{Crc, CRC_16_IBM_3740};

use crate::error::IfaceError;

/// Classic CAN data field
pub const CLASSIC_MTU: usize = 8;
pub const SUBJECT_ID_MAX: u16 = 8191;
pub const SERVICE_ID_MAX: u16 = 511;
pub const NODE_ID_MAX: u16 = 127;
pub const TRANSFER_ID_MODULO: u64 = 32;

const TAIL_START_OF_TRANSFER: u8 = 0x80;
const TAIL_END_OF_TRANSFER: u8 = 0x40;
const TAIL_TOGGLE: u8 = 0x20;

const FLAG_SERVICE: u32 = 1 << 25;
const FLAG_ANONYMOUS: u32 = 1 << 24;
const FLAG_REQUEST: u32 = 1 << 24;
const MESSAGE_RESERVED: u32 = 0b11 << 21;

const TRANSFER_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Build the 29-bit identifier for a transfer
pub fn can_id(transfer: &AlienTransfer) -> Result<u32, IfaceError> {
    let session = &transfer.session;
    let priority = u32::from(u8::from(transfer.priority)) << 26;
    match session.data_specifier {
        DataSpecifier::Message { subject_id } => {
            if subject_id > SUBJECT_ID_MAX {
                return Err(invalid(format!("Subject-ID {} exceeds {}", subject_id, SUBJECT_ID_MAX)));
            }
            if session.destination_node_id.is_some() {
                return Err(invalid(format!("Message transfer cannot be addressed: {}", session)));
            }
            let (anonymous, source) = match session.source_node_id {
                Some(src) => (0, u32::from(check_node(src)?)),
                // Anonymous publishers pick a pseudo-random source
                None => (
                    FLAG_ANONYMOUS,
                    u32::from(TRANSFER_CRC.checksum(&transfer.payload)) & u32::from(NODE_ID_MAX),
                ),
            };
            Ok(priority | anonymous | MESSAGE_RESERVED | (u32::from(subject_id) << 8) | source)
        }
        DataSpecifier::Service { service_id, role } => {
            if service_id > SERVICE_ID_MAX {
                return Err(invalid(format!("Service-ID {} exceeds {}", service_id, SERVICE_ID_MAX)));
            }
            let (src, dst) = match (session.source_node_id, session.destination_node_id) {
                (Some(src), Some(dst)) => (check_node(src)?, check_node(dst)?),
                _ => return Err(invalid(format!("Service transfer must be addressed: {}", session))),
            };
            let request = if role == ServiceRole::Request { FLAG_REQUEST } else { 0 };
            Ok(priority
                | FLAG_SERVICE
                | request
                | (u32::from(service_id) << 14)
                | (u32::from(dst) << 7)
                | u32::from(src))
        }
    }
}

fn check_node(node_id: u16) -> Result<u16, IfaceError> {
    if node_id > NODE_ID_MAX {
        return Err(invalid(format!("Node-ID {} exceeds {}", node_id, NODE_ID_MAX)));
    }
    Ok(node_id)
}

fn invalid(msg: String) -> IfaceError {
    IfaceError::InvalidTransfer(msg)
}

/// Split a transfer into classic CAN frames
pub fn serialize_transfer(transfer: &AlienTransfer) -> Result<Vec<CanFrameData>, IfaceError> {
    let can_id = can_id(transfer)?;
    let tid = (transfer.transfer_id % TRANSFER_ID_MODULO) as u8;
    let chunk_size = CLASSIC_MTU - 1;
    let frame = |data: Vec<u8>| CanFrameData {
        can_id,
        extended: true,
        data,
    };

    if transfer.payload.len() <= chunk_size {
        let mut data = transfer.payload.to_vec();
        data.push(TAIL_START_OF_TRANSFER | TAIL_END_OF_TRANSFER | TAIL_TOGGLE | tid);
        return Ok(vec![frame(data)]);
    }

    if transfer.session.source_node_id.is_none() {
        return Err(invalid("Anonymous transfers must fit into a single frame".to_string()));
    }

    let mut body = transfer.payload.to_vec();
    body.extend_from_slice(&TRANSFER_CRC.checksum(&transfer.payload).to_be_bytes());

    let chunks: Vec<&[u8]> = body.chunks(chunk_size).collect();
    let last = chunks.len() - 1;
    let mut toggle = true;
    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut tail = tid;
            if i == 0 {
                tail |= TAIL_START_OF_TRANSFER;
            }
            if i == last {
                tail |= TAIL_END_OF_TRANSFER;
            }
            if toggle {
                tail |= TAIL_TOGGLE;
            }
            toggle = !toggle;
            let mut data = chunk.to_vec();
            data.push(tail);
            frame(data)
        })
        .collect())
}

/// Approximate bits on the wire for an extended data frame, ignoring stuffing
pub fn frame_bits(data_len: usize) -> u64 {
    67 + 8 * data_len as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use busio_core::{Priority, SessionSpecifier};
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    fn message(source: Option<u16>, payload: &'static [u8], transfer_id: u64) -> AlienTransfer {
        AlienTransfer {
            priority: Priority::High,
            transfer_id,
            session: SessionSpecifier {
                data_specifier: DataSpecifier::Message { subject_id: 6666 },
                source_node_id: source,
                destination_node_id: None,
            },
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn test_message_id() {
        let id = can_id(&message(Some(123), b"", 0)).unwrap();
        assert_eq!(id, (3 << 26) | (3 << 21) | (6666 << 8) | 123);
        assert_eq!(id, 0x0C7A_0A7B);
    }

    #[test]
    fn test_anonymous_message_id() {
        let id = can_id(&message(None, b"abc", 0)).unwrap();
        assert_ne!(id & FLAG_ANONYMOUS, 0);
        assert_eq!(id & 0x7F, u32::from(TRANSFER_CRC.checksum(b"abc")) & 0x7F);
    }

    #[test]
    fn test_service_id() {
        let transfer = AlienTransfer {
            priority: Priority::Nominal,
            transfer_id: 0,
            session: SessionSpecifier {
                data_specifier: DataSpecifier::Service {
                    service_id: 430,
                    role: ServiceRole::Response,
                },
                source_node_id: Some(10),
                destination_node_id: Some(20),
            },
            payload: Bytes::new(),
        };
        assert_eq!(
            can_id(&transfer).unwrap(),
            (4 << 26) | (1 << 25) | (430 << 14) | (20 << 7) | 10
        );
    }

    #[test]
    fn test_single_frame_tail() {
        let frames = serialize_transfer(&message(Some(1), b"hi", 33)).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].extended);
        assert_eq!(frames[0].data, vec![b'h', b'i', 0xE0 | 1]);
    }

    #[test]
    fn test_multi_frame_toggle_and_crc() {
        let payload = b"0123456789";
        let frames = serialize_transfer(&message(Some(1), payload, 5)).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data.len(), 8);
        assert_eq!(frames[0].data[7], 0x80 | 0x20 | 5);
        assert_eq!(frames[1].data[5], 0x40 | 5);

        let crc = TRANSFER_CRC.checksum(payload).to_be_bytes();
        assert_eq!(&frames[1].data[3..5], &crc);
        let reassembled: Vec<u8> = frames
            .iter()
            .flat_map(|f| f.data[..f.data.len() - 1].to_vec())
            .collect();
        assert_eq!(&reassembled[..10], payload);
    }

    #[test]
    fn test_rejects_unrepresentable() {
        assert!(serialize_transfer(&message(None, b"0123456789", 0)).is_err());
        assert!(serialize_transfer(&message(Some(200), b"", 0)).is_err());
    }
}
