//! Session addressing: wire sessions, internal specifiers, priorities

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Transfer priority, 0 (highest) to 7 (lowest)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum Priority {
    Exceptional = 0,
    Immediate = 1,
    Fast = 2,
    High = 3,
    #[default]
    Nominal = 4,
    Low = 5,
    Slow = 6,
    Optional = 7,
}

impl TryFrom<u8> for Priority {
    type Error = SessionError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Priority::Exceptional,
            1 => Priority::Immediate,
            2 => Priority::Fast,
            3 => Priority::High,
            4 => Priority::Nominal,
            5 => Priority::Low,
            6 => Priority::Slow,
            7 => Priority::Optional,
            other => return Err(SessionError::InvalidPriority(other)),
        })
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p as u8
    }
}

// =============================================================================
// Internal session specifier
// =============================================================================

/// Role of a service transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceRole {
    Request,
    Response,
}

/// What a transfer carries: a subject message or a service call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataSpecifier {
    Message { subject_id: u16 },
    Service { service_id: u16, role: ServiceRole },
}

/// Addressing tuple identifying one logical channel on the bus
///
/// This is the form used for transfer-ID bookkeeping; two transfers share a
/// transfer-ID sequence exactly when their specifiers are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionSpecifier {
    pub data_specifier: DataSpecifier,
    pub source_node_id: Option<u16>,
    pub destination_node_id: Option<u16>,
}

impl SessionSpecifier {
    pub fn is_service(&self) -> bool {
        matches!(self.data_specifier, DataSpecifier::Service { .. })
    }
}

impl fmt::Display for SessionSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = |n: Option<u16>| n.map_or_else(|| "*".to_string(), |n| n.to_string());
        match self.data_specifier {
            DataSpecifier::Message { subject_id } => {
                write!(f, "subject {} from {}", subject_id, node(self.source_node_id))
            }
            DataSpecifier::Service { service_id, role } => write!(
                f,
                "service {} {} {}->{}",
                service_id,
                match role {
                    ServiceRole::Request => "request",
                    ServiceRole::Response => "response",
                },
                node(self.source_node_id),
                node(self.destination_node_id)
            ),
        }
    }
}

// =============================================================================
// Wire session
// =============================================================================

/// Session as carried in spoof requests and loopback captures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Session {
    /// Subject broadcast, optionally attributed to a source node
    Subject {
        subject_id: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<u16>,
    },
    /// Point-to-point service exchange
    Service {
        service_id: u16,
        source: u16,
        destination: u16,
        is_request: bool,
    },
}

impl From<&Session> for SessionSpecifier {
    fn from(ses: &Session) -> Self {
        match *ses {
            Session::Subject { subject_id, source } => SessionSpecifier {
                data_specifier: DataSpecifier::Message { subject_id },
                source_node_id: source,
                destination_node_id: None,
            },
            Session::Service {
                service_id,
                source,
                destination,
                is_request,
            } => SessionSpecifier {
                data_specifier: DataSpecifier::Service {
                    service_id,
                    role: if is_request {
                        ServiceRole::Request
                    } else {
                        ServiceRole::Response
                    },
                },
                source_node_id: Some(source),
                destination_node_id: Some(destination),
            },
        }
    }
}

impl TryFrom<&SessionSpecifier> for Session {
    type Error = SessionError;

    fn try_from(ss: &SessionSpecifier) -> Result<Self, Self::Error> {
        match ss.data_specifier {
            DataSpecifier::Message { subject_id } => {
                if ss.destination_node_id.is_some() {
                    return Err(SessionError::NotRepresentable(ss.to_string()));
                }
                Ok(Session::Subject {
                    subject_id,
                    source: ss.source_node_id,
                })
            }
            DataSpecifier::Service { service_id, role } => {
                match (ss.source_node_id, ss.destination_node_id) {
                    (Some(source), Some(destination)) => Ok(Session::Service {
                        service_id,
                        source,
                        destination,
                        is_request: role == ServiceRole::Request,
                    }),
                    _ => Err(SessionError::NotRepresentable(ss.to_string())),
                }
            }
        }
    }
}
