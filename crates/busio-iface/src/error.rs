//! Interface errors

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IfaceError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The interface has been closed; no further operations are possible
    #[error("Interface closed")]
    ResourceClosed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transfer cannot be expressed on this transport
    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),

    #[error("Transport not supported: {0}")]
    Unsupported(String),
}

impl IfaceError {
    /// Whether the owning worker should stop using this interface
    pub fn is_resource_closed(&self) -> bool {
        matches!(self, IfaceError::ResourceClosed)
    }
}
