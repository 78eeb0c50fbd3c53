//! Common error types for the node and the session model

use thiserror::Error;

/// Errors raised by a bus node when creating ports
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Port name does not match `[a-z][a-z0-9_]*`
    #[error("Invalid port name: {0:?}")]
    InvalidPortName(String),

    /// Port already carries a different message type
    #[error("Port {port:?} is bound to {existing}, requested {requested}")]
    TypeMismatch {
        port: String,
        existing: &'static str,
        requested: &'static str,
    },

    /// Node has been closed
    #[error("Node is closed")]
    Closed,
}

/// Errors converting between wire sessions and session specifiers
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Specifier has no wire representation
    #[error("Session not representable: {0}")]
    NotRepresentable(String),

    /// Priority value outside 0..=7
    #[error("Invalid priority: {0}")]
    InvalidPriority(u8),
}
