//! Worker errors

use busio_core::NodeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Failure of a job submitted to the blocking pool
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Job cancelled")]
    Cancelled,

    #[error("Job panicked: {0}")]
    Panicked(String),

    #[error("Pool closed")]
    PoolClosed,
}
