//! Bus node abstraction
//!
//! The service only needs a narrow slice of a bus node: typed publishers and
//! subscribers addressed by logical port name, and a shutdown signal. The
//! traits below capture that slice; [`LocalNode`] implements it in-process.

mod local;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::NodeError;

pub use local::LocalNode;

/// Anything that can travel over a port
pub trait Message: Clone + Send + Sync + fmt::Debug + 'static {}

impl<T> Message for T where T: Clone + Send + Sync + fmt::Debug + 'static {}

/// Sending half of a port
#[async_trait]
pub trait Publisher<T: Message>: Send + Sync {
    /// Publish one message; `false` means the publication timed out
    async fn publish(&self, msg: T) -> bool;
}

/// Receiving half of a port
#[async_trait]
pub trait Subscriber<T: Message>: Send {
    /// Wait for the next message; `None` once the port is gone.
    ///
    /// Must be cancel-safe: dropping the future loses no message.
    async fn receive(&mut self) -> Option<T>;

    /// Wait at most `timeout` for the next message
    async fn receive_for(&mut self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.receive())
            .await
            .ok()
            .flatten()
    }
}

/// Node-wide shutdown flag
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is requested or the node is gone
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|down| *down).await;
    }
}

/// Publish/subscribe node the service runs on
pub trait Node: Send + Sync {
    fn make_publisher<T: Message>(&self, port_name: &str)
        -> Result<Box<dyn Publisher<T>>, NodeError>;

    fn make_subscriber<T: Message>(
        &self,
        port_name: &str,
    ) -> Result<Box<dyn Subscriber<T>>, NodeError>;

    fn shutdown_signal(&self) -> ShutdownSignal;

    fn is_shutdown(&self) -> bool {
        self.shutdown_signal().is_shutdown()
    }
}

/// Port names follow `[a-z][a-z0-9_]*`
pub fn validate_port_name(name: &str) -> Result<(), NodeError> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(NodeError::InvalidPortName(name.to_string()))
    }
}
