//! In-process node backed by broadcast channels

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{validate_port_name, Message, Node, Publisher, ShutdownSignal, Subscriber};
use crate::error::NodeError;

const DEFAULT_PORT_CAPACITY: usize = 1024;

/// In-process node: every port is a typed broadcast channel
///
/// Cloning yields another handle to the same node.
#[derive(Clone)]
pub struct LocalNode {
    inner: Arc<Inner>,
}

struct Inner {
    ports: Mutex<HashMap<String, PortEntry>>,
    capacity: usize,
    shutdown_tx: watch::Sender<bool>,
    last_heartbeat: Mutex<Instant>,
}

struct PortEntry {
    type_name: &'static str,
    sender: Box<dyn Any + Send + Sync>,
}

impl LocalNode {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_PORT_CAPACITY)
    }

    /// Create a node whose ports buffer up to `capacity` messages per subscriber
    pub fn with_capacity(capacity: usize) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                ports: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
                shutdown_tx,
                last_heartbeat: Mutex::new(Instant::now()),
            }),
        }
    }

    /// Raise the shutdown signal
    pub fn close(&self) {
        if !self.inner.shutdown_tx.send_replace(true) {
            info!("Node closing");
        }
    }

    /// Record a controller heartbeat for the deadman switch
    pub fn heartbeat(&self) {
        *self.inner.last_heartbeat.lock() = Instant::now();
    }

    /// Close the node once heartbeats stop arriving for longer than `timeout`
    pub fn spawn_deadman(&self, timeout: Duration) -> JoinHandle<()> {
        let node = self.clone();
        let check_every = (timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
        self.heartbeat();

        tokio::spawn(async move {
            let mut shutdown = node.shutdown_signal();
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(check_every) => {}
                }
                let silent_for = node.inner.last_heartbeat.lock().elapsed();
                if silent_for > timeout {
                    error!(
                        silent_ms = silent_for.as_millis() as u64,
                        timeout_ms = timeout.as_millis() as u64,
                        "Controller heartbeat lost, closing node"
                    );
                    node.close();
                    break;
                }
            }
            debug!("Deadman switch stopped");
        })
    }

    fn port<T: Message>(&self, port_name: &str) -> Result<broadcast::Sender<T>, NodeError> {
        validate_port_name(port_name)?;
        let mut ports = self.inner.ports.lock();
        let entry = ports.entry(port_name.to_string()).or_insert_with(|| {
            let (tx, _) = broadcast::channel::<T>(self.inner.capacity);
            debug!(port = port_name, msg_type = type_name::<T>(), "Port created");
            PortEntry {
                type_name: type_name::<T>(),
                sender: Box::new(tx),
            }
        });

        entry
            .sender
            .downcast_ref::<broadcast::Sender<T>>()
            .cloned()
            .ok_or_else(|| NodeError::TypeMismatch {
                port: port_name.to_string(),
                existing: entry.type_name,
                requested: type_name::<T>(),
            })
    }
}

impl Default for LocalNode {
    fn default() -> Self {
        Self::new()
    }
}

impl Node for LocalNode {
    fn make_publisher<T: Message>(
        &self,
        port_name: &str,
    ) -> Result<Box<dyn Publisher<T>>, NodeError> {
        if self.is_shutdown() {
            return Err(NodeError::Closed);
        }
        Ok(Box::new(LocalPublisher {
            port: port_name.to_string(),
            tx: self.port::<T>(port_name)?,
            shutdown: self.shutdown_signal(),
        }))
    }

    fn make_subscriber<T: Message>(
        &self,
        port_name: &str,
    ) -> Result<Box<dyn Subscriber<T>>, NodeError> {
        if self.is_shutdown() {
            return Err(NodeError::Closed);
        }
        Ok(Box::new(LocalSubscriber {
            port: port_name.to_string(),
            rx: self.port::<T>(port_name)?.subscribe(),
        }))
    }

    fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal::new(self.inner.shutdown_tx.subscribe())
    }
}

struct LocalPublisher<T> {
    port: String,
    tx: broadcast::Sender<T>,
    shutdown: ShutdownSignal,
}

#[async_trait]
impl<T: Message> Publisher<T> for LocalPublisher<T> {
    async fn publish(&self, msg: T) -> bool {
        if self.shutdown.is_shutdown() {
            return false;
        }
        // A port nobody listens to still counts as transmitted
        if self.tx.send(msg).is_err() {
            debug!(port = %self.port, "Published with no subscribers");
        }
        true
    }
}

struct LocalSubscriber<T> {
    port: String,
    rx: broadcast::Receiver<T>,
}

#[async_trait]
impl<T: Message> Subscriber<T> for LocalSubscriber<T> {
    async fn receive(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(port = %self.port, skipped = n, "Subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
