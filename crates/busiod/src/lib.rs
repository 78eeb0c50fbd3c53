//! busiod - bus I/O daemon
//!
//! Runs the I/O worker on an in-process node and exposes the node's ports
//! over HTTP. The daemon stops when the node shuts down, either because the
//! controller heartbeat was lost or because it was asked to.

pub mod bridge;
pub mod config;

use std::net::SocketAddr;

use anyhow::Context;
use busio_core::{LocalNode, Node};
use busio_io::Worker;
use tokio::task::JoinHandle;

pub use bridge::{create_router, BridgeState};
pub use config::DaemonConfig;

/// A running daemon
pub struct Daemon {
    addr: SocketAddr,
    node: LocalNode,
    server: JoinHandle<std::io::Result<()>>,
    worker: JoinHandle<Worker>,
}

impl Daemon {
    /// Bind the HTTP listener, start the worker and publish the startup configuration
    pub async fn start(config: DaemonConfig) -> anyhow::Result<Self> {
        let node = LocalNode::new();
        if let Some(timeout) = config.node.heartbeat_timeout() {
            tracing::info!(timeout_ms = config.node.heartbeat_timeout_ms, "Deadman switch armed");
            node.spawn_deadman(timeout);
        }

        let mut worker =
            Worker::new(&node, config.worker.clone()).context("Failed to create I/O worker")?;
        let state = BridgeState::new(&node, &config.worker.ports)
            .context("Failed to bind bridge ports")?;

        let bind = format!("{}:{}", config.server.host, config.server.port);
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .with_context(|| format!("Failed to bind {}", bind))?;
        let addr = listener.local_addr()?;

        let worker = tokio::spawn(async move {
            worker.run().await;
            worker
        });

        if let Some(io_config) = config.initial_io_config() {
            tracing::info!(interfaces = io_config.iface_config.len(), "Applying startup configuration");
            state.publish_config(io_config).await;
        }

        let app = create_router(state);
        let mut shutdown = node.shutdown_signal();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.wait().await })
                .await
        });

        tracing::info!("Listening on http://{}", addr);
        Ok(Self {
            addr,
            node,
            server,
            worker,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn node(&self) -> &LocalNode {
        &self.node
    }

    /// Wait until the node shuts down and everything has stopped
    pub async fn wait(self) -> anyhow::Result<()> {
        let served = self.server.await.context("HTTP server task failed")?;
        // The server also stops on its own errors; take the node down with it
        self.node.close();
        let worker = self.worker.await.context("I/O worker task failed")?;
        tracing::info!(
            status_timeouts = worker.publish_timeouts(),
            capture_timeouts = worker.capture_publish_timeouts(),
            "Daemon stopped"
        );
        served.context("HTTP server failed")
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.node.close();
        self.wait().await
    }
}
