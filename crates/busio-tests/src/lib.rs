//! Integration tests for busio
//!
//! - `worker_e2e_test.rs` - I/O worker driven through its node ports
//! - `bridge_e2e_test.rs` - daemon HTTP bridge over real sockets
//! - `can_e2e_test.rs` - CAN interfaces on vcan0 (skipped when absent)
//!
//! ```bash
//! # Optional: virtual CAN for the CAN tests (requires sudo)
//! sudo modprobe vcan
//! sudo ip link add dev vcan0 type vcan
//! sudo ip link set up vcan0
//!
//! cargo test -p busio-tests -- --test-threads=1
//! ```
//!
//! The library part holds the shared harness.

use std::collections::BTreeSet;
use std::time::Duration;

use busio_core::{
    Capture, IfaceConfig, IoConfig, IoStatus, LocalNode, LoopbackConfig, Node, Priority,
    Publisher, Session, Spoof, Subscriber, TransportConfig,
};
use busio_io::{Constructor, Worker, WorkerConfig};
use tokio::task::JoinHandle;

/// Worker running on its own node, with the test holding the other ends of its ports
pub struct WorkerHarness {
    pub node: LocalNode,
    config_pub: Box<dyn Publisher<IoConfig>>,
    spoof_pub: Box<dyn Publisher<Spoof>>,
    status_sub: Box<dyn Subscriber<IoStatus>>,
    capture_sub: Box<dyn Subscriber<Capture>>,
    worker: JoinHandle<Worker>,
}

/// Worker settings with a short update period so tests run quickly
pub fn test_worker_config() -> WorkerConfig {
    WorkerConfig {
        max_update_period_ms: 50,
        shutdown_grace_ms: 500,
        ..Default::default()
    }
}

impl WorkerHarness {
    pub fn start() -> Self {
        Self::start_with(None)
    }

    pub fn start_with(constructor: Option<Constructor>) -> Self {
        let node = LocalNode::new();
        let config = test_worker_config();
        let ports = config.ports.clone();

        // Subscribe before the worker starts publishing
        let status_sub = node.make_subscriber(&ports.status).expect("status port");
        let capture_sub = node.make_subscriber(&ports.capture).expect("capture port");

        let mut worker = Worker::new(&node, config).expect("worker");
        if let Some(constructor) = constructor {
            worker = worker.with_constructor(constructor);
        }
        let worker = tokio::spawn(async move {
            worker.run().await;
            worker
        });

        Self {
            config_pub: node.make_publisher(&ports.config).expect("config port"),
            spoof_pub: node.make_publisher(&ports.spoof).expect("spoof port"),
            status_sub,
            capture_sub,
            worker,
            node,
        }
    }

    pub async fn configure(&self, ifaces: Vec<IfaceConfig>) {
        assert!(self.config_pub.publish(IoConfig::new(ifaces)).await);
    }

    pub async fn spoof(&self, spoof: Spoof) {
        assert!(self.spoof_pub.publish(spoof).await);
    }

    /// Wait for a status report satisfying `pred`
    pub async fn wait_status(
        &mut self,
        timeout: Duration,
        pred: impl Fn(&IoStatus) -> bool,
    ) -> Option<IoStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match self.status_sub.receive_for(remaining).await {
                Some(status) if pred(&status) => return Some(status),
                Some(_) => continue,
                None => return None,
            }
        }
    }

    pub async fn next_capture(&mut self, timeout: Duration) -> Option<Capture> {
        self.capture_sub.receive_for(timeout).await
    }

    /// Abort the worker task without raising the node's shutdown signal
    pub async fn abort(self) {
        self.worker.abort();
        let joined = tokio::time::timeout(Duration::from_secs(5), self.worker)
            .await
            .expect("aborted worker did not finish");
        assert!(joined.is_err_and(|e| e.is_cancelled()));
    }

    /// Shut the node down and wait for the worker to finish
    pub async fn stop(self) -> Worker {
        self.node.close();
        tokio::time::timeout(Duration::from_secs(5), self.worker)
            .await
            .expect("worker did not stop")
            .expect("worker panicked")
    }
}

pub fn loopback(iface_id: u16) -> IfaceConfig {
    loopback_with(iface_id, LoopbackConfig::default())
}

pub fn loopback_with(iface_id: u16, config: LoopbackConfig) -> IfaceConfig {
    IfaceConfig {
        iface_id,
        transport: TransportConfig::Loopback(config),
    }
}

/// Loopback interface whose construction always fails with `reason`
pub fn failing(iface_id: u16, reason: &str) -> IfaceConfig {
    loopback_with(
        iface_id,
        LoopbackConfig {
            construction_error: Some(reason.to_string()),
            ..Default::default()
        },
    )
}

pub fn subject_spoof(subject_id: u16, transfer_id: Option<u64>, iface_id: &[u16]) -> Spoof {
    Spoof {
        timeout: 1.0,
        priority: Priority::Nominal,
        session: Session::Subject {
            subject_id,
            source: Some(1),
        },
        transfer_id,
        iface_id: iface_id.iter().copied().collect::<BTreeSet<_>>(),
        payload: vec![0xCA, 0xFE],
    }
}
