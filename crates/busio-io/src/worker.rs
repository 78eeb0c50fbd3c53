//! Interface reconciliation loop
//!
//! The worker keeps the live interface set in sync with the latest
//! configuration. Construction and close run on the blocking pool; their
//! completions come back into the loop. Status reports go out after every
//! configuration message and at least once per update period.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use busio_core::{
    Capture, IfaceState, IfaceStatus, IoConfig, IoStatus, Node, OperationalInfo, Publisher,
    ShutdownSignal, Spoof, Subscriber, TransportConfig,
};
use busio_iface::{Iface, IfaceError};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::Instant;

use crate::captor::Captor;
use crate::config::WorkerConfig;
use crate::error::{JobError, WorkerError};
use crate::pool::{BlockingPool, CancelFlag};
use crate::spoofer::{SpoofStatus, Spoofer};

/// Builds an interface from its transport configuration (blocking)
pub type Constructor =
    Arc<dyn Fn(&TransportConfig) -> Result<Arc<dyn Iface>, IfaceError> + Send + Sync>;

/// Lifecycle of one configured interface
enum Lifecycle {
    /// Construction job in flight; `epoch` identifies it
    Initializing { cancel: CancelFlag, epoch: u64 },
    Operational(Arc<dyn Iface>),
    Failed(String),
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Initializing { epoch, .. } => write!(f, "Initializing(#{})", epoch),
            Lifecycle::Operational(iface) => write!(f, "Operational({:?})", iface),
            Lifecycle::Failed(reason) => write!(f, "Failed({:?})", reason),
        }
    }
}

/// What a construction job produced
enum Built {
    Ready(Arc<dyn Iface>),
    /// Built after its cancellation; already closed by the job
    Discarded,
    Failed(IfaceError),
}

struct Completion {
    iface_id: u16,
    epoch: u64,
    outcome: Result<Built, JobError>,
}

pub struct Worker {
    config: WorkerConfig,
    constructor: Constructor,
    pool: BlockingPool,
    ifaces: BTreeMap<u16, Lifecycle>,
    next_epoch: u64,
    constructions: FuturesUnordered<BoxFuture<'static, Completion>>,
    captor: Captor,
    spoofer: Spoofer,
    status_pub: Box<dyn Publisher<IoStatus>>,
    config_sub: Box<dyn Subscriber<IoConfig>>,
    spoof_sub: Box<dyn Subscriber<Spoof>>,
    shutdown: ShutdownSignal,
    publish_timeouts: u64,
}

impl Worker {
    /// Bind the worker's ports on `node`. Must be called within a tokio runtime.
    pub fn new<N: Node>(node: &N, config: WorkerConfig) -> Result<Self, WorkerError> {
        let ports = &config.ports;
        let capture_pub = node.make_publisher::<Capture>(&ports.capture)?;
        let status_pub = node.make_publisher::<IoStatus>(&ports.status)?;
        let config_sub = node.make_subscriber::<IoConfig>(&ports.config)?;
        let spoof_sub = node.make_subscriber::<Spoof>(&ports.spoof)?;

        Ok(Self {
            pool: BlockingPool::new(config.pool_size),
            constructor: Arc::new(busio_iface::construct),
            ifaces: BTreeMap::new(),
            next_epoch: 0,
            constructions: FuturesUnordered::new(),
            captor: Captor::new(capture_pub),
            spoofer: Spoofer::new(),
            status_pub,
            config_sub,
            spoof_sub,
            shutdown: node.shutdown_signal(),
            publish_timeouts: 0,
            config,
        })
    }

    /// Replace the interface constructor
    pub fn with_constructor(mut self, constructor: Constructor) -> Self {
        self.constructor = constructor;
        self
    }

    /// Status reports the node failed to publish in time
    pub fn publish_timeouts(&self) -> u64 {
        self.publish_timeouts
    }

    /// Capture records the node failed to publish in time
    pub fn capture_publish_timeouts(&self) -> u64 {
        self.captor.publish_timeouts()
    }

    /// Run until the node shuts down, then close every interface
    pub async fn run(&mut self) {
        let period = self.config.max_update_period();
        tracing::info!(
            period_ms = period.as_millis() as u64,
            pool_size = self.config.pool_size,
            "I/O worker started"
        );
        let mut next_report = Instant::now() + period;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => break,
                Some(done) = self.constructions.next(), if !self.constructions.is_empty() => {
                    self.on_constructed(done);
                }
                msg = self.config_sub.receive() => match msg {
                    Some(cfg) => {
                        self.reconfigure(cfg);
                        self.publish_status().await;
                        next_report = Instant::now() + period;
                    }
                    None => {
                        tracing::warn!("Configuration port closed");
                        break;
                    }
                },
                // Periodic report takes precedence over spoof intake
                _ = tokio::time::sleep_until(next_report) => {
                    self.publish_status().await;
                    next_report = Instant::now() + period;
                }
                msg = self.spoof_sub.receive() => match msg {
                    Some(spoof) => {
                        self.spoofer.handle(spoof);
                    }
                    None => {
                        tracing::warn!("Spoof port closed");
                        break;
                    }
                },
            }
        }

        self.shutdown_all().await;
    }

    /// Apply a configuration message: drop removed ids, start new ones.
    ///
    /// Ids already tracked are left as they are.
    pub fn reconfigure(&mut self, cfg: IoConfig) {
        let mut desired: BTreeMap<u16, TransportConfig> = BTreeMap::new();
        for ic in cfg.iface_config {
            match desired.entry(ic.iface_id) {
                Entry::Vacant(slot) => {
                    slot.insert(ic.transport);
                }
                Entry::Occupied(_) => {
                    tracing::warn!(iface_id = ic.iface_id, "Duplicate interface ID ignored");
                }
            }
        }

        let removed: Vec<u16> = self
            .ifaces
            .keys()
            .filter(|id| !desired.contains_key(id))
            .copied()
            .collect();
        for iface_id in removed {
            self.remove(iface_id);
        }

        for (iface_id, transport) in desired {
            if !self.ifaces.contains_key(&iface_id) {
                self.start_construction(iface_id, transport);
            }
        }
    }

    fn start_construction(&mut self, iface_id: u16, transport: TransportConfig) {
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let cancel = CancelFlag::new();
        tracing::info!(iface_id, transport = transport.name(), "Constructing interface");

        let constructor = self.constructor.clone();
        let job = self.pool.submit(cancel.clone(), move |cancel| {
            match constructor(&transport) {
                Ok(iface) if cancel.is_cancelled() => {
                    iface.close();
                    Built::Discarded
                }
                Ok(iface) => Built::Ready(iface),
                Err(e) => Built::Failed(e),
            }
        });
        self.constructions.push(Box::pin(async move {
            Completion {
                iface_id,
                epoch,
                outcome: job.await,
            }
        }));
        self.ifaces
            .insert(iface_id, Lifecycle::Initializing { cancel, epoch });
    }

    fn on_constructed(&mut self, done: Completion) {
        let Completion {
            iface_id,
            epoch,
            outcome,
        } = done;

        let current = matches!(
            self.ifaces.get(&iface_id),
            Some(Lifecycle::Initializing { epoch: e, .. }) if *e == epoch
        );
        if !current {
            tracing::debug!(iface_id, epoch, "Discarding stale construction result");
            if let Ok(Built::Ready(iface)) = outcome {
                self.close_in_background(iface_id, iface);
            }
            return;
        }

        let state = match outcome {
            Ok(Built::Ready(iface)) => {
                tracing::info!(iface_id, transport = iface.transport_name(), "Interface operational");
                self.captor.attach(iface_id, iface.as_ref());
                self.spoofer.attach(iface_id, iface.clone());
                Lifecycle::Operational(iface)
            }
            Ok(Built::Failed(e)) => {
                tracing::error!(iface_id, error = %e, "Interface construction failed");
                Lifecycle::Failed(format!("Init failed: {}", e))
            }
            Ok(Built::Discarded) => Lifecycle::Failed("Init failed: construction cancelled".to_string()),
            Err(e) => {
                tracing::error!(iface_id, error = %e, "Interface construction job failed");
                Lifecycle::Failed(format!("Init failed: {}", e))
            }
        };
        self.ifaces.insert(iface_id, state);
    }

    fn remove(&mut self, iface_id: u16) {
        match self.ifaces.remove(&iface_id) {
            Some(Lifecycle::Initializing { cancel, .. }) => {
                tracing::info!(iface_id, "Cancelling interface construction");
                cancel.cancel();
            }
            Some(Lifecycle::Operational(iface)) => {
                tracing::info!(iface_id, "Removing interface");
                self.spoofer.detach(iface_id);
                self.close_in_background(iface_id, iface);
            }
            Some(Lifecycle::Failed(_)) => {
                tracing::debug!(iface_id, "Dropping failed interface");
            }
            None => {}
        }
    }

    fn close_in_background(&self, iface_id: u16, iface: Arc<dyn Iface>) {
        self.pool.spawn("close interface", move || {
            iface.close();
            tracing::debug!(iface_id, "Interface closed");
        });
    }

    /// Current status of every tracked interface, ascending by id
    pub fn report(&self) -> IoStatus {
        debug_assert!(
            self.spoofer
                .iface_ids()
                .all(|id| matches!(self.ifaces.get(&id), Some(Lifecycle::Operational(_)))),
            "spoofer tracks an interface the worker does not consider operational"
        );

        let iface_status = self
            .ifaces
            .iter()
            .map(|(&iface_id, lifecycle)| IfaceStatus {
                iface_id,
                state: match lifecycle {
                    Lifecycle::Initializing { .. } => IfaceState::Initializing,
                    Lifecycle::Operational(iface) => {
                        let media = iface.sample_statistics();
                        let spoof: SpoofStatus = self.spoofer.status(iface_id).unwrap_or_default();
                        IfaceState::Operational(OperationalInfo {
                            media_frames: media.n_frames,
                            media_bytes: media.n_media_layer_bytes,
                            media_utilization_pct: media.media_utilization_pct,
                            errors: media.n_errors,
                            spoof_bytes: spoof.num_bytes,
                            spoof_transfers: spoof.num_transfers,
                            spoof_timeouts: spoof.num_timeouts,
                            spoof_failures: spoof.num_errors,
                            spoof_backlog_current: spoof.backlog,
                            spoof_backlog_peak: spoof.backlog_peak,
                        })
                    }
                    Lifecycle::Failed(reason) => IfaceState::failure(reason.as_str()),
                },
            })
            .collect();
        IoStatus { iface_status }
    }

    async fn publish_status(&mut self) {
        let status = self.report();
        if !self.status_pub.publish(status).await {
            self.publish_timeouts += 1;
            tracing::error!(total = self.publish_timeouts, "Status publication timed out");
        }
    }

    async fn shutdown_all(&mut self) {
        tracing::info!(interfaces = self.ifaces.len(), "I/O worker stopping");
        self.spoofer.close();
        for (iface_id, lifecycle) in std::mem::take(&mut self.ifaces) {
            match lifecycle {
                Lifecycle::Initializing { cancel, .. } => cancel.cancel(),
                Lifecycle::Operational(iface) => self.close_in_background(iface_id, iface),
                Lifecycle::Failed(_) => {}
            }
        }

        // Constructions finishing inside the grace period are closed too
        let deadline = Instant::now() + self.config.shutdown_grace();
        while !self.constructions.is_empty() {
            match tokio::time::timeout_at(deadline, self.constructions.next()).await {
                Ok(Some(done)) => {
                    if let Ok(Built::Ready(iface)) = done.outcome {
                        self.close_in_background(done.iface_id, iface);
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if !self.pool.wait_idle(remaining).await {
            tracing::warn!(in_flight = self.pool.in_flight(), "Background jobs still running at shutdown");
        }
        tracing::info!("I/O worker stopped");
    }
}

/// Closes whatever is still tracked when the worker goes away without
/// finishing [`Worker::run`], e.g. because its task was aborted.
impl Drop for Worker {
    fn drop(&mut self) {
        if self.ifaces.is_empty() {
            return;
        }
        tracing::warn!(interfaces = self.ifaces.len(), "I/O worker dropped while running, closing interfaces");
        self.spoofer.close();
        for (iface_id, lifecycle) in std::mem::take(&mut self.ifaces) {
            match lifecycle {
                // The construction job closes its own result once cancelled
                Lifecycle::Initializing { cancel, .. } => cancel.cancel(),
                Lifecycle::Operational(iface) => match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn_blocking(move || {
                            iface.close();
                            tracing::debug!(iface_id, "Interface closed");
                        });
                    }
                    Err(_) => iface.close(),
                },
                Lifecycle::Failed(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use busio_core::{IfaceConfig, LocalNode, LoopbackConfig, Priority, Session};
    use busio_iface::LoopbackIface;
    use parking_lot::Mutex;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn loopback(iface_id: u16) -> IfaceConfig {
        IfaceConfig {
            iface_id,
            transport: TransportConfig::Loopback(LoopbackConfig::default()),
        }
    }

    fn failing(iface_id: u16) -> IfaceConfig {
        IfaceConfig {
            iface_id,
            transport: TransportConfig::Loopback(LoopbackConfig {
                construction_error: Some("no medium".to_string()),
                ..Default::default()
            }),
        }
    }

    fn worker(node: &LocalNode) -> Worker {
        Worker::new(node, WorkerConfig::default()).unwrap()
    }

    async fn drain_constructions(worker: &mut Worker) {
        while let Some(done) = worker.constructions.next().await {
            worker.on_constructed(done);
        }
    }

    #[tokio::test]
    async fn test_construction_outcomes_reported() {
        let node = LocalNode::new();
        let mut worker = worker(&node);
        worker.reconfigure(IoConfig::new(vec![loopback(5), failing(7)]));

        let status = worker.report();
        assert_eq!(status.get(5), Some(&IfaceState::Initializing));
        assert_eq!(status.get(7), Some(&IfaceState::Initializing));

        drain_constructions(&mut worker).await;
        let status = worker.report();
        assert_eq!(
            status.get(5),
            Some(&IfaceState::Operational(OperationalInfo::default()))
        );
        match status.get(7) {
            Some(IfaceState::Failure(reason)) => assert!(reason.contains("no medium")),
            other => panic!("Expected failure, got {:?}", other),
        }
        assert_eq!(worker.spoofer.iface_ids().collect::<Vec<_>>(), vec![5]);
    }

    #[tokio::test]
    async fn test_duplicate_ids_first_wins() {
        let node = LocalNode::new();
        let mut worker = worker(&node);
        worker.reconfigure(IoConfig::new(vec![loopback(1), failing(1)]));
        drain_constructions(&mut worker).await;
        assert!(worker.report().get(1).map(IfaceState::is_operational).unwrap_or(false));
        assert_eq!(worker.report().iface_status.len(), 1);
    }

    #[tokio::test]
    async fn test_existing_ids_kept_across_reconfiguration() {
        let node = LocalNode::new();
        let mut worker = worker(&node);
        worker.reconfigure(IoConfig::new(vec![loopback(1)]));
        drain_constructions(&mut worker).await;

        // Same id with different transport settings is not rebuilt
        worker.reconfigure(IoConfig::new(vec![failing(1), loopback(2)]));
        assert!(worker.report().get(1).map(IfaceState::is_operational).unwrap_or(false));
        assert_eq!(worker.report().get(2), Some(&IfaceState::Initializing));
    }

    #[tokio::test]
    async fn test_stale_result_closed_once() {
        let node = LocalNode::new();
        let built: Arc<Mutex<Vec<Arc<LoopbackIface>>>> = Arc::default();
        let sink = built.clone();
        let mut worker = worker(&node).with_constructor(Arc::new(move |cfg: &TransportConfig| {
            let TransportConfig::Loopback(cfg) = cfg else {
                return Err(IfaceError::Unsupported("test".to_string()));
            };
            let iface = Arc::new(LoopbackIface::new(cfg)?);
            sink.lock().push(iface.clone());
            Ok(iface as Arc<dyn Iface>)
        }));

        // Remove and re-add before the first construction resolves
        worker.reconfigure(IoConfig::new(vec![loopback(3)]));
        worker.reconfigure(IoConfig::new(vec![]));
        worker.reconfigure(IoConfig::new(vec![loopback(3)]));
        drain_constructions(&mut worker).await;
        assert!(worker.pool.wait_idle(Duration::from_secs(2)).await);

        assert!(worker.report().get(3).map(IfaceState::is_operational).unwrap_or(false));
        let built = built.lock();
        let closes: usize = built.iter().map(|i| i.close_count()).sum();
        // Either the first job never ran, or its adapter was closed exactly once
        assert_eq!(closes, built.len() - 1);
        assert_eq!(built.last().map(|i| i.close_count()), Some(0));
    }

    #[tokio::test]
    async fn test_spoof_never_reaches_failed_iface() {
        let node = LocalNode::new();
        let mut worker = worker(&node);
        worker.reconfigure(IoConfig::new(vec![failing(7)]));
        drain_constructions(&mut worker).await;

        let targets = worker.spoofer.handle(Spoof {
            timeout: 1.0,
            priority: Priority::Nominal,
            session: Session::Subject {
                subject_id: 1,
                source: None,
            },
            transfer_id: None,
            iface_id: BTreeSet::from([7]),
            payload: vec![],
        });
        assert_eq!(targets, 0);
        assert_eq!(worker.spoofer.status(7), None);
    }
}
