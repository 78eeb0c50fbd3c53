//! Per-interface spoof queue and delivery task

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use busio_core::AlienTransfer;
use busio_iface::Iface;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Spoof delivery counters for one interface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpoofStatus {
    pub num_bytes: u64,
    pub num_transfers: u64,
    pub num_timeouts: u64,
    pub num_errors: u64,
    /// Items waiting in the queue
    pub backlog: u64,
    /// Largest backlog ever observed; never decreases
    pub backlog_peak: u64,
}

impl SpoofStatus {
    fn update_backlog(&mut self, pending: usize) {
        self.backlog = pending as u64;
        self.backlog_peak = self.backlog_peak.max(self.backlog);
    }
}

type Job = (AlienTransfer, Instant);

/// Owns the queue, the delivery task and the counters of one interface
pub(crate) struct Inferior {
    iface_id: u16,
    queue: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
    status: Arc<Mutex<SpoofStatus>>,
    task: JoinHandle<()>,
}

impl Inferior {
    pub(crate) fn new(iface_id: u16, iface: Arc<dyn Iface>) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let status = Arc::new(Mutex::new(SpoofStatus::default()));
        let task = tokio::spawn(deliver(iface_id, iface, rx, pending.clone(), status.clone()));
        Self {
            iface_id,
            queue,
            pending,
            status,
            task,
        }
    }

    /// Queue a transfer; never blocks
    pub(crate) fn push(&self, transfer: AlienTransfer, deadline: Instant) {
        self.status
            .lock()
            .update_backlog(self.pending.load(Ordering::SeqCst));
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.queue.send((transfer, deadline)).is_err() {
            // Delivery stopped; the item stays counted as undeliverable backlog
            tracing::debug!(iface_id = self.iface_id, "Spoof queued to stopped interface");
        }
    }

    pub(crate) fn status(&self) -> SpoofStatus {
        *self.status.lock()
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub(crate) fn close(&self) {
        self.task.abort();
    }
}

impl Drop for Inferior {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn deliver(
    iface_id: u16,
    iface: Arc<dyn Iface>,
    mut rx: mpsc::UnboundedReceiver<Job>,
    pending: Arc<AtomicUsize>,
    status: Arc<Mutex<SpoofStatus>>,
) {
    loop {
        status.lock().update_backlog(pending.load(Ordering::SeqCst));
        let Some((transfer, deadline)) = rx.recv().await else {
            break;
        };
        pending.fetch_sub(1, Ordering::SeqCst);

        let result = iface.spoof(&transfer, deadline).await;
        let mut st = status.lock();
        match result {
            Ok(true) => {
                st.num_bytes += transfer.payload.len() as u64;
                st.num_transfers += 1;
            }
            Ok(false) => {
                st.num_timeouts += 1;
                tracing::debug!(iface_id, transfer_id = transfer.transfer_id, "Spoof timed out");
            }
            Err(e) if e.is_resource_closed() => {
                st.num_errors += 1;
                tracing::info!(iface_id, "Interface closed, stopping spoof delivery");
                break;
            }
            Err(e) => {
                st.num_errors += 1;
                tracing::error!(
                    iface_id,
                    session = %transfer.session,
                    transfer_id = transfer.transfer_id,
                    error = %e,
                    "Spoof failed"
                );
            }
        }
    }
}
