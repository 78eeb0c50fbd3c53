//! Bounded pool for blocking jobs
//!
//! Jobs run on tokio's blocking threads; a semaphore caps how many run at
//! once. Cancellation is cooperative: a job receives its [`CancelFlag`] and
//! is expected to check it at convenient points.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};

use crate::error::JobError;

/// Cooperative cancellation flag shared between the submitter and a job
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
    tracker: Arc<Tracker>,
}

#[derive(Debug, Default)]
struct Tracker {
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Counts a job from submission until it finishes or is dropped unstarted
struct InFlight(Arc<Tracker>);

impl InFlight {
    fn enter(tracker: &Arc<Tracker>) -> Self {
        tracker.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(tracker.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl BlockingPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
            tracker: Arc::new(Tracker::default()),
        }
    }

    /// Jobs submitted and not yet finished
    pub fn in_flight(&self) -> usize {
        self.tracker.in_flight.load(Ordering::SeqCst)
    }

    /// Submit a blocking job.
    ///
    /// The job starts once the returned future is polled and a slot is free.
    /// A job cancelled before it starts never runs. Once started, dropping
    /// the future does not stop it.
    pub fn submit<F, T>(
        &self,
        cancel: CancelFlag,
        job: F,
    ) -> impl Future<Output = Result<T, JobError>> + Send + 'static
    where
        F: FnOnce(&CancelFlag) -> T + Send + 'static,
        T: Send + 'static,
    {
        let permits = self.permits.clone();
        let guard = InFlight::enter(&self.tracker);
        async move {
            let permit = permits
                .acquire_owned()
                .await
                .map_err(|_| JobError::PoolClosed)?;
            if cancel.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let _guard = guard;
                job(&cancel)
            });
            handle.await.map_err(|e| {
                if e.is_panic() {
                    JobError::Panicked(e.to_string())
                } else {
                    JobError::Cancelled
                }
            })
        }
    }

    /// Run a job in the background, logging failures
    pub fn spawn<F>(&self, what: &'static str, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let fut = self.submit(CancelFlag::new(), move |_| job());
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                tracing::warn!(job = what, error = %e, "Background job failed");
            }
        });
    }

    /// Wait until no job is in flight; `false` if `grace` expired first
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.tracker.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }
}
