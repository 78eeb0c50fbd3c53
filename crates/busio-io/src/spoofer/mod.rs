//! Spoof fan-out
//!
//! Each spoof request is resolved into a transfer once (session specifier,
//! transfer-ID) and queued to every targeted interface. Every interface has
//! its own queue and delivery task, so a slow or failing interface never
//! holds up the others.

mod inferior;

pub use inferior::SpoofStatus;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use busio_core::{AlienTransfer, SessionSpecifier, Spoof, TransferIdCounter};
use busio_iface::Iface;
use bytes::Bytes;
use tokio::time::Instant;

use inferior::Inferior;

/// Used when a timeout is too large to represent as a deadline
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Default)]
pub struct Spoofer {
    transfer_ids: HashMap<SessionSpecifier, TransferIdCounter>,
    inferiors: BTreeMap<u16, Inferior>,
}

impl Spoofer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start delivering spoofs to an operational interface
    pub fn attach(&mut self, iface_id: u16, iface: Arc<dyn Iface>) {
        debug_assert!(
            !self.inferiors.contains_key(&iface_id),
            "interface {} attached twice",
            iface_id
        );
        tracing::debug!(iface_id, "Spoofer attached");
        self.inferiors.insert(iface_id, Inferior::new(iface_id, iface));
    }

    /// Stop delivery to an interface, dropping its queue and counters.
    ///
    /// The interface itself is not closed.
    pub fn detach(&mut self, iface_id: u16) -> bool {
        match self.inferiors.remove(&iface_id) {
            Some(inferior) => {
                inferior.close();
                tracing::debug!(iface_id, "Spoofer detached");
                true
            }
            None => false,
        }
    }

    /// Queue a spoof to its targets; returns how many interfaces it went to.
    ///
    /// An empty filter targets every attached interface. Ids in the filter
    /// that are not attached are ignored.
    pub fn handle(&mut self, spoof: Spoof) -> usize {
        let session = SessionSpecifier::from(&spoof.session);
        let transfer_id = match spoof.transfer_id {
            Some(explicit) => explicit,
            None => self
                .transfer_ids
                .entry(session)
                .or_default()
                .get_then_increment(),
        };
        let now = Instant::now();
        let deadline = now
            .checked_add(spoof.timeout())
            .unwrap_or_else(|| now + FAR_FUTURE);

        let transfer = AlienTransfer {
            priority: spoof.priority,
            transfer_id,
            session,
            payload: Bytes::from(spoof.payload),
        };

        let targets: Vec<&Inferior> = if spoof.iface_id.is_empty() {
            self.inferiors.values().collect()
        } else {
            spoof
                .iface_id
                .iter()
                .filter_map(|id| self.inferiors.get(id))
                .collect()
        };
        for inferior in &targets {
            inferior.push(transfer.clone(), deadline);
        }

        tracing::debug!(
            session = %session,
            transfer_id,
            targets = targets.len(),
            "Spoof queued"
        );
        targets.len()
    }

    pub fn status(&self, iface_id: u16) -> Option<SpoofStatus> {
        self.inferiors.get(&iface_id).map(Inferior::status)
    }

    /// Ids of attached interfaces, ascending
    pub fn iface_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.inferiors.keys().copied()
    }

    /// Whether the delivery task of an interface is still running
    pub fn is_delivering(&self, iface_id: u16) -> bool {
        self.inferiors
            .get(&iface_id)
            .map(Inferior::is_running)
            .unwrap_or(false)
    }

    /// Next automatic transfer-ID for a session, without consuming it
    pub fn peek_transfer_id(&self, session: &SessionSpecifier) -> u64 {
        self.transfer_ids
            .get(session)
            .map(TransferIdCounter::peek)
            .unwrap_or(0)
    }

    /// Stop every delivery task
    pub fn close(&mut self) {
        for (_, inferior) in std::mem::take(&mut self.inferiors) {
            inferior.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use busio_core::{LoopbackConfig, Priority, Session, SpoofBehavior};
    use busio_iface::LoopbackIface;
    use std::collections::BTreeSet;

    fn spoof(session: Session, transfer_id: Option<u64>, iface_id: &[u16]) -> Spoof {
        Spoof {
            timeout: 1.0,
            priority: Priority::Nominal,
            session,
            transfer_id,
            iface_id: iface_id.iter().copied().collect::<BTreeSet<_>>(),
            payload: b"abc".to_vec(),
        }
    }

    fn subject(subject_id: u16) -> Session {
        Session::Subject {
            subject_id,
            source: None,
        }
    }

    fn loopback() -> Arc<LoopbackIface> {
        Arc::new(LoopbackIface::new(&LoopbackConfig::default()).unwrap())
    }

    async fn settle(spoofer: &Spoofer, iface_id: u16, expect: impl Fn(&SpoofStatus) -> bool) -> SpoofStatus {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let st = spoofer.status(iface_id).unwrap();
            if expect(&st) || std::time::Instant::now() > deadline {
                return st;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_transfer_id_assignment() {
        let mut spoofer = Spoofer::new();
        let s = SessionSpecifier::from(&subject(100));

        spoofer.handle(spoof(subject(100), None, &[]));
        spoofer.handle(spoof(subject(100), None, &[]));
        assert_eq!(spoofer.peek_transfer_id(&s), 2);

        // Explicit id leaves the counter alone
        spoofer.handle(spoof(subject(100), Some(999), &[]));
        assert_eq!(spoofer.peek_transfer_id(&s), 2);

        // Other sessions count independently
        spoofer.handle(spoof(subject(200), None, &[]));
        assert_eq!(spoofer.peek_transfer_id(&SessionSpecifier::from(&subject(200))), 1);
        assert_eq!(spoofer.peek_transfer_id(&s), 2);
    }

    #[tokio::test]
    async fn test_fan_out_and_statistics() {
        let mut spoofer = Spoofer::new();
        let a = loopback();
        let b = loopback();
        let closed = loopback();
        closed.close();
        spoofer.attach(111, a.clone());
        spoofer.attach(222, b.clone());
        spoofer.attach(0, closed.clone());

        assert_eq!(spoofer.handle(spoof(subject(1), None, &[])), 3);
        assert_eq!(spoofer.handle(spoof(subject(1), None, &[111, 999])), 1);
        assert_eq!(spoofer.handle(spoof(subject(1), None, &[999])), 0);

        let st = settle(&spoofer, 111, |s| s.num_transfers == 2).await;
        assert_eq!(st.num_transfers, 2);
        assert_eq!(st.num_bytes, 6);
        assert_eq!(st.backlog, 0);
        assert!(st.backlog_peak >= st.backlog);

        let st = settle(&spoofer, 222, |s| s.num_transfers == 1).await;
        assert_eq!(st.num_transfers, 1);

        // The closed interface fails once and stops delivering
        let st = settle(&spoofer, 0, |s| s.num_errors == 1).await;
        assert_eq!(st.num_errors, 1);
        assert_eq!(st.num_transfers, 0);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while spoofer.is_delivering(0) && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!spoofer.is_delivering(0));

        // Further items pile up as backlog
        spoofer.handle(spoof(subject(1), None, &[0]));
        spoofer.handle(spoof(subject(1), None, &[0]));
        let st = spoofer.status(0).unwrap();
        assert_eq!(st.backlog, 1);
        assert!(st.backlog_peak >= 1);
    }

    #[tokio::test]
    async fn test_timeouts_and_errors_counted() {
        let mut spoofer = Spoofer::new();
        let iface = loopback();
        spoofer.attach(1, iface.clone());

        iface.set_spoof_result(SpoofBehavior::Timeout);
        spoofer.handle(spoof(subject(1), None, &[]));
        let st = settle(&spoofer, 1, |s| s.num_timeouts == 1).await;
        assert_eq!(st.num_timeouts, 1);

        iface.set_spoof_result(SpoofBehavior::Fail);
        spoofer.handle(spoof(subject(1), None, &[]));
        let st = settle(&spoofer, 1, |s| s.num_errors == 1).await;
        assert_eq!(st.num_errors, 1);
        // A plain failure does not stop delivery
        assert!(spoofer.is_delivering(1));

        iface.set_spoof_result(SpoofBehavior::Deliver);
        spoofer.handle(spoof(subject(1), None, &[]));
        let st = settle(&spoofer, 1, |s| s.num_transfers == 1).await;
        assert_eq!(st.num_transfers, 1);
    }

    #[tokio::test]
    async fn test_huge_timeout_waits_for_slow_iface() {
        let mut spoofer = Spoofer::new();
        let iface = Arc::new(
            LoopbackIface::new(&LoopbackConfig {
                latency_ms: 30,
                ..Default::default()
            })
            .unwrap(),
        );
        spoofer.attach(1, iface.clone());

        let mut request = spoof(subject(1), None, &[]);
        request.timeout = 1e20;
        spoofer.handle(request);
        let st = settle(&spoofer, 1, |s| s.num_transfers == 1).await;
        assert_eq!(st.num_transfers, 1);
        assert_eq!(st.num_timeouts, 0);
    }

    #[tokio::test]
    async fn test_detach_drops_status() {
        let mut spoofer = Spoofer::new();
        let iface = loopback();
        spoofer.attach(5, iface.clone());
        assert!(spoofer.detach(5));
        assert!(!spoofer.detach(5));
        assert_eq!(spoofer.status(5), None);
        assert_eq!(spoofer.iface_ids().count(), 0);
        assert_eq!(spoofer.handle(spoof(subject(1), None, &[])), 0);
        assert_eq!(iface.close_count(), 0);
    }
}
