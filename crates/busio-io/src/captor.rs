//! Capture forwarding
//!
//! Adapters report frames from arbitrary threads. The captor stamps each one
//! with the interface id and a per-interface sequence number, then hands it
//! to a forwarder task on the runtime, which publishes it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use busio_core::{Capture, Publisher};
use busio_iface::{Iface, IfaceCapture};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct Captor {
    tx: mpsc::UnboundedSender<Capture>,
    publish_timeouts: Arc<AtomicU64>,
    forwarder: JoinHandle<()>,
}

impl Captor {
    /// Start the forwarder. Must be called within a tokio runtime.
    pub fn new(publisher: Box<dyn Publisher<Capture>>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Capture>();
        let publish_timeouts = Arc::new(AtomicU64::new(0));
        let timeouts = publish_timeouts.clone();

        let forwarder = tokio::spawn(async move {
            while let Some(capture) = rx.recv().await {
                let iface_id = capture.iface_id;
                let sequence_number = capture.sequence_number;
                if !publisher.publish(capture).await {
                    let total = timeouts.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(iface_id, sequence_number, total, "Capture publication timed out");
                }
            }
            tracing::debug!("Capture forwarder stopped");
        });

        Self {
            tx,
            publish_timeouts,
            forwarder,
        }
    }

    /// Begin capturing on a freshly constructed interface; numbering starts at 0
    pub fn attach(&self, iface_id: u16, iface: &dyn Iface) {
        let tx = self.tx.clone();
        let next_seq = Mutex::new(0u64);
        iface.begin_capture(Arc::new(move |cap: IfaceCapture| {
            // Numbering and enqueueing happen together so order matches sequence
            let mut seq = next_seq.lock();
            let capture = Capture {
                timestamp: cap.timestamp.to_wire(),
                iface_id,
                sequence_number: *seq,
                frame: cap.frame,
            };
            *seq += 1;
            if tx.send(capture).is_err() {
                tracing::trace!(iface_id, "Capture dropped, forwarder gone");
            }
        }));
        tracing::debug!(iface_id, "Capture attached");
    }

    /// Captures the node failed to publish in time
    pub fn publish_timeouts(&self) -> u64 {
        self.publish_timeouts.load(Ordering::Relaxed)
    }
}

impl Drop for Captor {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use busio_core::{LocalNode, LoopbackConfig, Node, Priority, Session, SessionSpecifier};
    use busio_iface::LoopbackIface;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::Instant;

    fn transfer(subject_id: u16) -> busio_core::AlienTransfer {
        busio_core::AlienTransfer {
            priority: Priority::Nominal,
            transfer_id: 0,
            session: SessionSpecifier::from(&Session::Subject {
                subject_id,
                source: None,
            }),
            payload: Bytes::from_static(b"\x01\x02"),
        }
    }

    #[tokio::test]
    async fn test_sequence_numbers_per_iface() {
        let node = LocalNode::new();
        let mut sub = node.make_subscriber::<Capture>("capture").unwrap();
        let captor = Captor::new(node.make_publisher("capture").unwrap());

        let a = LoopbackIface::new(&LoopbackConfig::default()).unwrap();
        let b = LoopbackIface::new(&LoopbackConfig::default()).unwrap();
        captor.attach(1, &a);
        captor.attach(2, &b);

        let deadline = Instant::now() + Duration::from_secs(1);
        for _ in 0..3 {
            a.spoof(&transfer(10), deadline).await.unwrap();
        }
        b.spoof(&transfer(20), deadline).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..4 {
            let cap = sub.receive_for(Duration::from_secs(1)).await.unwrap();
            seen.push((cap.iface_id, cap.sequence_number));
        }
        seen.sort();
        assert_eq!(seen, vec![(1, 0), (1, 1), (1, 2), (2, 0)]);
        assert_eq!(captor.publish_timeouts(), 0);
    }

    #[tokio::test]
    async fn test_reattach_restarts_numbering() {
        let node = LocalNode::new();
        let mut sub = node.make_subscriber::<Capture>("capture").unwrap();
        let captor = Captor::new(node.make_publisher("capture").unwrap());
        let deadline = Instant::now() + Duration::from_secs(1);

        let first = LoopbackIface::new(&LoopbackConfig::default()).unwrap();
        captor.attach(5, &first);
        first.spoof(&transfer(1), deadline).await.unwrap();
        first.spoof(&transfer(1), deadline).await.unwrap();
        first.close();

        let second = LoopbackIface::new(&LoopbackConfig::default()).unwrap();
        captor.attach(5, &second);
        second.spoof(&transfer(1), deadline).await.unwrap();

        let seqs: Vec<u64> = [
            sub.receive_for(Duration::from_secs(1)).await,
            sub.receive_for(Duration::from_secs(1)).await,
            sub.receive_for(Duration::from_secs(1)).await,
        ]
        .into_iter()
        .map(|c| c.unwrap().sequence_number)
        .collect();
        assert_eq!(seqs, vec![0, 1, 0]);
    }

    #[tokio::test]
    async fn test_publish_timeouts_counted() {
        let node = LocalNode::new();
        let captor = Captor::new(node.make_publisher("capture").unwrap());
        let iface = LoopbackIface::new(&LoopbackConfig::default()).unwrap();
        captor.attach(3, &iface);

        node.close();
        iface
            .spoof(&transfer(1), Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while captor.publish_timeouts() == 0 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(captor.publish_timeouts(), 1);
    }
}
