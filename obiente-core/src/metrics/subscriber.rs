/*!
 * Live sample fan-out.
 *
 * Subscribers receive samples through bounded channels. A full buffer drops
 * the sample for that subscriber only; the sampler never blocks on a slow
 * consumer. The backpressure monitor flags subscribers whose last
 * successful send is aging and removes the ones that are clearly dead.
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::RawSample;

struct SubscriberEntry {
    sender: mpsc::Sender<RawSample>,
    last_ok: Instant,
    overflow: u64,
    slow: bool,
}

pub struct SubscriberHub {
    buffer: usize,
    slow_after: Duration,
    next_id: AtomicU64,
    dropped_total: AtomicU64,
    inner: RwLock<HashMap<u64, SubscriberEntry>>,
}

impl SubscriberHub {
    pub fn new(buffer: usize, slow_after: Duration) -> Self {
        Self {
            buffer,
            slow_after,
            next_id: AtomicU64::new(1),
            dropped_total: AtomicU64::new(0),
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> (u64, mpsc::Receiver<RawSample>) {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.insert(
            id,
            SubscriberEntry {
                sender,
                last_ok: Instant::now(),
                overflow: 0,
                slow: false,
            },
        );
        (id, receiver)
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.remove(&id);
    }

    /// Deliver one sample to every subscriber. Non-blocking: a full buffer
    /// drops the sample for that subscriber and accounts the overflow.
    pub fn publish(&self, sample: &RawSample) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut closed = Vec::new();
        for (id, entry) in inner.iter_mut() {
            match entry.sender.try_send(sample.clone()) {
                Ok(()) => entry.last_ok = Instant::now(),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    entry.overflow += 1;
                    self.dropped_total.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in closed {
            debug!("Removing subscriber {}: receiver dropped", id);
            inner.remove(&id);
        }
    }

    /// Backpressure pass: flag slow subscribers, remove dead ones. A
    /// subscriber is dead once its last successful send is older than three
    /// slow-windows while its buffer is still full.
    pub fn monitor(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut dead = Vec::new();
        for (id, entry) in inner.iter_mut() {
            let age = entry.last_ok.elapsed();
            if age >= self.slow_after && !entry.slow {
                entry.slow = true;
                warn!(
                    "Subscriber {} is slow: no successful send for {:?} ({} dropped)",
                    id, age, entry.overflow
                );
            } else if age < self.slow_after {
                entry.slow = false;
            }
            let buffer_full = entry.sender.capacity() == 0;
            if age >= self.slow_after * 3 && buffer_full {
                dead.push(*id);
            }
        }
        for id in dead {
            warn!("Removing dead subscriber {}", id);
            // Dropping the entry drops the sender, closing the stream.
            inner.remove(&id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceType;
    use chrono::Utc;

    fn sample() -> RawSample {
        RawSample {
            resource_type: ResourceType::Deployment,
            resource_id: "r1".to_string(),
            container_id: "c1".to_string(),
            node_id: "n1".to_string(),
            cpu_usage: 1.0,
            memory_usage: 0,
            network_rx_bytes: 0,
            network_tx_bytes: 0,
            disk_read_bytes: 0,
            disk_write_bytes: 0,
            request_count: 0,
            error_count: 0,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn full_buffer_drops_for_that_subscriber_only() {
        let hub = SubscriberHub::new(2, Duration::from_secs(5));
        let (_slow_id, _slow_rx) = hub.subscribe();
        let (_fast_id, mut fast_rx) = hub.subscribe();

        for _ in 0..4 {
            hub.publish(&sample());
        }
        // The slow receiver never drained: two samples dropped for it.
        assert_eq!(hub.dropped_total(), 2);
        // The fast receiver still holds its buffered two.
        assert!(fast_rx.try_recv().is_ok());
        assert!(fast_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_publish() {
        let hub = SubscriberHub::new(2, Duration::from_secs(5));
        let (_id, rx) = hub.subscribe();
        drop(rx);
        hub.publish(&sample());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dead_subscriber_is_removed_by_monitor() {
        let hub = SubscriberHub::new(1, Duration::from_millis(10));
        let (_id, _rx) = hub.subscribe();
        hub.publish(&sample());
        hub.publish(&sample()); // buffer now full, this one dropped
        tokio::time::sleep(Duration::from_millis(40)).await;
        hub.monitor();
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_closes_the_stream() {
        let hub = SubscriberHub::new(2, Duration::from_secs(5));
        let (id, mut rx) = hub.subscribe();
        hub.unsubscribe(id);
        assert!(rx.recv().await.is_none());
    }
}
