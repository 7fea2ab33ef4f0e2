/*!
 * Batched persistence of raw samples.
 *
 * Every store interval, the live ring's newest window is aggregated per
 * `(resource, container)` pair, clamped, and inserted in bounded batches.
 * A failed batch lands in the retry queue (oldest-wins eviction at
 * capacity) and is retried on a slower cadence until `max_retries` is
 * exhausted, after which it is dropped with a warning.
 */

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::MetricsConfig;
use crate::store::Store;
use crate::types::RawSample;

/// CPU readings above this are treated as corrupt and clamped.
const MAX_SANE_CPU_PERCENT: f64 = 10_000.0;

struct RetryBatch {
    samples: Vec<RawSample>,
    attempts: u32,
    last_failure: Instant,
}

struct RetryQueue {
    max: usize,
    inner: Mutex<VecDeque<RetryBatch>>,
}

impl RetryQueue {
    fn new(max: usize) -> Self {
        Self {
            max,
            inner: Mutex::new(VecDeque::new()),
        }
    }

    /// Enqueue a failed batch; at capacity the oldest batch is evicted.
    fn push(&self, batch: RetryBatch) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.len() >= self.max {
            if let Some(evicted) = inner.pop_front() {
                warn!(
                    "Retry queue full; evicting oldest batch of {} sample(s)",
                    evicted.samples.len()
                );
            }
        }
        inner.push_back(batch);
    }

    /// Pull every batch whose retry interval has elapsed.
    fn take_due(&self, retry_interval: Duration) -> Vec<RetryBatch> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut due = Vec::new();
        let mut keep = VecDeque::new();
        while let Some(batch) = inner.pop_front() {
            if batch.last_failure.elapsed() >= retry_interval {
                due.push(batch);
            } else {
                keep.push_back(batch);
            }
        }
        *inner = keep;
        due
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

pub struct MetricsStorage {
    store: Arc<Store>,
    config: MetricsConfig,
    queue: RetryQueue,
}

impl MetricsStorage {
    pub fn new(store: Arc<Store>, config: MetricsConfig) -> Self {
        let queue = RetryQueue::new(config.max_queue_size);
        Self {
            store,
            config,
            queue,
        }
    }

    /// Aggregate one window of live samples and persist them in batches.
    pub async fn flush(&self, window: Vec<RawSample>) {
        if window.is_empty() {
            return;
        }
        let aggregated = aggregate_window(window);
        for chunk in aggregated.chunks(self.config.batch_size) {
            match self.store.insert_samples(chunk).await {
                Ok(()) => debug!("Persisted batch of {} sample(s)", chunk.len()),
                Err(e) => {
                    warn!(
                        "Batch insert of {} sample(s) failed, queueing for retry: {}",
                        chunk.len(),
                        e
                    );
                    self.queue.push(RetryBatch {
                        samples: chunk.to_vec(),
                        attempts: 0,
                        last_failure: Instant::now(),
                    });
                }
            }
        }
    }

    /// Drain due retry batches. Exhausted batches are dropped irrevocably.
    pub async fn process_retries(&self) {
        let retry_interval = Duration::from_secs(self.config.retry_interval_secs);
        for mut batch in self.queue.take_due(retry_interval) {
            match self.store.insert_samples(&batch.samples).await {
                Ok(()) => {
                    debug!(
                        "Retried batch of {} sample(s) persisted after {} attempt(s)",
                        batch.samples.len(),
                        batch.attempts + 1
                    );
                }
                Err(e) => {
                    batch.attempts += 1;
                    batch.last_failure = Instant::now();
                    if batch.attempts >= self.config.max_retries {
                        warn!(
                            "Dropping batch of {} sample(s) after {} failed attempts: {}",
                            batch.samples.len(),
                            batch.attempts,
                            e
                        );
                    } else {
                        self.queue.push(batch);
                    }
                }
            }
        }
    }

    pub fn queued_batches(&self) -> usize {
        self.queue.len()
    }
}

/// Collapse a window to one sample per `(resource, container)`: cpu and
/// memory average, counters sum, and the newest timestamp wins. Invalid cpu
/// readings are clamped.
pub fn aggregate_window(window: Vec<RawSample>) -> Vec<RawSample> {
    let mut groups: HashMap<(String, String), Vec<RawSample>> = HashMap::new();
    for sample in window {
        groups
            .entry((sample.resource_id.clone(), sample.container_id.clone()))
            .or_default()
            .push(sample);
    }

    let mut out = Vec::with_capacity(groups.len());
    for (_, mut samples) in groups {
        samples.sort_by_key(|s| s.timestamp);
        let count = samples.len() as f64;
        let mut merged = match samples.last() {
            Some(last) => last.clone(),
            None => continue,
        };
        merged.cpu_usage = samples.iter().map(|s| s.cpu_usage).sum::<f64>() / count;
        merged.memory_usage =
            (samples.iter().map(|s| s.memory_usage as f64).sum::<f64>() / count) as i64;
        merged.network_rx_bytes = samples.iter().map(|s| s.network_rx_bytes).sum();
        merged.network_tx_bytes = samples.iter().map(|s| s.network_tx_bytes).sum();
        merged.disk_read_bytes = samples.iter().map(|s| s.disk_read_bytes).sum();
        merged.disk_write_bytes = samples.iter().map(|s| s.disk_write_bytes).sum();
        merged.request_count = samples.iter().map(|s| s.request_count).sum();
        merged.error_count = samples.iter().map(|s| s.error_count).sum();

        if merged.cpu_usage < 0.0 {
            merged.cpu_usage = 0.0;
        } else if merged.cpu_usage > MAX_SANE_CPU_PERCENT {
            warn!(
                "Clamping corrupt cpu reading {:.1}% for {}",
                merged.cpu_usage, merged.container_id
            );
            merged.cpu_usage = MAX_SANE_CPU_PERCENT;
        }
        out.push(merged);
    }
    out.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceType;
    use chrono::{Duration as ChronoDuration, Utc};

    fn sample(resource: &str, container: &str, cpu: f64, rx: i64, offset: i64) -> RawSample {
        RawSample {
            resource_type: ResourceType::Deployment,
            resource_id: resource.to_string(),
            container_id: container.to_string(),
            node_id: "n1".to_string(),
            cpu_usage: cpu,
            memory_usage: 100,
            network_rx_bytes: rx,
            network_tx_bytes: 0,
            disk_read_bytes: 0,
            disk_write_bytes: 0,
            request_count: 1,
            error_count: 0,
            timestamp: Utc::now() + ChronoDuration::seconds(offset),
        }
    }

    #[test]
    fn window_aggregates_avg_cpu_and_summed_counters() {
        let out = aggregate_window(vec![
            sample("r1", "c1", 10.0, 100, 0),
            sample("r1", "c1", 30.0, 200, 1),
            sample("r2", "c2", 50.0, 5, 0),
        ]);
        assert_eq!(out.len(), 2);
        let r1 = out.iter().find(|s| s.resource_id == "r1").unwrap();
        assert_eq!(r1.cpu_usage, 20.0);
        assert_eq!(r1.network_rx_bytes, 300);
        assert_eq!(r1.request_count, 2);
    }

    #[test]
    fn corrupt_cpu_is_clamped() {
        let out = aggregate_window(vec![sample("r1", "c1", 50_000.0, 0, 0)]);
        assert_eq!(out[0].cpu_usage, 10_000.0);
        let out = aggregate_window(vec![sample("r1", "c1", -5.0, 0, 0)]);
        assert_eq!(out[0].cpu_usage, 0.0);
    }

    #[test]
    fn retry_queue_evicts_oldest_at_capacity() {
        let queue = RetryQueue::new(2);
        for i in 0..3 {
            queue.push(RetryBatch {
                samples: vec![sample("r", &format!("c{}", i), 1.0, 0, 0)],
                attempts: 0,
                last_failure: Instant::now(),
            });
        }
        assert_eq!(queue.len(), 2);
        let due = queue.take_due(Duration::ZERO);
        // c0 was evicted; c1 and c2 remain, oldest first.
        assert_eq!(due[0].samples[0].container_id, "c1");
        assert_eq!(due[1].samples[0].container_id, "c2");
    }

    #[test]
    fn take_due_respects_retry_interval() {
        let queue = RetryQueue::new(10);
        queue.push(RetryBatch {
            samples: vec![sample("r", "c", 1.0, 0, 0)],
            attempts: 0,
            last_failure: Instant::now(),
        });
        assert!(queue.take_due(Duration::from_secs(60)).is_empty());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.take_due(Duration::ZERO).len(), 1);
        assert_eq!(queue.len(), 0);
    }
}
