use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use crate::types::RawSample;

/// Per-resource in-memory ring of recent samples, trimmed by age and
/// hard-capped per resource (most recent kept).
pub struct LiveRing {
    retention_secs: i64,
    max_per_resource: usize,
    inner: RwLock<HashMap<String, VecDeque<RawSample>>>,
}

impl LiveRing {
    pub fn new(retention_secs: u64, max_per_resource: usize) -> Self {
        Self {
            retention_secs: retention_secs as i64,
            max_per_resource,
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn push(&self, sample: RawSample) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let ring = inner.entry(sample.resource_id.clone()).or_default();
        ring.push_back(sample);
        while ring.len() > self.max_per_resource {
            ring.pop_front();
        }
    }

    /// Drop entries older than the retention window; empty rings disappear.
    pub fn cleanup(&self, now: DateTime<Utc>) {
        let horizon = now - ChronoDuration::seconds(self.retention_secs);
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.retain(|_, ring| {
            while ring.front().map(|s| s.timestamp < horizon).unwrap_or(false) {
                ring.pop_front();
            }
            !ring.is_empty()
        });
    }

    /// Every sample newer than `since`, across all resources. Used by the
    /// storage batcher to pick up one window's worth of samples.
    pub fn samples_since(&self, since: DateTime<Utc>) -> Vec<RawSample> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .values()
            .flat_map(|ring| ring.iter().filter(|s| s.timestamp > since).cloned())
            .collect()
    }

    /// Live samples for one resource, newest last.
    pub fn live_for(&self, resource_id: &str, since: Option<DateTime<Utc>>) -> Vec<RawSample> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .get(resource_id)
            .map(|ring| {
                ring.iter()
                    .filter(|s| since.map(|t| s.timestamp > t).unwrap_or(true))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn resource_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceType;

    fn sample(resource: &str, ts: DateTime<Utc>, cpu: f64) -> RawSample {
        RawSample {
            resource_type: ResourceType::Deployment,
            resource_id: resource.to_string(),
            container_id: "c1".to_string(),
            node_id: "n1".to_string(),
            cpu_usage: cpu,
            memory_usage: 0,
            network_rx_bytes: 0,
            network_tx_bytes: 0,
            disk_read_bytes: 0,
            disk_write_bytes: 0,
            request_count: 0,
            error_count: 0,
            timestamp: ts,
        }
    }

    #[test]
    fn hard_cap_keeps_most_recent() {
        let ring = LiveRing::new(300, 3);
        let base = Utc::now();
        for i in 0..5 {
            ring.push(sample("r1", base + ChronoDuration::seconds(i), i as f64));
        }
        let live = ring.live_for("r1", None);
        assert_eq!(live.len(), 3);
        assert_eq!(live[0].cpu_usage, 2.0);
        assert_eq!(live[2].cpu_usage, 4.0);
    }

    #[test]
    fn cleanup_trims_by_retention_and_drops_empty_rings() {
        let ring = LiveRing::new(60, 100);
        let now = Utc::now();
        ring.push(sample("old", now - ChronoDuration::seconds(120), 1.0));
        ring.push(sample("fresh", now - ChronoDuration::seconds(10), 2.0));
        ring.cleanup(now);
        assert!(ring.live_for("old", None).is_empty());
        assert_eq!(ring.live_for("fresh", None).len(), 1);
        assert_eq!(ring.resource_count(), 1);
    }

    #[test]
    fn samples_since_filters_by_timestamp() {
        let ring = LiveRing::new(300, 100);
        let base = Utc::now();
        ring.push(sample("r1", base, 1.0));
        ring.push(sample("r1", base + ChronoDuration::seconds(30), 2.0));
        let picked = ring.samples_since(base + ChronoDuration::seconds(1));
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].cpu_usage, 2.0);
    }
}
