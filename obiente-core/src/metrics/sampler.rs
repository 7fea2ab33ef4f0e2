/*!
 * Parallel per-container sampling.
 *
 * Each cycle pushes this node's running locations through a bounded worker
 * pool. Workers inspect, fetch stats through the circuit breaker with
 * exponential-backoff retries and an independent per-read deadline, derive
 * counter deltas against the cached previous sample, and publish the result
 * to the live ring and subscribers. One slow container never starves its
 * peers.
 */

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::MetricsConfig;
use crate::docker::{cpu_percent_of, DockerEngine, EngineStats};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::metrics::breaker::CircuitBreaker;
use crate::metrics::health::PipelineHealth;
use crate::metrics::ring::LiveRing;
use crate::metrics::subscriber::SubscriberHub;
use crate::store::Store;
use crate::swarm::is_synthetic_id;
use crate::types::{DeploymentLocation, LocationStatus, RawSample, ResourceType};

/// Cached absolute counters from a container's previous sample.
#[derive(Clone, Copy, Debug)]
pub struct PreviousCounters {
    pub network_rx: u64,
    pub network_tx: u64,
    pub disk_read: u64,
    pub disk_write: u64,
    pub seen_at: Instant,
}

pub struct Sampler {
    store: Arc<Store>,
    docker: Arc<DockerEngine>,
    config: MetricsConfig,
    node_id: String,
    breaker: Arc<CircuitBreaker>,
    ring: Arc<LiveRing>,
    hub: Arc<SubscriberHub>,
    health: Arc<PipelineHealth>,
    previous: Arc<Mutex<HashMap<String, PreviousCounters>>>,
}

impl Sampler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        docker: Arc<DockerEngine>,
        config: MetricsConfig,
        node_id: String,
        breaker: Arc<CircuitBreaker>,
        ring: Arc<LiveRing>,
        hub: Arc<SubscriberHub>,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self {
            store,
            docker,
            config,
            node_id,
            breaker,
            ring,
            hub,
            health,
            previous: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// One sampling cycle over every running location owned by this node.
    pub async fn run_cycle(self: &Arc<Self>) {
        let locations = match self.store.running_locations_for_node(&self.node_id).await {
            Ok(locations) => locations,
            Err(e) => {
                warn!("Could not load locations for sampling: {}", e);
                self.health.record_failure();
                return;
            }
        };
        if locations.is_empty() {
            return;
        }

        let worker_count = self.config.max_workers.min(locations.len()).max(1);
        let (tx, rx) = mpsc::channel::<DeploymentLocation>(worker_count);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let sampler = Arc::clone(self);
            let rx = Arc::clone(&rx);
            workers.push(tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    match job {
                        Some(location) => sampler.sample_one(location).await,
                        None => break,
                    }
                }
            }));
        }

        for location in locations {
            if tx.send(location).await.is_err() {
                break;
            }
        }
        drop(tx);
        for worker in workers {
            let _ = worker.await;
        }
    }

    /// Sample one container. Failures are silent skips: the location is
    /// retried next cycle and never blocks its peers.
    async fn sample_one(&self, location: DeploymentLocation) {
        if is_synthetic_id(&location.container_id) {
            return;
        }

        match self.docker.inspect_container(&location.container_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!(
                    "Container {} is gone; marking location {} stopped",
                    location.container_id, location.id
                );
                if let Err(e) = self
                    .store
                    .update_location_status(&location.id, LocationStatus::Stopped)
                    .await
                {
                    warn!("Could not mark location {} stopped: {}", location.id, e);
                }
                return;
            }
            Err(e) => {
                debug!("Inspect of {} failed: {}", location.container_id, e);
                self.health.record_failure();
                return;
            }
        }

        let stats = match self.stats_with_retry(&location.container_id).await {
            Ok(stats) => stats,
            Err(OrchestratorError::CircuitOpen) => {
                debug!("Stats for {} rejected: circuit open", location.container_id);
                return;
            }
            Err(e) => {
                debug!(
                    "Stats for {} failed after retries: {}",
                    location.container_id, e
                );
                self.health.record_failure();
                return;
            }
        };

        let sample = self.derive_sample(&location, &stats);
        if let Err(e) = self
            .store
            .update_location_usage(&location.container_id, sample.cpu_usage, sample.memory_usage)
            .await
        {
            debug!("Usage update for {} failed: {}", location.container_id, e);
        }
        self.hub.publish(&sample);
        self.ring.push(sample);
        self.health.record_success();
    }

    /// Stats read wrapped in the circuit breaker and an exponential-backoff
    /// retry. Every attempt carries its own deadline so a hung read cannot
    /// stall the worker.
    async fn stats_with_retry(&self, container_id: &str) -> OrchestratorResult<EngineStats> {
        let deadline = Duration::from_secs(self.config.stats_timeout_secs);
        let mut backoff = Duration::from_secs(self.config.stats_retry_initial_secs);
        let cap = Duration::from_secs(self.config.stats_retry_cap_secs);

        let mut last_error = OrchestratorError::TransientStats(container_id.to_string());
        for attempt in 1..=self.config.stats_max_attempts {
            let result = self
                .breaker
                .call(|| async {
                    match tokio::time::timeout(deadline, self.docker.container_stats(container_id))
                        .await
                    {
                        Ok(result) => result,
                        Err(elapsed) => Err(OrchestratorError::Cancelled(elapsed.to_string())),
                    }
                })
                .await;
            match result {
                Ok(stats) => return Ok(stats),
                Err(OrchestratorError::CircuitOpen) => return Err(OrchestratorError::CircuitOpen),
                Err(e) => {
                    last_error = e;
                    if attempt < self.config.stats_max_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(cap);
                    }
                }
            }
        }
        Err(last_error)
    }

    /// Turn a stats frame into a sample, deriving deltas against the cached
    /// previous counters for this container.
    fn derive_sample(&self, location: &DeploymentLocation, stats: &EngineStats) -> RawSample {
        let cpu = cpu_percent_of(stats, self.config.min_system_delta_ns);

        let previous = {
            let mut cache = self.previous.lock().unwrap_or_else(|e| e.into_inner());
            let previous = cache.get(&location.container_id).copied();
            cache.insert(
                location.container_id.clone(),
                PreviousCounters {
                    network_rx: stats.network_rx,
                    network_tx: stats.network_tx,
                    disk_read: stats.disk_read,
                    disk_write: stats.disk_write,
                    seen_at: Instant::now(),
                },
            );
            previous
        };

        let (rx, tx, read, write) = match previous {
            Some(prev) => (
                delta_or_reset(stats.network_rx, prev.network_rx),
                delta_or_reset(stats.network_tx, prev.network_tx),
                delta_or_reset(stats.disk_read, prev.disk_read),
                delta_or_reset(stats.disk_write, prev.disk_write),
            ),
            // First sighting: no previous counters, so no deltas yet.
            None => (0, 0, 0, 0),
        };

        RawSample {
            resource_type: ResourceType::Deployment,
            resource_id: location.deployment_id.clone(),
            container_id: location.container_id.clone(),
            node_id: self.node_id.clone(),
            cpu_usage: cpu,
            memory_usage: stats.memory_usage as i64,
            network_rx_bytes: rx,
            network_tx_bytes: tx,
            disk_read_bytes: read,
            disk_write_bytes: write,
            request_count: 0,
            error_count: 0,
            timestamp: Utc::now(),
        }
    }

    /// Janitor pass over the previous-stats cache: drop entries for
    /// containers that are no longer running, then enforce the cache cap one
    /// eviction at a time, oldest first.
    pub async fn cleanup_previous(&self) {
        let running: std::collections::HashSet<String> = match self
            .store
            .running_locations_for_node(&self.node_id)
            .await
        {
            Ok(locations) => locations.into_iter().map(|l| l.container_id).collect(),
            Err(e) => {
                warn!("Janitor could not load running locations: {}", e);
                return;
            }
        };

        let mut cache = self.previous.lock().unwrap_or_else(|e| e.into_inner());
        cache.retain(|container_id, _| running.contains(container_id));
        while cache.len() > self.config.max_previous_stats {
            let oldest = cache
                .iter()
                .min_by_key(|(_, counters)| counters.seen_at)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    cache.remove(&id);
                }
                None => break,
            }
        }
    }

    pub fn previous_len(&self) -> usize {
        self.previous
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// Counter delta with reset detection: a decreasing counter yields the
/// current absolute value, never a negative delta.
pub fn delta_or_reset(current: u64, previous: u64) -> i64 {
    if current >= previous {
        (current - previous) as i64
    } else {
        current as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::cpu_percent_of;

    #[test]
    fn counter_wrap_records_current_absolute() {
        assert_eq!(delta_or_reset(500, 300), 200);
        assert_eq!(delta_or_reset(120, 900), 120);
        assert_eq!(delta_or_reset(0, 0), 0);
    }

    fn stats(cpu_delta: i64, system_delta: i64, online: u64) -> EngineStats {
        EngineStats {
            cpu_total: (1_000_000_000 + cpu_delta.max(0)) as u64,
            precpu_total: if cpu_delta < 0 {
                (1_000_000_000 - cpu_delta) as u64
            } else {
                1_000_000_000
            },
            cpu_system: (50_000_000_000 + system_delta) as u64,
            precpu_system: 50_000_000_000,
            online_cpus: online,
            memory_usage: 0,
            network_rx: 0,
            network_tx: 0,
            disk_read: 0,
            disk_write: 0,
        }
    }

    #[test]
    fn cpu_percent_guards_reject_invalid_samples() {
        // Sub-millisecond system delta.
        assert_eq!(cpu_percent_of(&stats(1_000_000, 500_000, 4), 1_000_000), 0.0);
        // Negative cpu delta (counter wrap).
        assert_eq!(
            cpu_percent_of(&stats(-1_000_000, 10_000_000, 4), 1_000_000),
            0.0
        );
        // Result above online_cpus * 100 is impossible.
        assert_eq!(
            cpu_percent_of(&stats(100_000_000, 10_000_000, 1), 1_000_000),
            0.0
        );
    }

    #[test]
    fn cpu_percent_computes_share_of_system_delta() {
        // 25% of the system delta across 4 cpus = 100%.
        let percent = cpu_percent_of(&stats(25_000_000, 100_000_000, 4), 1_000_000);
        assert!((percent - 100.0).abs() < 1e-9);
    }
}
