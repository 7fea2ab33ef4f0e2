/*!
 * Metrics collection pipeline.
 *
 * Owns the sampler, live ring, subscriber hub, batched persistence and
 * health machinery, and runs their loops as cancellable tasks: live
 * sampling, storage batching, ring cleanup, retry processing, the
 * previous-stats janitor, the health checker and the backpressure monitor.
 */

pub mod breaker;
pub mod health;
pub mod ring;
pub mod sampler;
pub mod storage;
pub mod subscriber;

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::docker::DockerEngine;
use crate::store::Store;
use crate::types::RawSample;
use breaker::CircuitBreaker;
use health::{HealthSnapshot, PipelineHealth};
use ring::LiveRing;
use sampler::Sampler;
use storage::MetricsStorage;
use subscriber::SubscriberHub;

const RING_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const RETRY_PROCESS_INTERVAL: Duration = Duration::from_secs(120);
const JANITOR_INTERVAL: Duration = Duration::from_secs(600);

pub struct MetricsPipeline {
    sampler: Arc<Sampler>,
    storage: Arc<MetricsStorage>,
    ring: Arc<LiveRing>,
    hub: Arc<SubscriberHub>,
    health: Arc<PipelineHealth>,
    breaker: Arc<CircuitBreaker>,
    config: Arc<Config>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    last_flush: Arc<Mutex<DateTime<Utc>>>,
}

impl MetricsPipeline {
    pub fn new(
        store: Arc<Store>,
        docker: Arc<DockerEngine>,
        config: Arc<Config>,
        node_id: String,
        cancel: CancellationToken,
    ) -> Self {
        let m = &config.metrics;
        let breaker = Arc::new(CircuitBreaker::new(
            m.failure_threshold,
            Duration::from_secs(m.cooldown_secs),
            m.half_open_max_calls,
        ));
        let ring = Arc::new(LiveRing::new(m.live_retention_secs, m.max_live_per_resource));
        let hub = Arc::new(SubscriberHub::new(
            m.subscriber_buffer,
            Duration::from_secs(m.slow_subscriber_secs),
        ));
        let health = Arc::new(PipelineHealth::new(Duration::from_secs(
            m.sample_interval_secs,
        )));
        let sampler = Arc::new(Sampler::new(
            Arc::clone(&store),
            docker,
            m.clone(),
            node_id,
            Arc::clone(&breaker),
            Arc::clone(&ring),
            Arc::clone(&hub),
            Arc::clone(&health),
        ));
        let storage = Arc::new(MetricsStorage::new(store, m.clone()));

        Self {
            sampler,
            storage,
            ring,
            hub,
            health,
            breaker,
            config,
            cancel,
            tasks: Mutex::new(Vec::new()),
            last_flush: Arc::new(Mutex::new(Utc::now())),
        }
    }

    /// Spawn every pipeline loop. Each observes the cancellation token and
    /// exits cleanly on shutdown.
    pub fn start(&self) {
        info!(
            "Starting metrics pipeline (sample every {}s, persist every {}s, {} workers)",
            self.config.metrics.sample_interval_secs,
            self.config.metrics.store_interval_secs,
            self.config.metrics.max_workers
        );
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());

        // (a) live sampler, paced by the health-adjusted interval.
        {
            let sampler = Arc::clone(&self.sampler);
            let health = Arc::clone(&self.health);
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let interval = health.effective_interval();
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => sampler.run_cycle().await,
                    }
                }
                debug!("Sampler loop stopped");
            }));
        }

        // (b) storage batcher.
        {
            let storage = Arc::clone(&self.storage);
            let ring = Arc::clone(&self.ring);
            let last_flush = Arc::clone(&self.last_flush);
            let cancel = self.cancel.clone();
            let interval = Duration::from_secs(self.config.metrics.store_interval_secs);
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {
                            let since = {
                                let mut last = last_flush.lock().unwrap_or_else(|e| e.into_inner());
                                let since = *last;
                                *last = Utc::now();
                                since
                            };
                            storage.flush(ring.samples_since(since)).await;
                        }
                    }
                }
                debug!("Storage batcher stopped");
            }));
        }

        // (c) live ring cleanup.
        {
            let ring = Arc::clone(&self.ring);
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RING_CLEANUP_INTERVAL) => ring.cleanup(Utc::now()),
                    }
                }
            }));
        }

        // (d) retry processor.
        {
            let storage = Arc::clone(&self.storage);
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RETRY_PROCESS_INTERVAL) => storage.process_retries().await,
                    }
                }
            }));
        }

        // (e) previous-stats janitor.
        {
            let sampler = Arc::clone(&self.sampler);
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(JANITOR_INTERVAL) => sampler.cleanup_previous().await,
                    }
                }
            }));
        }

        // (f) health checker.
        {
            let health = Arc::clone(&self.health);
            let cancel = self.cancel.clone();
            let interval = Duration::from_secs(self.config.metrics.health_check_secs);
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => health.tick(),
                    }
                }
            }));
        }

        // (g) subscriber backpressure monitor.
        {
            let hub = Arc::clone(&self.hub);
            let cancel = self.cancel.clone();
            let interval = Duration::from_secs(self.config.metrics.slow_subscriber_secs);
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => hub.monitor(),
                    }
                }
            }));
        }
    }

    /// Cancel and join every loop. Called once during shutdown.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        info!("Metrics pipeline stopped");
    }

    pub fn subscribe(&self) -> (u64, mpsc::Receiver<RawSample>) {
        self.hub.subscribe()
    }

    pub fn unsubscribe(&self, id: u64) {
        self.hub.unsubscribe(id);
    }

    pub fn live_metrics(&self, resource_id: &str, since: Option<DateTime<Utc>>) -> Vec<RawSample> {
        self.ring.live_for(resource_id, since)
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.health
            .snapshot(self.hub.dropped_total(), self.breaker.state_name())
    }

    pub fn queued_retry_batches(&self) -> usize {
        self.storage.queued_batches()
    }
}
