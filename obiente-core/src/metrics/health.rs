use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Consecutive sampler failures before the pipeline counts as unhealthy.
const UNHEALTHY_FAILURE_THRESHOLD: u32 = 3;

/// Externally-readable health snapshot of the metrics pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub total_samples: u64,
    pub total_failures: u64,
    pub rate_multiplier: f64,
    pub last_sample_age_secs: Option<u64>,
    pub subscriber_drops: u64,
    pub breaker_state: String,
}

/// Collection health and graceful degradation.
///
/// While unhealthy the effective sampling rate is halved; once healthy the
/// multiplier drifts back up toward full rate one step per check.
pub struct PipelineHealth {
    sample_interval: Duration,
    consecutive_failures: AtomicU32,
    total_samples: AtomicU64,
    total_failures: AtomicU64,
    last_sample_at: Mutex<Option<Instant>>,
    rate_multiplier: Mutex<f64>,
}

impl PipelineHealth {
    pub fn new(sample_interval: Duration) -> Self {
        Self {
            sample_interval,
            consecutive_failures: AtomicU32::new(0),
            total_samples: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            last_sample_at: Mutex::new(None),
            rate_multiplier: Mutex::new(1.0),
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.total_samples.fetch_add(1, Ordering::Relaxed);
        let mut last = self.last_sample_at.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some(Instant::now());
    }

    pub fn record_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        self.total_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Health evaluation tick: unhealthy when failures pile up or collection
    /// is lagging behind twice the sampling interval.
    pub fn tick(&self) {
        let unhealthy = self.is_unhealthy();
        let mut multiplier = self
            .rate_multiplier
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if unhealthy {
            if *multiplier > 0.5 {
                warn!("Metrics pipeline unhealthy; halving sampling rate");
            }
            *multiplier = 0.5;
        } else if *multiplier < 1.0 {
            *multiplier = (*multiplier + 0.1).min(1.0);
            if (*multiplier - 1.0).abs() < f64::EPSILON {
                info!("Metrics pipeline recovered to full sampling rate");
            }
        }
    }

    fn is_unhealthy(&self) -> bool {
        if self.consecutive_failures.load(Ordering::SeqCst) >= UNHEALTHY_FAILURE_THRESHOLD {
            return true;
        }
        let last = self.last_sample_at.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(at) => at.elapsed() > self.sample_interval * 2,
            // Nothing sampled yet; don't degrade before the first cycle.
            None => false,
        }
    }

    /// The sampler's effective interval under the current multiplier: a
    /// halved rate doubles the interval.
    pub fn effective_interval(&self) -> Duration {
        let multiplier = *self
            .rate_multiplier
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        self.sample_interval.div_f64(multiplier.max(0.1))
    }

    pub fn snapshot(&self, subscriber_drops: u64, breaker_state: &str) -> HealthSnapshot {
        let last = self.last_sample_at.lock().unwrap_or_else(|e| e.into_inner());
        HealthSnapshot {
            healthy: !self.is_unhealthy(),
            consecutive_failures: self.consecutive_failures.load(Ordering::SeqCst),
            total_samples: self.total_samples.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            rate_multiplier: *self
                .rate_multiplier
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
            last_sample_age_secs: last.map(|at| at.elapsed().as_secs()),
            subscriber_drops,
            breaker_state: breaker_state.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_degrade_and_recovery_drifts_back() {
        let health = PipelineHealth::new(Duration::from_secs(5));
        for _ in 0..3 {
            health.record_failure();
        }
        health.tick();
        assert_eq!(health.effective_interval(), Duration::from_secs(10));

        health.record_success();
        // 0.5 -> 0.6 -> ... -> 1.0 in five ticks.
        for _ in 0..5 {
            health.tick();
        }
        assert_eq!(health.effective_interval(), Duration::from_secs(5));
    }

    #[test]
    fn fresh_pipeline_is_healthy() {
        let health = PipelineHealth::new(Duration::from_secs(5));
        let snapshot = health.snapshot(0, "closed");
        assert!(snapshot.healthy);
        assert_eq!(snapshot.rate_multiplier, 1.0);
        assert!(snapshot.last_sample_age_secs.is_none());
    }

    #[test]
    fn lagging_collection_is_unhealthy() {
        let health = PipelineHealth::new(Duration::from_millis(1));
        health.record_success();
        std::thread::sleep(Duration::from_millis(10));
        health.tick();
        assert!(health.effective_interval() > Duration::from_millis(1));
    }
}
