/*!
 * Hourly aggregation and startup backfill.
 *
 * Raw samples older than the retention horizon are rolled into one row per
 * `(resource, hour)` and deleted. Sample intervals are non-uniform, so core
 * -seconds and byte-seconds are computed as weighted step integrals over
 * adjacent timestamps, holding each value until the next sample and the
 * last value until the end of the hour. Naive `average x 3600` math would
 * misbill any workload with uneven sampling.
 */

use anyhow::Result;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, DurationRound, TimeZone, Utc};
use futures_util::StreamExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::store::Store;
use crate::types::{HourlyUsage, RawSample};

/// Concurrent deployments per backfill batch.
const BACKFILL_CONCURRENCY: usize = 10;

/// One hour's integrated usage before conversion to stored averages.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HourAggregate {
    pub cpu_core_seconds: f64,
    pub memory_byte_seconds: f64,
    pub bandwidth_rx_bytes: i64,
    pub bandwidth_tx_bytes: i64,
    pub disk_read_bytes: i64,
    pub disk_write_bytes: i64,
    pub request_count: i64,
    pub error_count: i64,
    pub sample_count: i64,
}

pub struct Aggregator {
    store: Arc<Store>,
    config: Arc<Config>,
}

impl Aggregator {
    pub fn new(store: Arc<Store>, config: Arc<Config>) -> Self {
        Self { store, config }
    }

    /// Roll every resource's raw samples older than the retention horizon
    /// into hourly rows, deleting the originals hour by hour.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<()> {
        let cutoff = truncate_to_hour(now - ChronoDuration::hours(self.config.aggregation.retention_hours));
        let resources = self.store.resources_with_samples_before(cutoff).await?;
        if resources.is_empty() {
            return Ok(());
        }
        debug!(
            "Aggregating {} resource(s) with samples older than {}",
            resources.len(),
            cutoff
        );

        for (resource_type, resource_id) in resources {
            let Some(oldest) = self.store.oldest_sample_before(&resource_id, cutoff).await? else {
                continue;
            };
            let organization_id = self
                .store
                .organization_for_resource(resource_type, &resource_id)
                .await?
                .unwrap_or_default();

            let mut current_hour = truncate_to_hour(oldest);
            while current_hour < cutoff {
                let next_hour = current_hour + ChronoDuration::hours(1);

                // Recompute under current logic: any stale row for this hour
                // is replaced wholesale.
                self.store.delete_hourly(&resource_id, current_hour).await?;

                let samples = self
                    .store
                    .samples_in_range(&resource_id, current_hour, next_hour)
                    .await?;
                if !samples.is_empty() {
                    let aggregate = aggregate_hour(
                        &samples,
                        current_hour,
                        self.config.aggregation.default_sample_secs,
                    );
                    self.store
                        .insert_hourly(&to_hourly_usage(
                            &resource_id,
                            &organization_id,
                            current_hour,
                            &aggregate,
                        ))
                        .await?;
                    let deleted = self
                        .store
                        .delete_samples_in_range(&resource_id, current_hour, next_hour)
                        .await?;
                    debug!(
                        "Aggregated {} sample(s) of {} into hour {}",
                        deleted, resource_id, current_hour
                    );
                }
                current_hour = next_hour;
            }
        }
        Ok(())
    }

    /// Startup backfill: recompute any missing hour between the start of the
    /// month and now, in concurrent batches of deployments. Existing rows
    /// are left alone and raw samples are not deleted here; the hourly pass
    /// owns deletion once the retention horizon moves past them.
    pub async fn backfill(&self, now: DateTime<Utc>) -> Result<()> {
        let month_start = month_start_of(now);
        let deployments = self
            .store
            .deployment_ids_with_samples_between(month_start, now)
            .await?;
        if deployments.is_empty() {
            return Ok(());
        }
        info!(
            "Backfilling hourly usage for {} deployment(s) since {}",
            deployments.len(),
            month_start
        );

        futures_util::stream::iter(deployments)
            .for_each_concurrent(BACKFILL_CONCURRENCY, |deployment_id| async move {
                if let Err(e) = self.backfill_deployment(&deployment_id, month_start, now).await {
                    warn!("Backfill of {} failed: {}", deployment_id, e);
                }
            })
            .await;
        Ok(())
    }

    async fn backfill_deployment(
        &self,
        deployment_id: &str,
        month_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let organization_id = self
            .store
            .organization_for_resource(crate::types::ResourceType::Deployment, deployment_id)
            .await?
            .unwrap_or_default();

        let mut current_hour = truncate_to_hour(month_start);
        let end = truncate_to_hour(now);
        while current_hour <= end {
            let next_hour = current_hour + ChronoDuration::hours(1);
            if !self.store.hourly_exists(deployment_id, current_hour).await? {
                let samples = self
                    .store
                    .samples_in_range(deployment_id, current_hour, next_hour)
                    .await?;
                if !samples.is_empty() {
                    let aggregate = aggregate_hour(
                        &samples,
                        current_hour,
                        self.config.aggregation.default_sample_secs,
                    );
                    self.store
                        .insert_hourly(&to_hourly_usage(
                            deployment_id,
                            &organization_id,
                            current_hour,
                            &aggregate,
                        ))
                        .await?;
                }
            }
            current_hour = next_hour;
        }
        Ok(())
    }
}

/// Integrate one hour of samples under the hold-last-value rule.
///
/// The first interval holds `samples[0]` from the hour start to its own
/// timestamp; each adjacent pair holds the earlier sample's value across the
/// gap; the final sample's value is held to the end of the hour. An adjacent
/// gap longer than an hour or non-positive is clock skew and contributes the
/// default sampling interval instead.
pub fn aggregate_hour(
    samples: &[RawSample],
    hour_start: DateTime<Utc>,
    default_sample_secs: i64,
) -> HourAggregate {
    let hour_end = hour_start + ChronoDuration::hours(1);
    let default_dt = default_sample_secs as f64;
    let mut aggregate = HourAggregate {
        sample_count: samples.len() as i64,
        ..Default::default()
    };
    let Some(first) = samples.first() else {
        return aggregate;
    };
    let Some(last) = samples.last() else {
        return aggregate;
    };

    let mut cpu_core_seconds = 0.0;
    let mut memory_byte_seconds = 0.0;

    // Leading edge: hold the first value back to the hour boundary.
    let lead = seconds_between(hour_start, first.timestamp).max(0.0);
    cpu_core_seconds += first.cpu_usage / 100.0 * lead;
    memory_byte_seconds += first.memory_usage as f64 * lead;

    for pair in samples.windows(2) {
        let mut dt = seconds_between(pair[0].timestamp, pair[1].timestamp);
        if dt <= 0.0 || dt > 3600.0 {
            dt = default_dt;
        }
        cpu_core_seconds += pair[0].cpu_usage / 100.0 * dt;
        memory_byte_seconds += pair[0].memory_usage as f64 * dt;
    }

    // Trailing edge: hold the last value to the end of the hour.
    let tail = seconds_between(last.timestamp, hour_end).max(0.0);
    cpu_core_seconds += last.cpu_usage / 100.0 * tail;
    memory_byte_seconds += last.memory_usage as f64 * tail;

    // Degenerate hour (all intervals unusable): approximate byte-seconds
    // from the plain sum at the default interval. Lossy, but beats zero.
    if memory_byte_seconds <= 0.0 {
        let sum_memory: f64 = samples.iter().map(|s| s.memory_usage as f64).sum();
        memory_byte_seconds = sum_memory * default_dt;
    }

    aggregate.cpu_core_seconds = cpu_core_seconds;
    aggregate.memory_byte_seconds = memory_byte_seconds;
    aggregate.bandwidth_rx_bytes = samples.iter().map(|s| s.network_rx_bytes).sum();
    aggregate.bandwidth_tx_bytes = samples.iter().map(|s| s.network_tx_bytes).sum();
    aggregate.disk_read_bytes = samples.iter().map(|s| s.disk_read_bytes).sum();
    aggregate.disk_write_bytes = samples.iter().map(|s| s.disk_write_bytes).sum();
    aggregate.request_count = samples.iter().map(|s| s.request_count).sum();
    aggregate.error_count = samples.iter().map(|s| s.error_count).sum();
    aggregate
}

/// Convert integrated seconds into the stored averages: the row is defined
/// so that `avg_cpu_usage / 100 * 3600` returns core-seconds and
/// `avg_memory_usage * 3600` returns byte-seconds.
fn to_hourly_usage(
    resource_id: &str,
    organization_id: &str,
    hour: DateTime<Utc>,
    aggregate: &HourAggregate,
) -> HourlyUsage {
    HourlyUsage {
        resource_id: resource_id.to_string(),
        organization_id: organization_id.to_string(),
        hour,
        avg_cpu_usage: aggregate.cpu_core_seconds / 3600.0 * 100.0,
        avg_memory_usage: aggregate.memory_byte_seconds / 3600.0,
        bandwidth_rx_bytes: aggregate.bandwidth_rx_bytes,
        bandwidth_tx_bytes: aggregate.bandwidth_tx_bytes,
        disk_read_bytes: aggregate.disk_read_bytes,
        disk_write_bytes: aggregate.disk_write_bytes,
        request_count: aggregate.request_count,
        error_count: aggregate.error_count,
        sample_count: aggregate.sample_count,
    }
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 1000.0
}

pub fn truncate_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(ChronoDuration::hours(1)).unwrap_or(ts)
}

fn month_start_of(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(ts.year(), ts.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ResourceType;

    fn sample(hour: DateTime<Utc>, offset_secs: i64, cpu: f64, memory: i64) -> RawSample {
        RawSample {
            resource_type: ResourceType::Deployment,
            resource_id: "r1".to_string(),
            container_id: "c1".to_string(),
            node_id: "n1".to_string(),
            cpu_usage: cpu,
            memory_usage: memory,
            network_rx_bytes: 10,
            network_tx_bytes: 20,
            disk_read_bytes: 0,
            disk_write_bytes: 0,
            request_count: 1,
            error_count: 0,
            timestamp: hour + ChronoDuration::seconds(offset_secs),
        }
    }

    fn hour() -> DateTime<Utc> {
        truncate_to_hour(Utc::now()) - ChronoDuration::hours(48)
    }

    #[test]
    fn step_integral_holds_each_value_until_the_next_sample() {
        let h = hour();
        let samples = vec![
            sample(h, 0, 50.0, 0),
            sample(h, 5, 50.0, 0),
            sample(h, 10, 100.0, 0),
            sample(h, 15, 0.0, 0),
        ];
        let aggregate = aggregate_hour(&samples, h, 5);
        // 0.5 cores held for 5s, 0.5 for 5s, 1.0 for 5s, then 0.0 to the
        // end of the hour.
        let expected = 0.5 * 5.0 + 0.5 * 5.0 + 1.0 * 5.0;
        assert!((aggregate.cpu_core_seconds - expected).abs() / expected < 0.01);

        // Round-trip through the stored average.
        let usage = to_hourly_usage("r1", "org", h, &aggregate);
        let core_seconds = usage.avg_cpu_usage / 100.0 * 3600.0;
        assert!((core_seconds - expected).abs() / expected < 0.01);
        assert_eq!(usage.sample_count, 4);
    }

    #[test]
    fn single_sample_holds_for_the_whole_hour() {
        let h = hour();
        let samples = vec![sample(h, 600, 100.0, 1_000)];
        let aggregate = aggregate_hour(&samples, h, 5);
        // 1.0 core for the full 3600s regardless of where the sample sits.
        assert!((aggregate.cpu_core_seconds - 3600.0).abs() < 1.0);
        assert!((aggregate.memory_byte_seconds - 3_600_000.0).abs() < 1e3);
    }

    #[test]
    fn memory_byte_seconds_track_the_held_value() {
        let h = hour();
        let samples = vec![sample(h, 0, 0.0, 1_000), sample(h, 1800, 0.0, 3_000)];
        let aggregate = aggregate_hour(&samples, h, 5);
        // 1000 bytes held 1800s, then 3000 bytes to the end of the hour.
        let expected = 1_000.0 * 1800.0 + 3_000.0 * 1800.0;
        assert!((aggregate.memory_byte_seconds - expected).abs() < 1e3);
    }

    #[test]
    fn skewed_intervals_fall_back_to_the_default() {
        let h = hour();
        // Two samples with identical timestamps: the pair interval is zero
        // and contributes the default 5s instead.
        let samples = vec![sample(h, 10, 100.0, 0), sample(h, 10, 100.0, 0)];
        let aggregate = aggregate_hour(&samples, h, 5);
        let lead = 10.0;
        let pair_default = 5.0;
        let tail = 3590.0;
        let expected = lead + pair_default + tail;
        assert!((aggregate.cpu_core_seconds - expected).abs() < 1.0);
    }

    #[test]
    fn counters_are_summed_and_counted() {
        let h = hour();
        let samples = vec![sample(h, 0, 0.0, 0), sample(h, 5, 0.0, 0)];
        let aggregate = aggregate_hour(&samples, h, 5);
        assert_eq!(aggregate.bandwidth_rx_bytes, 20);
        assert_eq!(aggregate.bandwidth_tx_bytes, 40);
        assert_eq!(aggregate.request_count, 2);
        assert_eq!(aggregate.sample_count, 2);
    }

    #[test]
    fn hour_truncation_is_utc_aligned() {
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 14, 37, 22).single().unwrap();
        let truncated = truncate_to_hour(ts);
        assert_eq!(
            truncated,
            Utc.with_ymd_and_hms(2025, 6, 1, 14, 0, 0).single().unwrap()
        );
    }
}
