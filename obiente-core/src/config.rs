use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Orchestrator configuration. Defaults are production values; every tunable
/// can be overridden through a TOML file and then through the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_path: String,
    /// Primary persisted-state root; fallbacks are tried in order when the
    /// primary is not writable.
    pub data_root: String,
    pub data_root_fallbacks: Vec<String>,
    /// Clustered (swarm) scheduling mode.
    pub enable_swarm: bool,
    pub node: NodeConfig,
    pub metrics: MetricsConfig,
    pub aggregation: AggregationConfig,
    pub compose: ComposeConfig,
    pub hypervisor: Option<HypervisorConfig>,
    pub gateway_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// `least-loaded`, `round-robin` or `resource-based`.
    pub selection_strategy: String,
    pub max_deployments: i64,
    pub shared_network: String,
    /// Literal network name used when discovery finds nothing.
    pub shared_network_fallback: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub sample_interval_secs: u64,
    pub store_interval_secs: u64,
    pub max_workers: usize,
    pub live_retention_secs: u64,
    pub max_live_per_resource: usize,
    pub batch_size: usize,
    pub max_queue_size: usize,
    pub max_retries: u32,
    pub retry_interval_secs: u64,
    pub subscriber_buffer: usize,
    pub slow_subscriber_secs: u64,
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub half_open_max_calls: u32,
    pub health_check_secs: u64,
    pub max_previous_stats: usize,
    /// Per-container deadline on a single stats read.
    pub stats_timeout_secs: u64,
    /// System cpu deltas below this are discarded as invalid, in nanoseconds.
    pub min_system_delta_ns: u64,
    pub stats_retry_initial_secs: u64,
    pub stats_retry_cap_secs: u64,
    pub stats_max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Raw samples older than this are rolled into hourly aggregates.
    pub retention_hours: i64,
    /// Assumed interval for unusable gaps, in seconds.
    pub default_sample_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// Opt-in auto TCP health injection for compose deployments.
    pub auto_healthcheck: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypervisorConfig {
    pub url: String,
    pub token_id: String,
    pub token_secret: String,
    pub skip_tls_verify: bool,
    /// Storage used for cloud-init snippets.
    pub snippet_storage: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "/var/lib/obiente/orchestrator.db".to_string(),
            data_root: "/var/lib/obiente".to_string(),
            data_root_fallbacks: vec!["/var/obiente/tmp".to_string(), "/tmp/obiente".to_string()],
            enable_swarm: false,
            node: NodeConfig {
                selection_strategy: "least-loaded".to_string(),
                max_deployments: 100,
                shared_network: "obiente-net".to_string(),
                shared_network_fallback: "obiente-net".to_string(),
            },
            metrics: MetricsConfig {
                sample_interval_secs: 5,
                store_interval_secs: 60,
                max_workers: 50,
                live_retention_secs: 300,
                max_live_per_resource: 1000,
                batch_size: 100,
                max_queue_size: 1000,
                max_retries: 5,
                retry_interval_secs: 120,
                subscriber_buffer: 100,
                slow_subscriber_secs: 5,
                failure_threshold: 5,
                cooldown_secs: 60,
                half_open_max_calls: 3,
                health_check_secs: 30,
                max_previous_stats: 10000,
                stats_timeout_secs: 10,
                min_system_delta_ns: 1_000_000,
                stats_retry_initial_secs: 1,
                stats_retry_cap_secs: 30,
                stats_max_attempts: 3,
            },
            aggregation: AggregationConfig {
                retention_hours: 24,
                default_sample_secs: 5,
            },
            compose: ComposeConfig {
                auto_healthcheck: false,
            },
            hypervisor: None,
            gateway_url: None,
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the optional TOML file, then
    /// environment overrides.
    pub async fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = match config_path {
            Some(p) => {
                let path = PathBuf::from(p);
                if path.exists() {
                    let content = tokio::fs::read_to_string(&path).await?;
                    toml::from_str(&content)?
                } else {
                    Config::default()
                }
            }
            None => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply environment variable overrides on top of the loaded values.
    pub fn apply_env(&mut self) {
        env_string("DATABASE_PATH", &mut self.database_path);
        env_string("DATA_ROOT", &mut self.data_root);
        env_bool("ENABLE_SWARM", &mut self.enable_swarm);
        env_bool(
            "OBIENTE_ENABLE_AUTO_HEALTHCHECK",
            &mut self.compose.auto_healthcheck,
        );

        env_string("NODE_SELECTION_STRATEGY", &mut self.node.selection_strategy);
        env_num("MAX_DEPLOYMENTS_PER_NODE", &mut self.node.max_deployments);
        env_string("SHARED_NETWORK_NAME", &mut self.node.shared_network);

        let m = &mut self.metrics;
        env_num("METRICS_SAMPLE_INTERVAL_SECS", &mut m.sample_interval_secs);
        env_num("METRICS_STORE_INTERVAL_SECS", &mut m.store_interval_secs);
        env_num("METRICS_MAX_WORKERS", &mut m.max_workers);
        env_num("METRICS_LIVE_RETENTION_SECS", &mut m.live_retention_secs);
        env_num("METRICS_MAX_LIVE_PER_RESOURCE", &mut m.max_live_per_resource);
        env_num("METRICS_BATCH_SIZE", &mut m.batch_size);
        env_num("METRICS_MAX_QUEUE_SIZE", &mut m.max_queue_size);
        env_num("METRICS_MAX_RETRIES", &mut m.max_retries);
        env_num("METRICS_RETRY_INTERVAL_SECS", &mut m.retry_interval_secs);
        env_num("METRICS_SUBSCRIBER_BUFFER", &mut m.subscriber_buffer);
        env_num("METRICS_SLOW_SUBSCRIBER_SECS", &mut m.slow_subscriber_secs);
        env_num("METRICS_FAILURE_THRESHOLD", &mut m.failure_threshold);
        env_num("METRICS_COOLDOWN_SECS", &mut m.cooldown_secs);
        env_num("METRICS_HALF_OPEN_MAX_CALLS", &mut m.half_open_max_calls);
        env_num("METRICS_HEALTH_CHECK_SECS", &mut m.health_check_secs);
        env_num("METRICS_MAX_PREVIOUS_STATS", &mut m.max_previous_stats);
        env_num("METRICS_STATS_TIMEOUT_SECS", &mut m.stats_timeout_secs);

        env_num(
            "AGGREGATION_RETENTION_HOURS",
            &mut self.aggregation.retention_hours,
        );

        if let Ok(url) = std::env::var("HYPERVISOR_URL") {
            let mut hv = self.hypervisor.clone().unwrap_or(HypervisorConfig {
                url: String::new(),
                token_id: String::new(),
                token_secret: String::new(),
                skip_tls_verify: false,
                snippet_storage: "local".to_string(),
            });
            hv.url = url;
            if let Ok(v) = std::env::var("HYPERVISOR_TOKEN_ID") {
                hv.token_id = v;
            }
            if let Ok(v) = std::env::var("HYPERVISOR_TOKEN_SECRET") {
                hv.token_secret = v;
            }
            env_bool("SKIP_TLS_VERIFY", &mut hv.skip_tls_verify);
            self.hypervisor = Some(hv);
        }

        if let Ok(url) = std::env::var("GATEWAY_URL") {
            if !url.is_empty() {
                self.gateway_url = Some(url);
            }
        }
    }

    /// All persisted-state roots, primary first.
    pub fn data_roots(&self) -> Vec<PathBuf> {
        let mut roots = vec![PathBuf::from(&self.data_root)];
        roots.extend(self.data_root_fallbacks.iter().map(PathBuf::from));
        roots
    }
}

fn env_string(key: &str, target: &mut String) {
    if let Ok(v) = std::env::var(key) {
        if !v.is_empty() {
            *target = v;
        }
    }
}

fn env_bool(key: &str, target: &mut bool) {
    if let Ok(v) = std::env::var(key) {
        *target = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
    }
}

fn env_num<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(parsed) = v.parse::<T>() {
            *target = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_production_values() {
        let config = Config::default();
        assert_eq!(config.metrics.sample_interval_secs, 5);
        assert_eq!(config.metrics.store_interval_secs, 60);
        assert_eq!(config.metrics.max_workers, 50);
        assert_eq!(config.metrics.failure_threshold, 5);
        assert_eq!(config.metrics.max_live_per_resource, 1000);
        assert_eq!(config.aggregation.retention_hours, 24);
        assert!(!config.enable_swarm);
        assert_eq!(config.node.selection_strategy, "least-loaded");
    }

    #[test]
    fn data_roots_keep_priority_order() {
        let config = Config::default();
        let roots = config.data_roots();
        assert_eq!(roots[0], PathBuf::from("/var/lib/obiente"));
        assert_eq!(roots[1], PathBuf::from("/var/obiente/tmp"));
        assert_eq!(roots[2], PathBuf::from("/tmp/obiente"));
    }
}
