/*!
 * Obiente Orchestrator Daemon (obiented)
 *
 * Long-running per-host service that keeps this node's workloads converged
 * with desired state and measured:
 * - Fleet synchronization and placement for new workloads
 * - Deployment lifecycle against the container engine (direct or swarm)
 * - Metrics sampling, fan-out and batched persistence
 * - Hourly aggregation with startup backfill
 * - Stray-container reaping, data cleanup and storage accounting
 *
 * The API surface lives in a separate service; this daemon owns the
 * background loops and exposes the engine as a library.
 */

use anyhow::{Context, Result};
use clap::Parser;
use obiente_core::{
    Aggregator, Config, DockerEngine, FleetSynchronizer, LifecycleEngine, MetricsPipeline,
    NodeSelector, Reaper, Store,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const AGGREGATION_INTERVAL: Duration = Duration::from_secs(3600);
const REAPER_INTERVAL: Duration = Duration::from_secs(6 * 3600);
const STORAGE_CALC_INTERVAL: Duration = Duration::from_secs(300);
const FLEET_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Grace window for in-flight swarm operations during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(300);

#[derive(Parser, Debug)]
#[command(
    name = "obiented",
    about = "Workload placement, lifecycle and telemetry daemon for Obiente hosts"
)]
struct Args {
    /// Path to a TOML configuration file; environment variables override it.
    #[arg(short, long, env = "OBIENTE_CONFIG")]
    config: Option<String>,

    /// Increase log verbosity (overridden by RUST_LOG).
    #[arg(short, long)]
    verbose: bool,
}

struct Daemon {
    config: Arc<Config>,
    store: Arc<Store>,
    metrics: Arc<MetricsPipeline>,
    aggregator: Arc<Aggregator>,
    reaper: Arc<Reaper>,
    fleet: Arc<FleetSynchronizer>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    async fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let store = Arc::new(
            Store::new(&config.database_path)
                .await
                .context("Failed to open the state store")?,
        );
        let docker = Arc::new(
            DockerEngine::connect()
                .await
                .context("Failed to connect to the container engine")?,
        );

        let fleet = Arc::new(FleetSynchronizer::new(
            Arc::clone(&store),
            Arc::clone(&docker),
            Arc::clone(&config),
        ));
        let selector = Arc::new(NodeSelector::new(
            Arc::clone(&store),
            Arc::clone(&fleet),
            &config.node.selection_strategy,
        ));
        // The lifecycle engine is the library surface for the API service;
        // constructing it here validates the wiring at startup.
        let _lifecycle = LifecycleEngine::new(
            Arc::clone(&store),
            Arc::clone(&docker),
            Arc::clone(&config),
            Arc::clone(&fleet),
            selector,
        );

        let node_id = fleet.local_node_id();
        let cancel = CancellationToken::new();
        let metrics = Arc::new(MetricsPipeline::new(
            Arc::clone(&store),
            Arc::clone(&docker),
            Arc::clone(&config),
            node_id.clone(),
            cancel.child_token(),
        ));
        let aggregator = Arc::new(Aggregator::new(Arc::clone(&store), Arc::clone(&config)));
        let reaper = Arc::new(Reaper::new(
            Arc::clone(&store),
            Arc::clone(&docker),
            Arc::clone(&config),
            node_id,
        ));

        Ok(Self {
            config,
            store,
            metrics,
            aggregator,
            reaper,
            fleet,
            cancel,
            tasks: Vec::new(),
        })
    }

    async fn start(&mut self) -> Result<()> {
        info!(
            "Starting obiented (swarm mode: {})",
            self.config.enable_swarm
        );

        self.fleet
            .sync()
            .await
            .context("Initial fleet synchronization failed")?;

        // Backfill runs concurrently with normal operation; a failure is
        // logged, not fatal.
        {
            let aggregator = Arc::clone(&self.aggregator);
            self.tasks.push(tokio::spawn(async move {
                if let Err(e) = aggregator.backfill(chrono::Utc::now()).await {
                    warn!("Hourly backfill failed: {}", e);
                }
            }));
        }

        self.metrics.start();
        self.spawn_interval_loop("fleet-sync", FLEET_SYNC_INTERVAL, {
            let fleet = Arc::clone(&self.fleet);
            move || {
                let fleet = Arc::clone(&fleet);
                async move {
                    if let Err(e) = fleet.sync().await {
                        warn!("Fleet sync failed: {}", e);
                    }
                }
            }
        });
        self.spawn_interval_loop("hourly-aggregator", AGGREGATION_INTERVAL, {
            let aggregator = Arc::clone(&self.aggregator);
            move || {
                let aggregator = Arc::clone(&aggregator);
                async move {
                    if let Err(e) = aggregator.run_once(chrono::Utc::now()).await {
                        warn!("Hourly aggregation failed: {}", e);
                    }
                }
            }
        });
        self.spawn_interval_loop("stray-reaper", REAPER_INTERVAL, {
            let reaper = Arc::clone(&self.reaper);
            move || {
                let reaper = Arc::clone(&reaper);
                async move {
                    if let Err(e) = reaper.run_once().await {
                        warn!("Stray reaper pass failed: {}", e);
                    }
                }
            }
        });
        self.spawn_interval_loop("storage-calculator", STORAGE_CALC_INTERVAL, {
            let reaper = Arc::clone(&self.reaper);
            move || {
                let reaper = Arc::clone(&reaper);
                async move {
                    if let Err(e) = reaper.calculate_storage().await {
                        warn!("Storage calculation failed: {}", e);
                    }
                }
            }
        });
        self.spawn_build_history_loop();

        // One reaper pass at startup, before the slow cadence takes over.
        if let Err(e) = self.reaper.run_once().await {
            warn!("Initial reaper pass failed: {}", e);
        }

        info!("obiented is up");
        Ok(())
    }

    fn spawn_interval_loop<F, Fut>(&mut self, name: &'static str, interval: Duration, mut body: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so start() controls
            // initial passes.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => body().await,
                }
            }
            info!("Loop {} stopped", name);
        }));
    }

    /// Build history is cleaned once a day at local midnight.
    fn spawn_build_history_loop(&mut self) {
        let reaper = Arc::clone(&self.reaper);
        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                let wait = seconds_until_local_midnight();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {
                        if let Err(e) = reaper.cleanup_build_history().await {
                            warn!("Build history cleanup failed: {}", e);
                        }
                    }
                }
            }
        }));
    }

    async fn stop(mut self) {
        info!("Shutting down obiented...");
        self.cancel.cancel();
        self.metrics.stop().await;

        let drain = async {
            for task in self.tasks.drain(..) {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("Shutdown grace window elapsed with loops still running");
        }

        self.store.close().await;
        info!("obiented stopped");
    }
}

fn seconds_until_local_midnight() -> Duration {
    use chrono::{Duration as ChronoDuration, Local};
    let now = Local::now();
    let next_midnight = (now + ChronoDuration::days(1))
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| naive.and_local_timezone(Local).single());
    match next_midnight {
        Some(midnight) => (midnight - now)
            .to_std()
            .unwrap_or(Duration::from_secs(24 * 3600)),
        None => Duration::from_secs(24 * 3600),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    let config = Config::load(args.config.as_deref())
        .await
        .context("Failed to load configuration")?;

    let mut daemon = Daemon::new(config).await?;
    if let Err(e) = daemon.start().await {
        error!("Startup failed: {}", e);
        return Err(e);
    }

    shutdown_signal().await;
    daemon.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Could not install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
