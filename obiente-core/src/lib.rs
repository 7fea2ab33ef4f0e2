pub mod aggregate;
pub mod compose;
pub mod config;
pub mod docker;
pub mod error;
pub mod fleet;
pub mod gateway;
pub mod labels;
pub mod lifecycle;
pub mod metrics;
pub mod reaper;
pub mod sanitize;
pub mod store;
pub mod swarm;
pub mod types;
pub mod vm;

pub use aggregate::Aggregator;
pub use config::Config;
pub use docker::DockerEngine;
pub use error::{OrchestratorError, OrchestratorResult};
pub use fleet::{FleetSynchronizer, NodeSelector};
pub use gateway::GatewayClient;
pub use lifecycle::LifecycleEngine;
pub use metrics::MetricsPipeline;
pub use reaper::Reaper;
pub use store::Store;
pub use types::*;
pub use vm::{ProxmoxClient, VmManager};
