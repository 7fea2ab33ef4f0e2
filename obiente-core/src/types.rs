use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Hypervisor/container host registered in the fleet inventory.
///
/// Rows are upserted by the fleet synchronizer on every cycle. Synthetic ids
/// of the form `local-<hostname>` identify hosts registered outside of swarm
/// mode; those rows are never reaped by the cluster sync.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub hostname: String,
    pub role: NodeRole,
    pub availability: NodeAvailability,
    pub status: NodeStatus,
    /// Total CPU capacity in cores.
    pub total_cpu: f64,
    /// Total memory in bytes.
    pub total_memory: i64,
    /// CPU in use across managed workloads, in cores.
    pub used_cpu: f64,
    /// Memory in use across managed workloads, in bytes.
    pub used_memory: i64,
    pub deployment_count: i64,
    pub max_deployments: i64,
    pub labels: HashMap<String, String>,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// A node may receive new workloads only while active, ready, and below
    /// its deployment cap.
    pub fn is_eligible(&self) -> bool {
        self.availability == NodeAvailability::Active
            && self.status == NodeStatus::Ready
            && self.deployment_count < self.max_deployments
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeRole {
    Manager,
    Worker,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Manager => "manager",
            NodeRole::Worker => "worker",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "manager" => NodeRole::Manager,
            _ => NodeRole::Worker,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeAvailability {
    Active,
    Pause,
    Drain,
}

impl NodeAvailability {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeAvailability::Active => "active",
            NodeAvailability::Pause => "pause",
            NodeAvailability::Drain => "drain",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => NodeAvailability::Active,
            "pause" => NodeAvailability::Pause,
            _ => NodeAvailability::Drain,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeStatus {
    Ready,
    Down,
    Unknown,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Ready => "ready",
            NodeStatus::Down => "down",
            NodeStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "ready" => NodeStatus::Ready,
            "down" => NodeStatus::Down,
            _ => NodeStatus::Unknown,
        }
    }
}

/// Desired state for one workload: either a single image or a multi-service
/// compose manifest, never both.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub organization_id: String,
    pub image: Option<String>,
    pub start_command: Option<String>,
    pub env_vars: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub port: Option<u16>,
    pub memory_bytes: Option<i64>,
    pub cpu_shares: Option<i64>,
    pub replicas: Option<u32>,
    pub domain: String,
    pub healthcheck: HealthcheckSpec,
    pub compose_yaml: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    pub fn is_compose(&self) -> bool {
        self.compose_yaml
            .as_deref()
            .map(|y| !y.trim().is_empty())
            .unwrap_or(false)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HealthcheckSpec {
    pub kind: HealthcheckKind,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub expected_status: Option<u16>,
    pub custom_command: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum HealthcheckKind {
    #[default]
    Unspecified,
    Disabled,
    Tcp,
    Http,
    Custom,
}

impl HealthcheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthcheckKind::Unspecified => "unspecified",
            HealthcheckKind::Disabled => "disabled",
            HealthcheckKind::Tcp => "tcp",
            HealthcheckKind::Http => "http",
            HealthcheckKind::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "disabled" => HealthcheckKind::Disabled,
            "tcp" => HealthcheckKind::Tcp,
            "http" => HealthcheckKind::Http,
            "custom" => HealthcheckKind::Custom,
            _ => HealthcheckKind::Unspecified,
        }
    }
}

/// One ingress rule: domain (+ optional path prefix) to a service target
/// port. The routing's `target_port` always wins over any port declared on
/// the deployment or inside a manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploymentRouting {
    pub id: String,
    pub deployment_id: String,
    /// `""` or `"default"` address the primary service.
    pub service_name: String,
    pub domain: String,
    pub path_prefix: Option<String>,
    pub target_port: u16,
    pub protocol: RoutingProtocol,
    pub ssl_enabled: bool,
    pub ssl_cert_resolver: Option<String>,
    pub middleware: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeploymentRouting {
    /// Whether this routing addresses the given compose/deployment service.
    /// An empty or `default` name on either side matches the primary.
    pub fn matches_service(&self, service: &str) -> bool {
        let primary = |s: &str| s.is_empty() || s == "default";
        self.service_name == service || primary(&self.service_name) || primary(service)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RoutingProtocol {
    Http,
    Https,
    Grpc,
    Other,
}

impl RoutingProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingProtocol::Http => "http",
            RoutingProtocol::Https => "https",
            RoutingProtocol::Grpc => "grpc",
            RoutingProtocol::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "http" => RoutingProtocol::Http,
            "https" => RoutingProtocol::Https,
            "grpc" => RoutingProtocol::Grpc,
            _ => RoutingProtocol::Other,
        }
    }
}

/// One materialized replica bound to one host. Rows double as exclusive
/// leases on container ids across cooperating orchestrator processes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploymentLocation {
    pub id: String,
    pub deployment_id: String,
    pub node_id: String,
    pub node_hostname: String,
    pub container_id: String,
    pub status: LocationStatus,
    pub port: Option<u16>,
    pub domain: String,
    pub health_status: HealthState,
    /// Latest sampled CPU usage in percent.
    pub cpu_usage: f64,
    /// Latest sampled memory usage in bytes.
    pub memory_usage: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum LocationStatus {
    Running,
    Stopped,
    Unknown,
}

impl LocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationStatus::Running => "running",
            LocationStatus::Stopped => "stopped",
            LocationStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => LocationStatus::Running,
            "stopped" => LocationStatus::Stopped,
            _ => LocationStatus::Unknown,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    Starting,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Starting => "starting",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "healthy" => HealthState::Healthy,
            "unhealthy" => HealthState::Unhealthy,
            "starting" => HealthState::Starting,
            _ => HealthState::Unknown,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Deployment,
    Gameserver,
    Vm,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Deployment => "deployment",
            ResourceType::Gameserver => "gameserver",
            ResourceType::Vm => "vm",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "gameserver" => ResourceType::Gameserver,
            "vm" => ResourceType::Vm,
            _ => ResourceType::Deployment,
        }
    }
}

/// One raw telemetry sample for a container.
///
/// Network and disk fields are post-subtraction deltas against the previous
/// sample of the same container; on counter reset the current absolute value
/// is recorded instead.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawSample {
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub container_id: String,
    pub node_id: String,
    /// CPU usage in percent of one core (may exceed 100 on multi-core).
    pub cpu_usage: f64,
    /// Memory usage in bytes.
    pub memory_usage: i64,
    pub network_rx_bytes: i64,
    pub network_tx_bytes: i64,
    pub disk_read_bytes: i64,
    pub disk_write_bytes: i64,
    pub request_count: i64,
    pub error_count: i64,
    pub timestamp: DateTime<Utc>,
}

/// Hour-aligned aggregate: at most one row per `(resource_id, hour)`.
///
/// `avg_cpu_usage / 100 * 3600` equals CPU core-seconds in that hour and
/// `avg_memory_usage * 3600` equals memory byte-seconds, so the stored
/// averages are duration-weighted, not naive sample means.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HourlyUsage {
    pub resource_id: String,
    pub organization_id: String,
    /// Hour truncated to UTC.
    pub hour: DateTime<Utc>,
    pub avg_cpu_usage: f64,
    pub avg_memory_usage: f64,
    pub bandwidth_rx_bytes: i64,
    pub bandwidth_tx_bytes: i64,
    pub disk_read_bytes: i64,
    pub disk_write_bytes: i64,
    pub request_count: i64,
    pub error_count: i64,
    pub sample_count: i64,
}

/// A managed-but-unaccounted container the reaper has stopped. Volumes are
/// purged no earlier than seven days after `stopped_at`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StrayContainer {
    pub container_id: String,
    pub node_id: String,
    pub stopped_at: DateTime<Utc>,
    pub volumes_deleted_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum VmStatus {
    Creating,
    Starting,
    Running,
    Stopping,
    Stopped,
    Rebooting,
    Failed,
    Deleting,
    Deleted,
}

impl VmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Creating => "creating",
            VmStatus::Starting => "starting",
            VmStatus::Running => "running",
            VmStatus::Stopping => "stopping",
            VmStatus::Stopped => "stopped",
            VmStatus::Rebooting => "rebooting",
            VmStatus::Failed => "failed",
            VmStatus::Deleting => "deleting",
            VmStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "creating" => VmStatus::Creating,
            "starting" => VmStatus::Starting,
            "running" => VmStatus::Running,
            "stopping" => VmStatus::Stopping,
            "rebooting" => VmStatus::Rebooting,
            "failed" => VmStatus::Failed,
            "deleting" => VmStatus::Deleting,
            "deleted" => VmStatus::Deleted,
            _ => VmStatus::Stopped,
        }
    }
}

/// One virtual machine owned by an organization.
///
/// `instance_id` is the hypervisor-assigned identifier. The `ipv4`/`ipv6`
/// lists contain only addresses reported by the hypervisor or provided via
/// configuration; gateway-allocated addresses are kept in `metadata` and are
/// never treated as authoritative.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VmInstance {
    pub id: String,
    pub organization_id: String,
    pub instance_id: Option<String>,
    pub status: VmStatus,
    pub region: String,
    pub image: String,
    pub size: String,
    pub cpu_cores: i64,
    pub memory_bytes: i64,
    pub disk_bytes: i64,
    pub ipv4: Vec<String>,
    pub ipv6: Vec<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Effective plan limits read from the organization row.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OrganizationPlan {
    pub organization_id: String,
    pub max_memory_bytes: Option<i64>,
    pub max_cpu_cores: Option<f64>,
    pub allow_inter_vm_communication: bool,
}

/// On-disk footprint of one deployment's volume root, refreshed by the
/// periodic storage calculator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageUsage {
    pub deployment_id: String,
    pub bytes: i64,
    pub measured_at: DateTime<Utc>,
}
