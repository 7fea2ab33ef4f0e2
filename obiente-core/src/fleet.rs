/*!
 * Fleet inventory and placement.
 *
 * The synchronizer keeps the `nodes` table in step with reality, either by
 * self-registering the local host or, in swarm mode, by mirroring the
 * cluster's node list. The selector picks one eligible node per placement
 * request using a named strategy. Synchronization runs before every
 * selection so placement never acts on stale inventory.
 */

use bollard::models::{NodeSpecAvailabilityEnum, NodeSpecRoleEnum, NodeState};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::docker::{cpu_percent_of, DockerEngine};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::store::Store;
use crate::types::{Node, NodeAvailability, NodeRole, NodeStatus};

pub struct FleetSynchronizer {
    store: Arc<Store>,
    docker: Arc<DockerEngine>,
    config: Arc<Config>,
    hostname: String,
}

impl FleetSynchronizer {
    pub fn new(store: Arc<Store>, docker: Arc<DockerEngine>, config: Arc<Config>) -> Self {
        let hostname = System::host_name().unwrap_or_else(|| "unknown-host".to_string());
        Self {
            store,
            docker,
            config,
            hostname,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Local node id for this host when swarm mode is disabled.
    pub fn local_node_id(&self) -> String {
        format!("local-{}", self.hostname)
    }

    /// Bring the node inventory up to date. Errors here are fatal to the
    /// selection that triggered the sync; a swarm lookup failure falls
    /// through to local registration instead.
    pub async fn sync(&self) -> OrchestratorResult<()> {
        if self.config.enable_swarm {
            match self.docker.is_swarm_manager().await {
                Ok(true) => return self.sync_swarm().await,
                Ok(false) => {
                    debug!("Swarm mode enabled but host is not a manager; registering locally");
                }
                Err(e) => {
                    warn!("Swarm lookup failed, falling back to local registration: {}", e);
                }
            }
        }
        self.register_local().await
    }

    /// Register this host under the synthetic `local-<hostname>` id.
    async fn register_local(&self) -> OrchestratorResult<()> {
        let id = self.local_node_id();
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();
        let total_cpu = sys.cpus().len().max(1) as f64;
        let total_memory = sys.total_memory() as i64;

        let deployment_count = self
            .store
            .count_running_locations_on_hostname(&self.hostname)
            .await
            .map_err(|e| OrchestratorError::Database(e.to_string()))?;
        let (used_cpu, used_memory) = self
            .store
            .sum_location_usage_for_hostname(&self.hostname)
            .await
            .map_err(|e| OrchestratorError::Database(e.to_string()))?;

        let now = Utc::now();
        let node = Node {
            id: id.clone(),
            hostname: self.hostname.clone(),
            role: NodeRole::Manager,
            availability: NodeAvailability::Active,
            status: NodeStatus::Ready,
            total_cpu,
            total_memory,
            used_cpu,
            used_memory,
            deployment_count,
            max_deployments: self.config.node.max_deployments,
            labels: HashMap::new(),
            last_heartbeat: now,
            created_at: now,
            updated_at: now,
        };
        self.upsert_with_identity(&node).await
    }

    /// Mirror the swarm's node list into the inventory. Rows for vanished
    /// cluster nodes are removed, except locally-registered (`local-`) ones.
    async fn sync_swarm(&self) -> OrchestratorResult<()> {
        let swarm_nodes = self.docker.list_swarm_nodes().await?;
        let mut seen_ids = Vec::with_capacity(swarm_nodes.len());

        for swarm_node in swarm_nodes {
            let Some(id) = swarm_node.id.clone() else {
                continue;
            };
            let hostname = swarm_node
                .description
                .as_ref()
                .and_then(|d| d.hostname.clone())
                .unwrap_or_else(|| id.clone());

            let role = match swarm_node.spec.as_ref().and_then(|s| s.role.clone()) {
                Some(NodeSpecRoleEnum::MANAGER) => NodeRole::Manager,
                _ => NodeRole::Worker,
            };
            let availability = match swarm_node
                .spec
                .as_ref()
                .and_then(|s| s.availability.clone())
            {
                Some(NodeSpecAvailabilityEnum::ACTIVE) => NodeAvailability::Active,
                Some(NodeSpecAvailabilityEnum::PAUSE) => NodeAvailability::Pause,
                _ => NodeAvailability::Drain,
            };
            let status = match swarm_node.status.as_ref().and_then(|s| s.state.clone()) {
                Some(NodeState::READY) => NodeStatus::Ready,
                Some(NodeState::DOWN) | Some(NodeState::DISCONNECTED) => NodeStatus::Down,
                _ => NodeStatus::Unknown,
            };

            let resources = swarm_node
                .description
                .as_ref()
                .and_then(|d| d.resources.as_ref());
            let total_cpu = resources
                .and_then(|r| r.nano_cpus)
                .map(|n| n as f64 / 1e9)
                .unwrap_or(1.0);
            let total_memory = resources.and_then(|r| r.memory_bytes).unwrap_or(0);

            let (used_cpu, used_memory) = if hostname == self.hostname {
                self.live_local_usage().await
            } else {
                self.store
                    .sum_location_usage_for_hostname(&hostname)
                    .await
                    .map_err(|e| OrchestratorError::Database(e.to_string()))?
            };
            let deployment_count = self
                .store
                .count_running_locations_on_hostname(&hostname)
                .await
                .map_err(|e| OrchestratorError::Database(e.to_string()))?;

            let now = Utc::now();
            let node = Node {
                id: id.clone(),
                hostname,
                role,
                availability,
                status,
                total_cpu,
                total_memory,
                used_cpu,
                used_memory,
                deployment_count,
                max_deployments: self.config.node.max_deployments,
                labels: swarm_node
                    .spec
                    .as_ref()
                    .and_then(|s| s.labels.clone())
                    .unwrap_or_default(),
                last_heartbeat: now,
                created_at: now,
                updated_at: now,
            };
            self.upsert_with_identity(&node).await?;
            seen_ids.push(id);
        }

        let removed = self
            .store
            .delete_swarm_nodes_except(&seen_ids)
            .await
            .map_err(|e| OrchestratorError::Database(e.to_string()))?;
        if removed > 0 {
            info!("Removed {} vanished cluster node(s) from inventory", removed);
        }
        Ok(())
    }

    /// Upsert a node, handling the hostname-collision case: a row with the
    /// same hostname but a different id means the cluster was reset, so the
    /// old row is deleted and the new id written atomically. Location rows
    /// for the hostname are re-pointed at the new id.
    async fn upsert_with_identity(&self, node: &Node) -> OrchestratorResult<()> {
        let existing = self
            .store
            .get_node_by_hostname(&node.hostname)
            .await
            .map_err(|e| OrchestratorError::Database(e.to_string()))?;

        match existing {
            Some(old) if old.id != node.id => {
                info!(
                    "Node '{}' re-identified: {} -> {}",
                    node.hostname, old.id, node.id
                );
                self.store
                    .replace_node_identity(&old.id, node)
                    .await
                    .map_err(|e| OrchestratorError::Database(e.to_string()))?;
                let adopted = self
                    .store
                    .adopt_locations_for_hostname(&node.hostname, &node.id)
                    .await
                    .map_err(|e| OrchestratorError::Database(e.to_string()))?;
                if adopted > 0 {
                    info!(
                        "Re-pointed {} location(s) on '{}' to node {}",
                        adopted, node.hostname, node.id
                    );
                }
            }
            _ => {
                self.store
                    .upsert_node(node)
                    .await
                    .map_err(|e| OrchestratorError::Database(e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Aggregate live container stats for this host. A stats read that times
    /// out or fails is not fatal to the sync; that container contributes
    /// zero.
    async fn live_local_usage(&self) -> (f64, i64) {
        let containers = match self.docker.list_managed_containers(true).await {
            Ok(c) => c,
            Err(e) => {
                warn!("Could not list containers for usage aggregation: {}", e);
                return (0.0, 0);
            }
        };

        let mut used_cpu = 0.0;
        let mut used_memory = 0i64;
        for container in containers {
            let Some(id) = container.id.as_deref() else {
                continue;
            };
            let stats = tokio::time::timeout(
                Duration::from_secs(5),
                self.docker.container_stats(id),
            )
            .await;
            match stats {
                Ok(Ok(stats)) => {
                    used_cpu +=
                        cpu_percent_of(&stats, self.config.metrics.min_system_delta_ns) / 100.0;
                    used_memory += stats.memory_usage as i64;
                }
                Ok(Err(e)) => debug!("Stats for {} failed during sync: {}", id, e),
                Err(_) => debug!("Stats for {} timed out during sync", id),
            }
        }
        (used_cpu, used_memory)
    }
}

/// Picks one eligible node per placement request.
pub struct NodeSelector {
    store: Arc<Store>,
    synchronizer: Arc<FleetSynchronizer>,
    strategy: String,
}

impl NodeSelector {
    pub fn new(store: Arc<Store>, synchronizer: Arc<FleetSynchronizer>, strategy: &str) -> Self {
        Self {
            store,
            synchronizer,
            strategy: strategy.to_string(),
        }
    }

    /// Synchronize the inventory, then pick a node. Fails with
    /// `NoEligibleNode` when the eligibility filter yields nothing.
    pub async fn select(&self) -> OrchestratorResult<Node> {
        self.synchronizer.sync().await?;
        let nodes = self
            .store
            .list_nodes()
            .await
            .map_err(|e| OrchestratorError::Database(e.to_string()))?;
        let eligible: Vec<Node> = nodes.into_iter().filter(Node::is_eligible).collect();
        pick_node(eligible, &self.strategy).ok_or_else(|| {
            OrchestratorError::NoEligibleNode(format!(
                "no active, ready node below its deployment cap (strategy {})",
                self.strategy
            ))
        })
    }
}

/// Apply a named strategy to the eligible set. Unknown strategies fall back
/// to `least-loaded`.
pub fn pick_node(mut eligible: Vec<Node>, strategy: &str) -> Option<Node> {
    if eligible.is_empty() {
        return None;
    }
    match strategy {
        "resource-based" => {
            eligible
                .into_iter()
                .map(|n| (resource_score(&n), n))
                .max_by(|a, b| a.0.total_cmp(&b.0))
                .map(|(_, n)| n)
        }
        // round-robin degenerates to least-loaded within a single cycle
        // (sorting by deployment count rotates the fleet as counts grow),
        // and unknown strategies fall back to least-loaded too.
        _ => {
            eligible.sort_by(|a, b| {
                a.deployment_count
                    .cmp(&b.deployment_count)
                    .then(a.used_cpu.total_cmp(&b.used_cpu))
            });
            eligible.into_iter().next()
        }
    }
}

/// Weighted headroom score: free cpu and memory dominate, free deployment
/// slots break ties. Higher is better.
pub fn resource_score(node: &Node) -> f64 {
    let cpu_free = if node.total_cpu > 0.0 {
        1.0 - node.used_cpu / node.total_cpu
    } else {
        0.0
    };
    let mem_free = if node.total_memory > 0 {
        1.0 - node.used_memory as f64 / node.total_memory as f64
    } else {
        0.0
    };
    let slot_free = if node.max_deployments > 0 {
        1.0 - node.deployment_count as f64 / node.max_deployments as f64
    } else {
        0.0
    };
    0.4 * cpu_free + 0.4 * mem_free + 0.2 * slot_free
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn node(id: &str, deployments: i64, used_cpu: f64, used_mem: i64) -> Node {
        let now = Utc::now();
        Node {
            id: id.to_string(),
            hostname: id.to_string(),
            role: NodeRole::Worker,
            availability: NodeAvailability::Active,
            status: NodeStatus::Ready,
            total_cpu: 8.0,
            total_memory: 16_000_000_000,
            used_cpu,
            used_memory: used_mem,
            deployment_count: deployments,
            max_deployments: 100,
            labels: HashMap::new(),
            last_heartbeat: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn eligibility_requires_active_ready_and_capacity() {
        let mut n = node("a", 0, 0.0, 0);
        assert!(n.is_eligible());
        n.availability = NodeAvailability::Drain;
        assert!(!n.is_eligible());
        n.availability = NodeAvailability::Active;
        n.status = NodeStatus::Down;
        assert!(!n.is_eligible());
        n.status = NodeStatus::Ready;
        n.deployment_count = n.max_deployments;
        assert!(!n.is_eligible());
    }

    #[test]
    fn least_loaded_prefers_fewest_deployments_then_cpu() {
        let picked = pick_node(
            vec![
                node("busy", 10, 1.0, 0),
                node("idle", 2, 3.0, 0),
                node("idle-cool", 2, 1.0, 0),
            ],
            "least-loaded",
        )
        .unwrap();
        assert_eq!(picked.id, "idle-cool");
    }

    #[test]
    fn unknown_strategy_falls_back_to_least_loaded() {
        let picked = pick_node(
            vec![node("busy", 9, 0.0, 0), node("idle", 1, 0.0, 0)],
            "does-not-exist",
        )
        .unwrap();
        assert_eq!(picked.id, "idle");
    }

    #[test]
    fn resource_based_picks_highest_headroom() {
        let mut loaded = node("loaded", 50, 6.0, 12_000_000_000);
        loaded.max_deployments = 100;
        let fresh = node("fresh", 1, 0.5, 1_000_000_000);
        let picked = pick_node(vec![loaded, fresh], "resource-based").unwrap();
        assert_eq!(picked.id, "fresh");
    }

    #[test]
    fn resource_score_weights_match() {
        let n = node("n", 0, 0.0, 0);
        // Completely free node: 0.4 + 0.4 + 0.2.
        assert!((resource_score(&n) - 1.0).abs() < 1e-9);
        let full = node("full", 100, 8.0, 16_000_000_000);
        assert!(resource_score(&full).abs() < 1e-9);
    }

    #[test]
    fn empty_eligible_set_selects_nothing() {
        assert!(pick_node(vec![], "least-loaded").is_none());
    }
}
