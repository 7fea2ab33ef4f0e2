/*!
 * Deployment lifecycle engine.
 *
 * Consumes desired state (`Deployment` rows) and converges the engine's
 * actual state, recording each materialized replica as a
 * `DeploymentLocation`. Two materialization modes share this entry point:
 * direct containers on this host, or swarm services when clustered mode is
 * enabled. Compose manifests route through the compose deployer.
 *
 * Safety rule for every destructive path: the managed label is re-read from
 * the engine immediately before stop/remove, never trusted from memory.
 */

use bollard::container::Config as ContainerConfig;
use bollard::models::{
    HealthConfig, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::compose;
use crate::config::Config;
use crate::docker::{bound_host_port, is_managed, DockerEngine};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::fleet::{FleetSynchronizer, NodeSelector};
use crate::labels::{management_labels, router_labels};
use crate::reaper;
use crate::store::Store;
use crate::swarm;
use crate::types::{
    Deployment, DeploymentLocation, DeploymentRouting, HealthState, HealthcheckKind,
    HealthcheckSpec, LocationStatus, Node, OrganizationPlan,
};

const STOP_TIMEOUT_SECS: i64 = 10;

const HEALTHCHECK_INTERVAL_NS: i64 = 30_000_000_000;
const HEALTHCHECK_TIMEOUT_NS: i64 = 10_000_000_000;
const HEALTHCHECK_RETRIES: i64 = 3;
const HEALTHCHECK_START_PERIOD_NS: i64 = 40_000_000_000;

pub struct LifecycleEngine {
    pub(crate) store: Arc<Store>,
    pub(crate) docker: Arc<DockerEngine>,
    pub(crate) config: Arc<Config>,
    pub(crate) fleet: Arc<FleetSynchronizer>,
    pub(crate) selector: Arc<NodeSelector>,
}

/// Everything one replica needs to materialize, resolved once per create.
pub(crate) struct ReplicaSpec<'a> {
    pub deployment: &'a Deployment,
    pub routings: &'a [DeploymentRouting],
    pub service: &'a str,
    pub replica: u32,
    pub memory_bytes: Option<i64>,
    pub cpu_shares: Option<i64>,
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<Store>,
        docker: Arc<DockerEngine>,
        config: Arc<Config>,
        fleet: Arc<FleetSynchronizer>,
        selector: Arc<NodeSelector>,
    ) -> Self {
        Self {
            store,
            docker,
            config,
            fleet,
            selector,
        }
    }

    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Materialize a deployment: every `(service, replica)` pair becomes a
    /// container (direct mode) or a swarm service (clustered mode).
    pub async fn create(&self, deployment_id: &str) -> OrchestratorResult<Vec<DeploymentLocation>> {
        let deployment = self.load_deployment(deployment_id).await?;
        let routings = self
            .store
            .get_routings(deployment_id)
            .await
            .map_err(|e| OrchestratorError::Database(e.to_string()))?;
        let plan = self
            .store
            .get_organization_plan(&deployment.organization_id)
            .await
            .map_err(|e| OrchestratorError::Database(e.to_string()))?;

        if deployment.is_compose() {
            return compose::deploy(self, &deployment, &routings, &plan).await;
        }

        let node = self.selector.select().await?;
        self.docker
            .ensure_network(&self.config.node.shared_network, self.config.enable_swarm)
            .await?;

        let (memory_bytes, cpu_shares) = apply_plan_caps(&deployment, &plan);
        let services = service_names(&routings);
        let replicas = deployment.replicas.unwrap_or(1).max(1);

        if self.config.enable_swarm {
            return swarm::create_services(
                self,
                &deployment,
                &routings,
                &node,
                &services,
                replicas,
                memory_bytes,
                cpu_shares,
            )
            .await;
        }

        let mut locations = Vec::new();
        for service in &services {
            for replica in 0..replicas {
                let spec = ReplicaSpec {
                    deployment: &deployment,
                    routings: &routings,
                    service,
                    replica,
                    memory_bytes,
                    cpu_shares,
                };
                let location = self.create_replica(&spec, &node).await?;
                locations.push(location);
            }
        }
        info!(
            "Deployment {} materialized with {} replica(s) on {}",
            deployment_id,
            locations.len(),
            node.hostname
        );
        Ok(locations)
    }

    /// Create and start one container replica, recovering once from a name
    /// conflict by removing the colliding entity.
    pub(crate) async fn create_replica(
        &self,
        spec: &ReplicaSpec<'_>,
        node: &Node,
    ) -> OrchestratorResult<DeploymentLocation> {
        let deployment = spec.deployment;
        let image = deployment.image.as_deref().ok_or_else(|| {
            OrchestratorError::Config(format!("deployment {} has no image", deployment.id))
        })?;
        self.docker.ensure_image(image).await?;

        let container_port = resolve_container_port(spec.routings, spec.service, deployment.port);
        let router = router_labels(&deployment.id, spec.service, spec.routings);
        let has_router = !router.is_empty();

        let mut labels = management_labels(
            &deployment.id,
            spec.service,
            spec.replica,
            &deployment.domain,
            !spec.routings.is_empty(),
        );
        labels.extend(router);
        labels.extend(deployment.labels.clone());

        let health_port = resolve_health_port(spec.routings, spec.service, deployment.port);
        let healthcheck = build_healthcheck(
            &deployment.healthcheck,
            health_port,
            !spec.routings.is_empty(),
        );

        let config = self.container_config(
            spec,
            image,
            container_port,
            labels,
            healthcheck,
            has_router,
        );

        let name = container_name(&deployment.id, spec.service, spec.replica);
        let container_id = match self.docker.create_container(&name, config.clone()).await {
            Ok(id) => id,
            Err(OrchestratorError::NameInUse(_)) => {
                warn!(
                    "Container name {} already in use; removing the collision and retrying once",
                    name
                );
                self.docker.stop_container(&name, STOP_TIMEOUT_SECS).await?;
                self.docker.remove_container(&name, true).await?;
                self.docker.create_container(&name, config).await?
            }
            Err(e) => return Err(e),
        };
        self.docker.start_container(&container_id).await?;

        // The persisted port is the routing port when the edge router fronts
        // the service; otherwise whatever host port the engine picked.
        let resolved_port = if has_router {
            container_port
        } else {
            match self.docker.inspect_container(&container_id).await? {
                Some(inspect) => container_port
                    .and_then(|p| bound_host_port(&inspect, p))
                    .or(container_port),
                None => container_port,
            }
        };

        let now = Utc::now();
        let location = DeploymentLocation {
            id: Uuid::new_v4().to_string(),
            deployment_id: deployment.id.clone(),
            node_id: node.id.clone(),
            node_hostname: node.hostname.clone(),
            container_id,
            status: LocationStatus::Running,
            port: resolved_port,
            domain: deployment.domain.clone(),
            health_status: HealthState::Starting,
            cpu_usage: 0.0,
            memory_usage: 0,
            created_at: now,
            updated_at: now,
        };
        self.store
            .insert_location(&location)
            .await
            .map_err(|e| OrchestratorError::Database(e.to_string()))?;
        debug!(
            "Replica {}/{} of {} running as {}",
            spec.service, spec.replica, deployment.id, location.container_id
        );
        Ok(location)
    }

    fn container_config(
        &self,
        spec: &ReplicaSpec<'_>,
        image: &str,
        container_port: Option<u16>,
        labels: HashMap<String, String>,
        healthcheck: Option<HealthConfig>,
        has_router: bool,
    ) -> ContainerConfig<String> {
        let deployment = spec.deployment;

        // Deterministic env ordering keeps container diffs readable.
        let env: Vec<String> = deployment
            .env_vars
            .iter()
            .collect::<BTreeMap<_, _>>()
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let cmd = deployment
            .start_command
            .as_ref()
            .filter(|c| !c.trim().is_empty())
            .map(|c| vec!["/bin/sh".to_string(), "-c".to_string(), c.clone()]);

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        if let Some(port) = container_port {
            let key = format!("{}/tcp", port);
            exposed_ports.insert(key.clone(), HashMap::new());
            if !has_router {
                // Host port 0: the engine picks a free port.
                port_bindings.insert(
                    key,
                    Some(vec![PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: Some("0".to_string()),
                    }]),
                );
            }
        }

        let nano_cpu_quota = spec
            .cpu_shares
            .map(|shares| (shares as f64 / 1024.0 * 1e9) as i64);

        ContainerConfig {
            image: Some(image.to_string()),
            env: Some(env),
            cmd,
            labels: Some(labels),
            healthcheck,
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(HostConfig {
                port_bindings: if port_bindings.is_empty() {
                    None
                } else {
                    Some(port_bindings)
                },
                memory: spec.memory_bytes,
                cpu_shares: spec.cpu_shares,
                nano_cpus: nano_cpu_quota,
                network_mode: Some(self.config.node.shared_network.clone()),
                restart_policy: Some(RestartPolicy {
                    name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                    maximum_retry_count: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    // ------------------------------------------------------------------
    // Start / stop / restart
    // ------------------------------------------------------------------

    /// Start a deployment on demand. Missing locations are reconstructed
    /// from desired state; a location whose container disappeared gets
    /// exactly that replica recreated.
    pub async fn start(&self, deployment_id: &str) -> OrchestratorResult<Vec<DeploymentLocation>> {
        let deployment = self.load_deployment(deployment_id).await?;
        if deployment.is_compose() {
            return compose::start(self, &deployment).await;
        }

        let locations = self
            .store
            .locations_for_deployment(deployment_id)
            .await
            .map_err(|e| OrchestratorError::Database(e.to_string()))?;
        if locations.is_empty() {
            info!(
                "Start of {} found no locations; materializing from desired state",
                deployment_id
            );
            return self.create(deployment_id).await;
        }

        let routings = self
            .store
            .get_routings(deployment_id)
            .await
            .map_err(|e| OrchestratorError::Database(e.to_string()))?;
        let plan = self
            .store
            .get_organization_plan(&deployment.organization_id)
            .await
            .map_err(|e| OrchestratorError::Database(e.to_string()))?;
        let (memory_bytes, cpu_shares) = apply_plan_caps(&deployment, &plan);
        let node = self.selector.select().await?;
        let services = service_names(&routings);
        let replicas = deployment.replicas.unwrap_or(1).max(1);

        let mut out = Vec::new();
        for location in locations {
            match self.docker.inspect_container(&location.container_id).await? {
                Some(_) => {
                    self.docker.start_container(&location.container_id).await?;
                    self.store
                        .update_location_status(&location.id, LocationStatus::Running)
                        .await
                        .map_err(|e| OrchestratorError::Database(e.to_string()))?;
                    out.push(location);
                }
                None => {
                    // The container vanished underneath us: recreate exactly
                    // the replica whose deterministic name has no container,
                    // and retire the stale row.
                    let (service, replica) = self
                        .find_missing_replica(&deployment.id, &services, replicas)
                        .await
                        .unwrap_or_else(|| ("default".to_string(), 0));
                    warn!(
                        "Container {} for location {} is gone; recreating replica {}/{}",
                        location.container_id, location.id, service, replica
                    );
                    self.store
                        .delete_location(&location.id)
                        .await
                        .map_err(|e| OrchestratorError::Database(e.to_string()))?;
                    let spec = ReplicaSpec {
                        deployment: &deployment,
                        routings: &routings,
                        service: &service,
                        replica,
                        memory_bytes,
                        cpu_shares,
                    };
                    out.push(self.create_replica(&spec, &node).await?);
                }
            }
        }
        Ok(out)
    }

    /// The first expected `(service, replica)` pair whose deterministic
    /// container name resolves to nothing on the engine.
    async fn find_missing_replica(
        &self,
        deployment_id: &str,
        services: &[String],
        replicas: u32,
    ) -> Option<(String, u32)> {
        for service in services {
            for replica in 0..replicas {
                let name = container_name(deployment_id, service, replica);
                match self.docker.inspect_container(&name).await {
                    Ok(None) => return Some((service.clone(), replica)),
                    Ok(Some(_)) => {}
                    Err(_) => return None,
                }
            }
        }
        None
    }

    /// Stop every replica of a deployment. Idempotent.
    pub async fn stop(&self, deployment_id: &str) -> OrchestratorResult<()> {
        let deployment = self.load_deployment(deployment_id).await?;
        if deployment.is_compose() {
            return compose::stop(self, &deployment).await;
        }

        let locations = self
            .store
            .locations_for_deployment(deployment_id)
            .await
            .map_err(|e| OrchestratorError::Database(e.to_string()))?;
        for location in locations {
            self.docker
                .stop_container(&location.container_id, STOP_TIMEOUT_SECS)
                .await?;
            self.store
                .update_location_status(&location.id, LocationStatus::Stopped)
                .await
                .map_err(|e| OrchestratorError::Database(e.to_string()))?;
        }
        Ok(())
    }

    /// Restart by recreation so configuration changes take effect.
    pub async fn restart(&self, deployment_id: &str) -> OrchestratorResult<Vec<DeploymentLocation>> {
        let deployment = self.load_deployment(deployment_id).await?;
        if deployment.is_compose() {
            compose::stop(self, &deployment).await?;
            return compose::start(self, &deployment).await;
        }

        let locations = self
            .store
            .locations_for_deployment(deployment_id)
            .await
            .map_err(|e| OrchestratorError::Database(e.to_string()))?;
        for location in &locations {
            self.remove_location_container(location).await?;
            self.store
                .delete_location(&location.id)
                .await
                .map_err(|e| OrchestratorError::Database(e.to_string()))?;
        }
        self.create(deployment_id).await
    }

    // ------------------------------------------------------------------
    // Scale
    // ------------------------------------------------------------------

    /// Adjust the replica count. Scaling up has no placement story yet and
    /// is deliberately refused.
    pub async fn scale(&self, deployment_id: &str, replicas: u32) -> OrchestratorResult<()> {
        let locations = self
            .store
            .locations_for_deployment(deployment_id)
            .await
            .map_err(|e| OrchestratorError::Database(e.to_string()))?;
        let current = locations.len() as u32;

        if replicas > current {
            return Err(OrchestratorError::NotImplemented(format!(
                "scale up from {} to {} replicas",
                current, replicas
            )));
        }
        if replicas == current {
            return Ok(());
        }

        if self.config.enable_swarm {
            return swarm::scale_down(self, deployment_id, &locations, replicas).await;
        }

        for location in locations.iter().skip(replicas as usize) {
            self.remove_location_container(location).await?;
            self.store
                .delete_location(&location.id)
                .await
                .map_err(|e| OrchestratorError::Database(e.to_string()))?;
        }
        info!(
            "Scaled {} down from {} to {} replica(s)",
            deployment_id, current, replicas
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Tear a deployment down and purge its on-disk data. Containers that do
    /// not carry the managed label are refused and left untouched, as are
    /// their location rows.
    pub async fn delete(&self, deployment_id: &str) -> OrchestratorResult<()> {
        let _deployment = self.load_deployment(deployment_id).await?;
        if self.config.enable_swarm {
            // Covers plain services and stack-deployed compose services; a
            // bare per-container removal would race their supervisor.
            swarm::remove_services(self, deployment_id).await?;
        }

        let locations = self
            .store
            .locations_for_deployment(deployment_id)
            .await
            .map_err(|e| OrchestratorError::Database(e.to_string()))?;

        let mut refused = Vec::new();
        for location in locations {
            match self.remove_location_container(&location).await {
                Ok(()) => {
                    self.store
                        .delete_location(&location.id)
                        .await
                        .map_err(|e| OrchestratorError::Database(e.to_string()))?;
                }
                Err(OrchestratorError::UnmanagedEntity(msg)) => {
                    refused.push(msg);
                }
                Err(e) => return Err(e),
            }
        }

        reaper::cleanup_deployment_data(&self.config, deployment_id).await;

        if !refused.is_empty() {
            return Err(OrchestratorError::UnmanagedEntity(refused.join("; ")));
        }
        info!("Deployment {} deleted", deployment_id);
        Ok(())
    }

    /// Stop and remove the container behind a location, verifying the
    /// managed label fresh from the engine first.
    pub(crate) async fn remove_location_container(
        &self,
        location: &DeploymentLocation,
    ) -> OrchestratorResult<()> {
        let Some(inspect) = self.docker.inspect_container(&location.container_id).await? else {
            return Ok(());
        };
        if !is_managed(&inspect) {
            error!(
                "SECURITY: refusing to remove container {} for location {}: missing managed label",
                location.container_id, location.id
            );
            return Err(OrchestratorError::UnmanagedEntity(format!(
                "container {} lacks the managed label",
                location.container_id
            )));
        }
        self.docker
            .stop_container(&location.container_id, STOP_TIMEOUT_SECS)
            .await?;
        self.docker
            .remove_container(&location.container_id, true)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn load_deployment(&self, deployment_id: &str) -> OrchestratorResult<Deployment> {
        self.store
            .get_deployment(deployment_id)
            .await
            .map_err(|e| OrchestratorError::Database(e.to_string()))?
            .ok_or_else(|| {
                OrchestratorError::Config(format!("deployment {} not found", deployment_id))
            })
    }

    pub fn node_id(&self) -> String {
        self.fleet.local_node_id()
    }
}

// ----------------------------------------------------------------------
// Pure derivations
// ----------------------------------------------------------------------

/// Distinct routed service names, primary-normalized; `["default"]` when no
/// routing exists.
pub fn service_names(routings: &[DeploymentRouting]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for routing in routings {
        let name = if routing.service_name.is_empty() {
            "default".to_string()
        } else {
            routing.service_name.clone()
        };
        if !names.contains(&name) {
            names.push(name);
        }
    }
    if names.is_empty() {
        names.push("default".to_string());
    }
    names
}

/// The container port for a service: the matching routing's target port,
/// else the first routing's, else the deployment's declared port.
pub fn resolve_container_port(
    routings: &[DeploymentRouting],
    service: &str,
    deployment_port: Option<u16>,
) -> Option<u16> {
    if let Some(routing) = routings.iter().find(|r| r.matches_service(service)) {
        return Some(routing.target_port);
    }
    if let Some(first) = routings.first() {
        return Some(first.target_port);
    }
    deployment_port
}

/// The health-check port follows the same matching rule, but never falls
/// back to the deployment's declared port while any routing exists: a stale
/// deployment port must not be probed when the routing says otherwise.
pub fn resolve_health_port(
    routings: &[DeploymentRouting],
    service: &str,
    deployment_port: Option<u16>,
) -> Option<u16> {
    if let Some(routing) = routings.iter().find(|r| r.matches_service(service)) {
        return Some(routing.target_port);
    }
    if let Some(first) = routings.first() {
        return Some(first.target_port);
    }
    deployment_port
}

/// Healthcheck derivation table. `Unspecified` auto-installs a TCP probe
/// only when routings exist and a port was resolved.
pub fn build_healthcheck(
    spec: &HealthcheckSpec,
    port: Option<u16>,
    has_routings: bool,
) -> Option<HealthConfig> {
    // The routing-resolved port always wins while any routing exists; the
    // healthcheck's own declared port is only honored for unrouted
    // deployments.
    let probe_port = if has_routings { port } else { spec.port.or(port) };
    let test = match spec.kind {
        HealthcheckKind::Disabled => return None,
        HealthcheckKind::Tcp => {
            let port = probe_port?;
            vec![
                "CMD-SHELL".to_string(),
                format!("nc -z localhost {} || exit 1", port),
            ]
        }
        HealthcheckKind::Http => {
            let port = probe_port?;
            let path = spec.path.as_deref().unwrap_or("/");
            let expected = spec.expected_status.unwrap_or(200);
            vec![
                "CMD-SHELL".to_string(),
                format!(
                    "test \"$(wget -q -O /dev/null -S http://localhost:{}{} 2>&1 | awk '/^  HTTP/{{print $2}}' | tail -1)\" = \"{}\" || exit 1",
                    port, path, expected
                ),
            ]
        }
        HealthcheckKind::Custom => {
            let command = spec.custom_command.as_deref()?;
            vec!["CMD-SHELL".to_string(), command.to_string()]
        }
        HealthcheckKind::Unspecified => {
            if !has_routings {
                return None;
            }
            let port = probe_port?;
            vec![
                "CMD-SHELL".to_string(),
                format!("nc -z localhost {} || exit 1", port),
            ]
        }
    };
    Some(HealthConfig {
        test: Some(test),
        interval: Some(HEALTHCHECK_INTERVAL_NS),
        timeout: Some(HEALTHCHECK_TIMEOUT_NS),
        retries: Some(HEALTHCHECK_RETRIES),
        start_period: Some(HEALTHCHECK_START_PERIOD_NS),
        ..Default::default()
    })
}

/// Cap the deployment's requested resources by the organization plan.
pub fn apply_plan_caps(
    deployment: &Deployment,
    plan: &OrganizationPlan,
) -> (Option<i64>, Option<i64>) {
    let memory = match (deployment.memory_bytes, plan.max_memory_bytes) {
        (Some(requested), Some(cap)) => Some(requested.min(cap)),
        (Some(requested), None) => Some(requested),
        (None, cap) => cap,
    };
    let plan_shares = plan.max_cpu_cores.map(|cores| (cores * 1024.0) as i64);
    let cpu_shares = match (deployment.cpu_shares, plan_shares) {
        (Some(requested), Some(cap)) => Some(requested.min(cap)),
        (Some(requested), None) => Some(requested),
        (None, cap) => cap,
    };
    (memory, cpu_shares)
}

pub(crate) fn container_name(deployment_id: &str, service: &str, replica: u32) -> String {
    format!("obiente-{}-{}-{}", deployment_id, service, replica)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn routing(service: &str, port: u16) -> DeploymentRouting {
        let now = Utc::now();
        DeploymentRouting {
            id: format!("r-{}-{}", service, port),
            deployment_id: "d1".to_string(),
            service_name: service.to_string(),
            domain: "d1.example.com".to_string(),
            path_prefix: None,
            target_port: port,
            protocol: crate::types::RoutingProtocol::Http,
            ssl_enabled: false,
            ssl_cert_resolver: None,
            middleware: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn routing_port_wins_over_deployment_port() {
        let routings = vec![routing("default", 8080)];
        assert_eq!(
            resolve_container_port(&routings, "default", Some(3000)),
            Some(8080)
        );
        assert_eq!(
            resolve_health_port(&routings, "default", Some(3000)),
            Some(8080)
        );
    }

    #[test]
    fn health_port_never_uses_deployment_port_when_routings_exist() {
        // No routing matches "worker", so the first routing's port is used;
        // the deployment port must not leak in.
        let routings = vec![routing("api", 8080)];
        assert_eq!(
            resolve_health_port(&routings, "worker", Some(3000)),
            Some(8080)
        );
    }

    #[test]
    fn ports_fall_back_to_deployment_without_routings() {
        assert_eq!(resolve_container_port(&[], "default", Some(3000)), Some(3000));
        assert_eq!(resolve_health_port(&[], "default", Some(3000)), Some(3000));
        assert_eq!(resolve_container_port(&[], "default", None), None);
    }

    #[test]
    fn service_names_default_and_distinct() {
        assert_eq!(service_names(&[]), vec!["default".to_string()]);
        let routings = vec![routing("", 80), routing("api", 81), routing("api", 82)];
        assert_eq!(
            service_names(&routings),
            vec!["default".to_string(), "api".to_string()]
        );
    }

    #[test]
    fn unspecified_healthcheck_auto_installs_tcp_only_with_routings() {
        let spec = HealthcheckSpec::default();
        let check = build_healthcheck(&spec, Some(8080), true).unwrap();
        let test = check.test.unwrap();
        assert!(test[1].contains("8080"));
        assert_eq!(check.interval, Some(30_000_000_000));
        assert_eq!(check.start_period, Some(40_000_000_000));

        assert!(build_healthcheck(&spec, Some(8080), false).is_none());
        assert!(build_healthcheck(&spec, None, true).is_none());
    }

    #[test]
    fn declared_healthcheck_port_loses_to_routing_port() {
        let spec = HealthcheckSpec {
            kind: HealthcheckKind::Tcp,
            port: Some(3000),
            ..Default::default()
        };
        let routings = vec![routing("default", 8080)];
        let resolved = resolve_health_port(&routings, "default", Some(3000));
        let check = build_healthcheck(&spec, resolved, true).unwrap();
        let command = &check.test.unwrap()[1];
        assert!(command.contains("8080"));
        assert!(!command.contains("3000"));

        // Without routings the declared probe port is honored.
        let check = build_healthcheck(&spec, Some(9000), false).unwrap();
        assert!(check.test.unwrap()[1].contains("3000"));
    }

    #[test]
    fn disabled_healthcheck_yields_none() {
        let spec = HealthcheckSpec {
            kind: HealthcheckKind::Disabled,
            ..Default::default()
        };
        assert!(build_healthcheck(&spec, Some(80), true).is_none());
    }

    #[test]
    fn http_healthcheck_probes_expected_status() {
        let spec = HealthcheckSpec {
            kind: HealthcheckKind::Http,
            path: Some("/healthz".to_string()),
            expected_status: Some(204),
            ..Default::default()
        };
        let check = build_healthcheck(&spec, Some(8080), true).unwrap();
        let command = &check.test.unwrap()[1];
        assert!(command.contains("http://localhost:8080/healthz"));
        assert!(command.contains("204"));
    }

    #[test]
    fn plan_caps_take_minimum() {
        let now = Utc::now();
        let deployment = Deployment {
            id: "d1".to_string(),
            organization_id: "org".to_string(),
            image: Some("nginx".to_string()),
            start_command: None,
            env_vars: HashMap::new(),
            labels: HashMap::new(),
            port: None,
            memory_bytes: Some(4 * 1024 * 1024 * 1024),
            cpu_shares: Some(4096),
            replicas: None,
            domain: String::new(),
            healthcheck: HealthcheckSpec::default(),
            compose_yaml: None,
            created_at: now,
            updated_at: now,
        };
        let plan = OrganizationPlan {
            organization_id: "org".to_string(),
            max_memory_bytes: Some(1024 * 1024 * 1024),
            max_cpu_cores: Some(2.0),
            allow_inter_vm_communication: false,
        };
        let (memory, shares) = apply_plan_caps(&deployment, &plan);
        assert_eq!(memory, Some(1024 * 1024 * 1024));
        assert_eq!(shares, Some(2048));
    }
}
