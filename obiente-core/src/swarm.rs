/*!
 * Clustered-mode materialization.
 *
 * In swarm mode each routed service becomes a cluster service owning its
 * replicas across the fleet. Updates are start-first: new tasks must report
 * healthy before old ones drain, and a failed update rolls back to the
 * previous spec automatically. The first task's real container id is
 * awaited for a bounded window; when no task materializes in time a
 * synthetic `swarm-service-<name>` id is stored and the sampler skips it.
 */

use bollard::models::{
    EndpointPortConfig, EndpointPortConfigProtocolEnum, EndpointSpec, HealthConfig, Limit,
    NetworkAttachmentConfig, ServiceSpec, ServiceSpecMode, ServiceSpecModeReplicated,
    ServiceSpecRollbackConfig, ServiceSpecRollbackConfigOrderEnum, ServiceSpecUpdateConfig,
    ServiceSpecUpdateConfigFailureActionEnum, ServiceSpecUpdateConfigOrderEnum,
    ServiceUpdateStatusStateEnum, TaskSpec, TaskSpecContainerSpec, TaskSpecRestartPolicy,
    TaskSpecRestartPolicyConditionEnum, TaskSpecResources, TaskState,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::labels::{management_labels, router_labels, DEPLOYMENT_ID_LABEL, MANAGED_LABEL};
use crate::lifecycle::{
    build_healthcheck, resolve_container_port, resolve_health_port, LifecycleEngine,
};
use crate::types::{
    Deployment, DeploymentLocation, DeploymentRouting, HealthState, LocationStatus, Node,
};

/// Synthetic container id prefix stored when a service has no materialized
/// task yet. The metrics sampler skips these ids.
pub const SYNTHETIC_ID_PREFIX: &str = "swarm-service-";

const UPDATE_MONITOR_NS: i64 = 60_000_000_000;
const UPDATE_DELAY_NS: i64 = 10_000_000_000;
const TASK_WAIT_SECS: u64 = 60;

pub(crate) async fn create_services(
    engine: &LifecycleEngine,
    deployment: &Deployment,
    routings: &[DeploymentRouting],
    node: &Node,
    services: &[String],
    replicas: u32,
    memory_bytes: Option<i64>,
    cpu_shares: Option<i64>,
) -> OrchestratorResult<Vec<DeploymentLocation>> {
    let mut locations = Vec::new();
    for service in services {
        let name = service_name(&deployment.id, service);
        let spec = build_service_spec(
            engine,
            deployment,
            routings,
            service,
            &name,
            replicas,
            memory_bytes,
            cpu_shares,
        )?;

        match engine.docker.inspect_service(&name).await? {
            Some(existing) => {
                let version = existing
                    .version
                    .and_then(|v| v.index)
                    .unwrap_or_default() as i64;
                info!("Updating swarm service {} start-first", name);
                engine.docker.update_service(&name, version, spec).await?;
                await_update_outcome(engine, &name).await?;
            }
            None => match engine.docker.create_service(spec.clone()).await {
                Ok(_) => {}
                Err(OrchestratorError::NameInUse(_)) => {
                    warn!(
                        "Service name {} already in use; removing the collision and retrying once",
                        name
                    );
                    engine.docker.remove_service(&name).await?;
                    engine.docker.create_service(spec).await?;
                }
                Err(e) => return Err(e),
            },
        }

        let container_id = await_first_task(engine, &name).await;
        let container_port = resolve_container_port(routings, service, deployment.port);

        let now = Utc::now();
        let location = DeploymentLocation {
            id: Uuid::new_v4().to_string(),
            deployment_id: deployment.id.clone(),
            node_id: node.id.clone(),
            node_hostname: node.hostname.clone(),
            container_id: container_id
                .unwrap_or_else(|| format!("{}{}", SYNTHETIC_ID_PREFIX, name)),
            status: LocationStatus::Running,
            port: container_port,
            domain: deployment.domain.clone(),
            health_status: HealthState::Starting,
            cpu_usage: 0.0,
            memory_usage: 0,
            created_at: now,
            updated_at: now,
        };
        engine
            .store
            .insert_location(&location)
            .await
            .map_err(|e| OrchestratorError::Database(e.to_string()))?;
        locations.push(location);
    }
    Ok(locations)
}

fn build_service_spec(
    engine: &LifecycleEngine,
    deployment: &Deployment,
    routings: &[DeploymentRouting],
    service: &str,
    name: &str,
    replicas: u32,
    memory_bytes: Option<i64>,
    cpu_shares: Option<i64>,
) -> OrchestratorResult<ServiceSpec> {
    let image = deployment.image.as_deref().ok_or_else(|| {
        OrchestratorError::Config(format!("deployment {} has no image", deployment.id))
    })?;

    let router = router_labels(&deployment.id, service, routings);
    let has_router = !router.is_empty();
    let mut labels = management_labels(
        &deployment.id,
        service,
        0,
        &deployment.domain,
        !routings.is_empty(),
    );
    labels.extend(router);
    labels.extend(deployment.labels.clone());

    let env: Vec<String> = deployment
        .env_vars
        .iter()
        .collect::<BTreeMap<_, _>>()
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    let health_port = resolve_health_port(routings, service, deployment.port);
    let healthcheck: Option<HealthConfig> = build_healthcheck(
        &deployment.healthcheck,
        health_port,
        !routings.is_empty(),
    );

    let command = deployment
        .start_command
        .as_ref()
        .filter(|c| !c.trim().is_empty())
        .map(|c| vec!["/bin/sh".to_string(), "-c".to_string(), c.clone()]);

    let container_port = resolve_container_port(routings, service, deployment.port);
    // Router-backed services are reached over the shared overlay network;
    // only router-less services publish an engine-chosen ingress port.
    let endpoint_spec = match (has_router, container_port) {
        (false, Some(port)) => Some(EndpointSpec {
            ports: Some(vec![EndpointPortConfig {
                protocol: Some(EndpointPortConfigProtocolEnum::TCP),
                target_port: Some(port as i64),
                published_port: None,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        _ => None,
    };

    Ok(ServiceSpec {
        name: Some(name.to_string()),
        labels: Some(labels.clone()),
        task_template: Some(TaskSpec {
            container_spec: Some(TaskSpecContainerSpec {
                image: Some(image.to_string()),
                labels: Some(labels),
                command,
                env: Some(env),
                health_check: healthcheck,
                ..Default::default()
            }),
            restart_policy: Some(TaskSpecRestartPolicy {
                condition: Some(TaskSpecRestartPolicyConditionEnum::ANY),
                ..Default::default()
            }),
            resources: Some(TaskSpecResources {
                limits: Some(Limit {
                    memory_bytes,
                    nano_cpus: cpu_shares.map(|shares| (shares as f64 / 1024.0 * 1e9) as i64),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            networks: Some(vec![NetworkAttachmentConfig {
                target: Some(engine.config.node.shared_network.clone()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        mode: Some(ServiceSpecMode {
            replicated: Some(ServiceSpecModeReplicated {
                replicas: Some(replicas as i64),
            }),
            ..Default::default()
        }),
        update_config: Some(ServiceSpecUpdateConfig {
            parallelism: Some(1),
            delay: Some(UPDATE_DELAY_NS),
            failure_action: Some(ServiceSpecUpdateConfigFailureActionEnum::ROLLBACK),
            monitor: Some(UPDATE_MONITOR_NS),
            order: Some(ServiceSpecUpdateConfigOrderEnum::START_FIRST),
            ..Default::default()
        }),
        rollback_config: Some(ServiceSpecRollbackConfig {
            parallelism: Some(1),
            delay: Some(UPDATE_DELAY_NS),
            order: Some(ServiceSpecRollbackConfigOrderEnum::START_FIRST),
            ..Default::default()
        }),
        endpoint_spec,
        ..Default::default()
    })
}

/// Watch an in-flight update until it completes or fails. A failed update
/// rolled back by the cluster surfaces as `RolledBack` with the failing
/// task's captured logs attached.
async fn await_update_outcome(engine: &LifecycleEngine, name: &str) -> OrchestratorResult<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(TASK_WAIT_SECS * 2);
    loop {
        let Some(service) = engine.docker.inspect_service(name).await? else {
            return Ok(());
        };
        let Some(status) = service.update_status else {
            return Ok(());
        };
        let message = status.message.clone().unwrap_or_default();
        match status.state {
            Some(ServiceUpdateStatusStateEnum::COMPLETED) => {
                if message.contains("rollback") {
                    return rolled_back(engine, name, &message).await;
                }
                return Ok(());
            }
            Some(ServiceUpdateStatusStateEnum::PAUSED) => {
                return rolled_back(engine, name, &message).await;
            }
            _ => {
                if message.contains("rollback") {
                    return rolled_back(engine, name, &message).await;
                }
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

async fn rolled_back(
    engine: &LifecycleEngine,
    name: &str,
    message: &str,
) -> OrchestratorResult<()> {
    let mut evidence = String::new();
    if let Ok(tasks) = engine.docker.tasks_for_service(name).await {
        for task in tasks {
            let Some(status) = task.status.as_ref() else {
                continue;
            };
            if status.state != Some(TaskState::FAILED) && status.state != Some(TaskState::REJECTED)
            {
                continue;
            }
            if let Some(err) = status.err.as_ref() {
                evidence.push_str(err);
                evidence.push('\n');
            }
            if let Some(container_id) = status
                .container_status
                .as_ref()
                .and_then(|c| c.container_id.as_deref())
            {
                if let Ok(logs) = engine.docker.container_logs_tail(container_id, 50).await {
                    evidence.push_str(&logs);
                }
            }
            break;
        }
    }
    error!("Swarm update of {} rolled back: {}", name, message);
    Err(OrchestratorError::RolledBack(format!(
        "{}: {} {}",
        name,
        message,
        evidence.trim()
    )))
}

/// Poll for the first running task's container id for up to a minute.
async fn await_first_task(engine: &LifecycleEngine, name: &str) -> Option<String> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(TASK_WAIT_SECS);
    loop {
        if let Ok(tasks) = engine.docker.tasks_for_service(name).await {
            for task in tasks {
                let Some(status) = task.status.as_ref() else {
                    continue;
                };
                if status.state != Some(TaskState::RUNNING) {
                    continue;
                }
                if let Some(id) = status
                    .container_status
                    .as_ref()
                    .and_then(|c| c.container_id.clone())
                {
                    return Some(id);
                }
            }
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(
                "No task for service {} materialized within {}s; storing a synthetic id",
                name, TASK_WAIT_SECS
            );
            return None;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

/// Scale a deployment's services down to `replicas` and retire the surplus
/// location rows.
pub(crate) async fn scale_down(
    engine: &LifecycleEngine,
    deployment_id: &str,
    locations: &[DeploymentLocation],
    replicas: u32,
) -> OrchestratorResult<()> {
    for service in deployment_services(engine, deployment_id).await? {
        let Some(service_name) = service.spec.as_ref().and_then(|s| s.name.clone()) else {
            continue;
        };
        let version = service.version.and_then(|v| v.index).unwrap_or_default() as i64;
        let mut spec = service.spec.clone().unwrap_or_default();
        spec.mode = Some(ServiceSpecMode {
            replicated: Some(ServiceSpecModeReplicated {
                replicas: Some(replicas as i64),
            }),
            ..Default::default()
        });
        engine
            .docker
            .update_service(&service_name, version, spec)
            .await?;
    }

    for location in locations.iter().skip(replicas as usize) {
        engine
            .store
            .delete_location(&location.id)
            .await
            .map_err(|e| OrchestratorError::Database(e.to_string()))?;
    }
    Ok(())
}

/// Remove every swarm service belonging to a deployment, refusing services
/// that do not carry the managed label.
pub(crate) async fn remove_services(
    engine: &LifecycleEngine,
    deployment_id: &str,
) -> OrchestratorResult<()> {
    for service in deployment_services(engine, deployment_id).await? {
        let Some(spec) = service.spec.as_ref() else {
            continue;
        };
        let Some(name) = spec.name.as_deref() else {
            continue;
        };
        let managed = spec
            .labels
            .as_ref()
            .and_then(|l| l.get(MANAGED_LABEL))
            .map(|v| v == "true")
            .unwrap_or(false);
        if !managed {
            error!(
                "SECURITY: refusing to remove service {}: missing managed label",
                name
            );
            return Err(OrchestratorError::UnmanagedEntity(format!(
                "service {} lacks the managed label",
                name
            )));
        }
        engine.docker.remove_service(name).await?;
        info!("Removed swarm service {}", name);
    }
    Ok(())
}

async fn deployment_services(
    engine: &LifecycleEngine,
    deployment_id: &str,
) -> OrchestratorResult<Vec<bollard::models::Service>> {
    let services = engine.docker.list_services().await?;
    Ok(services
        .into_iter()
        .filter(|s| {
            s.spec
                .as_ref()
                .and_then(|spec| spec.labels.as_ref())
                .and_then(|labels| labels.get(DEPLOYMENT_ID_LABEL))
                .map(|id| id == deployment_id)
                .unwrap_or(false)
        })
        .collect())
}

pub(crate) fn service_name(deployment_id: &str, service: &str) -> String {
    format!("obiente-{}-{}", deployment_id, service)
}

/// Whether a stored container id is a synthetic placeholder rather than a
/// real engine id.
pub fn is_synthetic_id(container_id: &str) -> bool {
    container_id.starts_with(SYNTHETIC_ID_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_ids_are_recognizable() {
        assert!(is_synthetic_id("swarm-service-obiente-d1-default"));
        assert!(!is_synthetic_id("9f86d081884c"));
    }

    #[test]
    fn service_names_are_deterministic() {
        assert_eq!(service_name("d1", "api"), "obiente-d1-api");
    }
}
