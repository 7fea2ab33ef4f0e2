/*!
 * Compose-mode deployment.
 *
 * Multi-service manifests are sanitized, stamped with management and router
 * labels, written to a persistent deployment directory and handed to the
 * compose CLI (or `docker stack deploy` in swarm mode). Containers are then
 * discovered through the compose project label and reconciled into
 * `DeploymentLocation` rows with freshly-inspected status.
 */

use chrono::Utc;
use serde_yaml::Value;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::labels::{apply_labels_to_service, management_labels, router_labels, COMPOSE_PROJECT_LABEL};
use crate::lifecycle::{resolve_health_port, LifecycleEngine};
use crate::sanitize::sanitize_compose;
use crate::types::{
    Deployment, DeploymentLocation, DeploymentRouting, HealthState, LocationStatus,
    OrganizationPlan,
};

/// Engine label identifying the stack of a swarm-deployed container.
const STACK_NAMESPACE_LABEL: &str = "com.docker.stack.namespace";

pub(crate) async fn deploy(
    engine: &LifecycleEngine,
    deployment: &Deployment,
    routings: &[DeploymentRouting],
    plan: &OrganizationPlan,
) -> OrchestratorResult<Vec<DeploymentLocation>> {
    let yaml = deployment.compose_yaml.as_deref().ok_or_else(|| {
        OrchestratorError::Config(format!("deployment {} has no compose manifest", deployment.id))
    })?;
    let node = engine.selector.select().await?;
    engine
        .docker
        .ensure_network(&engine.config.node.shared_network, engine.config.enable_swarm)
        .await?;

    let project = project_name(&deployment.id);
    let router_backed = !routings.is_empty();
    let volume_base = PathBuf::from(&engine.config.data_root).join("volumes");

    let sanitized = sanitize_compose(
        yaml,
        &deployment.id,
        &volume_base,
        plan,
        engine.config.enable_swarm,
        router_backed,
    )?;
    for directory in &sanitized.bind_directories {
        if let Err(e) = tokio::fs::create_dir_all(directory).await {
            warn!("Could not create bind directory {:?}: {}", directory, e);
        }
    }

    let mut doc: Value = serde_yaml::from_str(&sanitized.yaml)?;
    decorate_services(engine, &mut doc, deployment, routings).await?;
    if engine.config.enable_swarm {
        wire_shared_network(engine, &mut doc, &project).await?;
    }
    let rendered = serde_yaml::to_string(&doc)?;

    let manifest = write_manifest(&engine.config, &deployment.id, &rendered).await?;
    run_deploy_command(engine, &manifest, &project).await?;

    // Replace stale rows; discovery below re-registers what actually runs.
    let stale = engine
        .store
        .locations_for_deployment(&deployment.id)
        .await
        .map_err(|e| OrchestratorError::Database(e.to_string()))?;
    for location in stale {
        engine
            .store
            .delete_location(&location.id)
            .await
            .map_err(|e| OrchestratorError::Database(e.to_string()))?;
    }

    let locations = reconcile(engine, deployment, routings, &node.id, &node.hostname, &project)
        .await?;
    info!(
        "Compose deployment {} is running {} container(s)",
        deployment.id,
        locations.len()
    );
    Ok(locations)
}

/// Stamp every service with the management label set, its router labels and
/// (opt-in) an auto TCP healthcheck.
async fn decorate_services(
    engine: &LifecycleEngine,
    doc: &mut Value,
    deployment: &Deployment,
    routings: &[DeploymentRouting],
) -> OrchestratorResult<()> {
    let swarm_mode = engine.config.enable_swarm;
    let auto_healthcheck = engine.config.compose.auto_healthcheck;
    let Some(services) = doc
        .as_mapping_mut()
        .and_then(|m| m.get_mut("services"))
        .and_then(Value::as_mapping_mut)
    else {
        return Err(OrchestratorError::Config(format!(
            "compose manifest of {} has no services",
            deployment.id
        )));
    };

    let names: Vec<String> = services
        .keys()
        .filter_map(|k| k.as_str().map(str::to_string))
        .collect();
    for name in names {
        let Some(service) = services.get_mut(name.as_str()) else {
            continue;
        };

        let mut labels = management_labels(
            &deployment.id,
            &name,
            0,
            &deployment.domain,
            !routings.is_empty(),
        );
        labels.extend(router_labels(&deployment.id, &name, routings));
        labels.extend(deployment.labels.clone());
        apply_labels_to_service(service, &labels, swarm_mode);

        if auto_healthcheck {
            inject_auto_healthcheck(service, &name, routings, deployment.port);
        }
    }
    Ok(())
}

/// Opt-in TCP probe for compose services that declare none themselves.
fn inject_auto_healthcheck(
    service: &mut Value,
    name: &str,
    routings: &[DeploymentRouting],
    deployment_port: Option<u16>,
) {
    let Some(map) = service.as_mapping_mut() else {
        return;
    };
    if map.contains_key("healthcheck") {
        return;
    }
    let Some(port) = resolve_health_port(routings, name, deployment_port) else {
        return;
    };

    let mut healthcheck = serde_yaml::Mapping::new();
    healthcheck.insert(
        Value::String("test".to_string()),
        Value::Sequence(vec![
            Value::String("CMD-SHELL".to_string()),
            Value::String(format!("nc -z localhost {} || exit 1", port)),
        ]),
    );
    healthcheck.insert(
        Value::String("interval".to_string()),
        Value::String("30s".to_string()),
    );
    healthcheck.insert(
        Value::String("timeout".to_string()),
        Value::String("10s".to_string()),
    );
    healthcheck.insert(Value::String("retries".to_string()), Value::Number(3.into()));
    healthcheck.insert(
        Value::String("start_period".to_string()),
        Value::String("40s".to_string()),
    );
    map.insert(
        Value::String("healthcheck".to_string()),
        Value::Mapping(healthcheck),
    );
}

/// Attach every service to the shared overlay network, injecting an
/// `external: true` network section under the name the engine actually
/// knows it by.
async fn wire_shared_network(
    engine: &LifecycleEngine,
    doc: &mut Value,
    project: &str,
) -> OrchestratorResult<()> {
    let shared = engine
        .docker
        .resolve_shared_network(
            project,
            &engine.config.node.shared_network,
            &engine.config.node.shared_network_fallback,
        )
        .await?;

    let Some(root) = doc.as_mapping_mut() else {
        return Ok(());
    };

    if let Some(services) = root.get_mut("services").and_then(Value::as_mapping_mut) {
        let names: Vec<String> = services
            .keys()
            .filter_map(|k| k.as_str().map(str::to_string))
            .collect();
        for name in names {
            let Some(service) = services.get_mut(name.as_str()).and_then(Value::as_mapping_mut)
            else {
                continue;
            };
            let networks = service
                .entry(Value::String("networks".to_string()))
                .or_insert_with(|| Value::Sequence(Vec::new()));
            if let Value::Sequence(list) = networks {
                let entry = Value::String(shared.clone());
                if !list.contains(&entry) {
                    list.push(entry);
                }
            }
        }
    }

    let mut external = serde_yaml::Mapping::new();
    external.insert(Value::String("external".to_string()), Value::Bool(true));
    let mut network_section = root
        .get("networks")
        .and_then(Value::as_mapping)
        .cloned()
        .unwrap_or_default();
    network_section.insert(Value::String(shared), Value::Mapping(external));
    root.insert(
        Value::String("networks".to_string()),
        Value::Mapping(network_section),
    );
    Ok(())
}

/// Persist the rendered manifest, trying the durable root first and the
/// fallback roots after.
async fn write_manifest(
    config: &Config,
    deployment_id: &str,
    rendered: &str,
) -> OrchestratorResult<PathBuf> {
    let mut last_error: Option<std::io::Error> = None;
    for root in config.data_roots() {
        let dir = root.join("deployments").join(deployment_id);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            last_error = Some(e);
            continue;
        }
        let path = dir.join("docker-compose.yml");
        match tokio::fs::write(&path, rendered).await {
            Ok(()) => {
                debug!("Wrote compose manifest to {:?}", path);
                return Ok(path);
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(OrchestratorError::Internal(format!(
        "no writable deployment directory: {}",
        last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no roots configured".to_string())
    )))
}

async fn run_deploy_command(
    engine: &LifecycleEngine,
    manifest: &PathBuf,
    project: &str,
) -> OrchestratorResult<()> {
    let output = if engine.config.enable_swarm {
        tokio::process::Command::new("docker")
            .args(["stack", "deploy", "-c"])
            .arg(manifest)
            .arg(project)
            .output()
            .await?
    } else {
        tokio::process::Command::new("docker")
            .args(["compose", "-f"])
            .arg(manifest)
            .args(["-p", project, "up", "-d", "--remove-orphans"])
            .output()
            .await?
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(OrchestratorError::BackendUnavailable(format!(
            "compose deploy of {} failed: {}",
            project, stderr
        )));
    }
    Ok(())
}

/// Register one location per discovered project container, with status taken
/// from a fresh inspect.
async fn reconcile(
    engine: &LifecycleEngine,
    deployment: &Deployment,
    routings: &[DeploymentRouting],
    node_id: &str,
    node_hostname: &str,
    project: &str,
) -> OrchestratorResult<Vec<DeploymentLocation>> {
    let containers = discover_project_containers(engine, project).await?;
    let mut locations = Vec::new();

    for container in containers {
        let Some(container_id) = container.id else {
            continue;
        };
        let Some(inspect) = engine.docker.inspect_container(&container_id).await? else {
            continue;
        };
        let running = inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        let service = container
            .labels
            .as_ref()
            .and_then(|l| l.get("com.docker.compose.service"))
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        let port = resolve_health_port(routings, &service, deployment.port);

        let now = Utc::now();
        let location = DeploymentLocation {
            id: Uuid::new_v4().to_string(),
            deployment_id: deployment.id.clone(),
            node_id: node_id.to_string(),
            node_hostname: node_hostname.to_string(),
            container_id,
            status: if running {
                LocationStatus::Running
            } else {
                LocationStatus::Stopped
            },
            port,
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

/// Find project containers by the compose (or stack) label, matching both
/// the original and lowercased project name case-insensitively.
async fn discover_project_containers(
    engine: &LifecycleEngine,
    project: &str,
) -> OrchestratorResult<Vec<bollard::models::ContainerSummary>> {
    let label = if engine.config.enable_swarm {
        STACK_NAMESPACE_LABEL
    } else {
        COMPOSE_PROJECT_LABEL
    };

    let mut candidates = Vec::new();
    for name in [project.to_string(), project.to_lowercase()] {
        let filter = format!("{}={}", label, name);
        let found = engine.docker.list_containers_with_label(&filter, true).await?;
        candidates.extend(found);
    }

    // Dedupe across the two filter passes and keep only true case-insensitive
    // project matches.
    let mut seen = std::collections::HashSet::new();
    Ok(candidates
        .into_iter()
        .filter(|c| {
            c.labels
                .as_ref()
                .and_then(|l| l.get(label))
                .map(|v| v.eq_ignore_ascii_case(project))
                .unwrap_or(false)
        })
        .filter(|c| match c.id.as_ref() {
            Some(id) => seen.insert(id.clone()),
            None => false,
        })
        .collect())
}

/// Start path for compose deployments: re-run the manifest if it is still on
/// disk, otherwise deploy from desired state.
pub(crate) async fn start(
    engine: &LifecycleEngine,
    deployment: &Deployment,
) -> OrchestratorResult<Vec<DeploymentLocation>> {
    let routings = engine
        .store
        .get_routings(&deployment.id)
        .await
        .map_err(|e| OrchestratorError::Database(e.to_string()))?;
    let plan = engine
        .store
        .get_organization_plan(&deployment.organization_id)
        .await
        .map_err(|e| OrchestratorError::Database(e.to_string()))?;
    deploy(engine, deployment, &routings, &plan).await
}

/// Stop every project container and mark the location rows stopped.
pub(crate) async fn stop(
    engine: &LifecycleEngine,
    deployment: &Deployment,
) -> OrchestratorResult<()> {
    let project = project_name(&deployment.id);
    let containers = discover_project_containers(engine, &project).await?;
    for container in containers {
        if let Some(id) = container.id {
            engine.docker.stop_container(&id, 10).await?;
            engine
                .store
                .mark_location_stopped_by_container(&id)
                .await
                .map_err(|e| OrchestratorError::Database(e.to_string()))?;
        }
    }
    Ok(())
}

pub(crate) fn project_name(deployment_id: &str) -> String {
    format!("obiente-{}", deployment_id.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_names_are_lowercase_and_prefixed() {
        assert_eq!(project_name("MyApp-123"), "obiente-myapp-123");
    }
}
