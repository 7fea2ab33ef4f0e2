/*!
 * Container engine access for the orchestrator.
 *
 * Thin wrapper over the Docker API covering the container, network, exec and
 * swarm surfaces the lifecycle engine, sampler and reaper need. All methods
 * return orchestrator-level errors so callers can distinguish a missing
 * entity from an unreachable backend.
 */

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerInspectResponse, ContainerSummary, MountPointTypeEnum, Node as SwarmNode, Service,
    ServiceSpec, Task,
};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::node::ListNodesOptions;
use bollard::service::{InspectServiceOptions, ListServicesOptions, UpdateServiceOptions};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::labels::MANAGED_LABEL;

/// Container stats reduced to the counters the sampler consumes.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EngineStats {
    pub cpu_total: u64,
    pub cpu_system: u64,
    pub precpu_total: u64,
    pub precpu_system: u64,
    pub online_cpus: u64,
    pub memory_usage: u64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub disk_read: u64,
    pub disk_write: u64,
}

pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect to the local engine socket and verify it answers.
    pub async fn connect() -> OrchestratorResult<Self> {
        let docker = Docker::connect_with_socket_defaults()
            .map_err(|e| OrchestratorError::BackendUnavailable(e.to_string()))?;
        let version = docker.version().await?;
        info!(
            "Connected to container engine {}",
            version.version.unwrap_or_else(|| "unknown".to_string())
        );
        Ok(Self { docker })
    }

    /// Whether this host is a manager of an active swarm.
    pub async fn is_swarm_manager(&self) -> OrchestratorResult<bool> {
        let info = self.docker.info().await?;
        Ok(info
            .swarm
            .and_then(|s| s.control_available)
            .unwrap_or(false))
    }

    // ------------------------------------------------------------------
    // Containers
    // ------------------------------------------------------------------

    /// List containers carrying the managed label. `running_only` restricts
    /// to currently-running ones.
    pub async fn list_managed_containers(
        &self,
        running_only: bool,
    ) -> OrchestratorResult<Vec<ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}=true", MANAGED_LABEL)],
        );
        if running_only {
            filters.insert("status".to_string(), vec!["running".to_string()]);
        }
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: !running_only,
                filters,
                ..Default::default()
            }))
            .await?;
        Ok(containers)
    }

    /// List containers by an arbitrary label filter (`key=value`).
    pub async fn list_containers_with_label(
        &self,
        label_filter: &str,
        all: bool,
    ) -> OrchestratorResult<Vec<ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label_filter.to_string()]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all,
                filters,
                ..Default::default()
            }))
            .await?;
        Ok(containers)
    }

    /// Inspect a container; a missing container is `None`, not an error.
    pub async fn inspect_container(
        &self,
        id: &str,
    ) -> OrchestratorResult<Option<ContainerInspectResponse>> {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => Ok(Some(response)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn create_container(
        &self,
        name: &str,
        config: Config<String>,
    ) -> OrchestratorResult<String> {
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    platform: None,
                }),
                config,
            )
            .await?;
        Ok(response.id)
    }

    pub async fn start_container(&self, id: &str) -> OrchestratorResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    /// Stop with a grace timeout. Already-stopped and missing containers are
    /// treated as success.
    pub async fn stop_container(&self, id: &str, timeout_secs: i64) -> OrchestratorResult<()> {
        match self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: timeout_secs }))
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove_container(&self, id: &str, force: bool) -> OrchestratorResult<()> {
        match self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// One non-streaming stats read.
    pub async fn container_stats(&self, id: &str) -> OrchestratorResult<EngineStats> {
        let mut stream = self.docker.stats(
            id,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );
        match stream.next().await {
            Some(Ok(stats)) => Ok(reduce_stats(&stats)),
            Some(Err(e)) => Err(e.into()),
            None => Err(OrchestratorError::TransientStats(format!(
                "no stats frame for {}",
                id
            ))),
        }
    }

    /// Fetch recent log lines, e.g. to attach evidence to a rollback error.
    pub async fn container_logs_tail(&self, id: &str, tail: usize) -> OrchestratorResult<String> {
        let mut stream = self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                follow: false,
                ..Default::default()
            }),
        );
        let mut output = String::new();
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(log) => output.push_str(&log.to_string()),
                Err(e) => {
                    debug!("log stream for {} ended early: {}", id, e);
                    break;
                }
            }
        }
        Ok(output)
    }

    pub async fn exec(&self, id: &str, cmd: Vec<String>) -> OrchestratorResult<(i64, String)> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;
        let mut collected = String::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(Ok(frame)) = output.next().await {
                collected.push_str(&frame.to_string());
            }
        }
        let inspect = self.docker.inspect_exec(&exec.id).await?;
        Ok((inspect.exit_code.unwrap_or(-1), collected))
    }

    /// Pull an image when it is not present locally.
    pub async fn ensure_image(&self, image: &str) -> OrchestratorResult<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        info!("Pulling image {}", image);
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(frame) = stream.next().await {
            frame?;
        }
        Ok(())
    }

    /// Remove the named volumes attached to an inspected container.
    pub async fn remove_container_volumes(
        &self,
        inspect: &ContainerInspectResponse,
    ) -> OrchestratorResult<()> {
        let Some(mounts) = inspect.mounts.as_ref() else {
            return Ok(());
        };
        for mount in mounts {
            if mount.typ != Some(MountPointTypeEnum::VOLUME) {
                continue;
            }
            if let Some(name) = mount.name.as_ref() {
                match self.docker.remove_volume(name, None).await {
                    Ok(()) => debug!("Removed volume {}", name),
                    Err(bollard::errors::Error::DockerResponseServerError {
                        status_code: 404,
                        ..
                    }) => {}
                    Err(e) => warn!("Failed to remove volume {}: {}", name, e),
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Networks
    // ------------------------------------------------------------------

    /// Idempotent, race-safe network creation: a concurrent create by a peer
    /// process surfaces as a conflict and counts as success.
    pub async fn ensure_network(&self, name: &str, swarm_scope: bool) -> OrchestratorResult<()> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);
        let existing = self
            .docker
            .list_networks(Some(ListNetworksOptions { filters }))
            .await?;
        if existing.iter().any(|n| n.name.as_deref() == Some(name)) {
            return Ok(());
        }

        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: if swarm_scope { "overlay" } else { "bridge" }.to_string(),
            check_duplicate: true,
            attachable: true,
            ..Default::default()
        };
        match self.docker.create_network(options).await {
            Ok(_) => {
                info!("Created shared network {}", name);
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Discover the shared network as the engine knows it, in priority order:
    /// exact stack-prefixed name, any `*_<shared>` suffix, the unprefixed
    /// name, then the configured fallback literal.
    pub async fn resolve_shared_network(
        &self,
        stack_prefix: &str,
        shared: &str,
        fallback: &str,
    ) -> OrchestratorResult<String> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions<String>>)
            .await?;
        let names: Vec<String> = networks.into_iter().filter_map(|n| n.name).collect();

        let prefixed = format!("{}_{}", stack_prefix, shared);
        if names.iter().any(|n| n == &prefixed) {
            return Ok(prefixed);
        }
        let suffix = format!("_{}", shared);
        if let Some(found) = names.iter().find(|n| n.ends_with(&suffix)) {
            return Ok(found.clone());
        }
        if names.iter().any(|n| n == shared) {
            return Ok(shared.to_string());
        }
        warn!(
            "Shared network '{}' not found on the engine; falling back to literal '{}'",
            shared, fallback
        );
        Ok(fallback.to_string())
    }

    // ------------------------------------------------------------------
    // Swarm
    // ------------------------------------------------------------------

    pub async fn list_swarm_nodes(&self) -> OrchestratorResult<Vec<SwarmNode>> {
        let nodes = self
            .docker
            .list_nodes(None::<ListNodesOptions<String>>)
            .await?;
        Ok(nodes)
    }

    pub async fn create_service(&self, spec: ServiceSpec) -> OrchestratorResult<String> {
        let response = self.docker.create_service(spec, None).await?;
        response
            .id
            .ok_or_else(|| OrchestratorError::Internal("service create returned no id".into()))
    }

    pub async fn inspect_service(&self, name: &str) -> OrchestratorResult<Option<Service>> {
        match self
            .docker
            .inspect_service(name, None::<InspectServiceOptions>)
            .await
        {
            Ok(service) => Ok(Some(service)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn update_service(
        &self,
        name: &str,
        version: i64,
        spec: ServiceSpec,
    ) -> OrchestratorResult<()> {
        self.docker
            .update_service(
                name,
                spec,
                UpdateServiceOptions {
                    version: version.try_into().map_err(|_| {
                        OrchestratorError::Internal("service version out of range".into())
                    })?,
                    ..Default::default()
                },
                None,
            )
            .await?;
        Ok(())
    }

    pub async fn remove_service(&self, name: &str) -> OrchestratorResult<()> {
        match self.docker.delete_service(name).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_services(&self) -> OrchestratorResult<Vec<Service>> {
        let services = self
            .docker
            .list_services(None::<ListServicesOptions<String>>)
            .await?;
        Ok(services)
    }

    pub async fn tasks_for_service(&self, service_name: &str) -> OrchestratorResult<Vec<Task>> {
        let mut filters = HashMap::new();
        filters.insert("service".to_string(), vec![service_name.to_string()]);
        let tasks = self
            .docker
            .list_tasks(Some(bollard::task::ListTasksOptions { filters }))
            .await?;
        Ok(tasks)
    }
}

/// Reduce a raw stats frame to the counters the sampler works with.
fn reduce_stats(stats: &bollard::container::Stats) -> EngineStats {
    let (network_rx, network_tx) = stats
        .networks
        .as_ref()
        .map(|networks| {
            networks.values().fold((0u64, 0u64), |(rx, tx), n| {
                (rx + n.rx_bytes, tx + n.tx_bytes)
            })
        })
        .unwrap_or((0, 0));

    let (disk_read, disk_write) = stats
        .blkio_stats
        .io_service_bytes_recursive
        .as_ref()
        .map(|entries| {
            entries.iter().fold((0u64, 0u64), |(read, write), entry| {
                match entry.op.to_ascii_lowercase().as_str() {
                    "read" => (read + entry.value, write),
                    "write" => (read, write + entry.value),
                    _ => (read, write),
                }
            })
        })
        .unwrap_or((0, 0));

    EngineStats {
        cpu_total: stats.cpu_stats.cpu_usage.total_usage,
        cpu_system: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
        precpu_total: stats.precpu_stats.cpu_usage.total_usage,
        precpu_system: stats.precpu_stats.system_cpu_usage.unwrap_or(0),
        online_cpus: stats
            .cpu_stats
            .online_cpus
            .or(stats.precpu_stats.online_cpus)
            .map(|cpus| cpus as u64)
            .unwrap_or(1),
        memory_usage: stats.memory_stats.usage.unwrap_or(0),
        network_rx,
        network_tx,
        disk_read,
        disk_write,
    }
}

/// CPU usage percent derived from one stats frame, guarded against counter
/// wrap, sub-millisecond system deltas and impossible readings. Invalid
/// samples are reported as zero.
pub fn cpu_percent_of(stats: &EngineStats, min_system_delta_ns: u64) -> f64 {
    let cpu_delta = stats.cpu_total as i64 - stats.precpu_total as i64;
    let system_delta = stats.cpu_system as i64 - stats.precpu_system as i64;
    if system_delta < min_system_delta_ns as i64 || cpu_delta < 0 {
        return 0.0;
    }
    if system_delta == 0 {
        return 0.0;
    }
    let online = stats.online_cpus.max(1) as f64;
    let percent = cpu_delta as f64 / system_delta as f64 * online * 100.0;
    if percent > online * 100.0 {
        return 0.0;
    }
    percent
}

/// Whether an inspected container carries the managed label, read fresh from
/// the engine. Destructive paths must call this and refuse on false.
pub fn is_managed(inspect: &ContainerInspectResponse) -> bool {
    inspect
        .config
        .as_ref()
        .and_then(|c| c.labels.as_ref())
        .and_then(|labels| labels.get(MANAGED_LABEL))
        .map(|v| v == "true")
        .unwrap_or(false)
}

/// Label value lookup on an inspected container.
pub fn container_label<'a>(
    inspect: &'a ContainerInspectResponse,
    key: &str,
) -> Option<&'a String> {
    inspect
        .config
        .as_ref()
        .and_then(|c| c.labels.as_ref())
        .and_then(|labels| labels.get(key))
}

/// The host port the engine bound for a container port, if any.
pub fn bound_host_port(inspect: &ContainerInspectResponse, container_port: u16) -> Option<u16> {
    let ports = inspect.network_settings.as_ref()?.ports.as_ref()?;
    for (key, bindings) in ports {
        if !key.starts_with(&format!("{}/", container_port)) {
            continue;
        }
        if let Some(bindings) = bindings {
            for binding in bindings {
                if let Some(port) = binding.host_port.as_ref() {
                    if let Ok(parsed) = port.parse::<u16>() {
                        return Some(parsed);
                    }
                }
            }
        }
    }
    None
}
