/*!
 * Stray-container reaping and on-disk cleanup.
 *
 * A stray is a running container that carries the managed label but has no
 * matching location row on this node: it is stopped on sight and recorded,
 * and its volumes are purged once it has been stray for a week. The label
 * is always re-read from the engine before anything destructive happens.
 */

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::docker::{container_label, is_managed, DockerEngine};
use crate::labels::DEPLOYMENT_ID_LABEL;
use crate::store::Store;

const STRAY_STOP_TIMEOUT_SECS: i64 = 30;
const VOLUME_PURGE_AFTER_DAYS: i64 = 7;
const BUILD_HISTORY_RETENTION_DAYS: i64 = 30;

pub struct Reaper {
    store: Arc<Store>,
    docker: Arc<DockerEngine>,
    config: Arc<Config>,
    node_id: String,
}

impl Reaper {
    pub fn new(
        store: Arc<Store>,
        docker: Arc<DockerEngine>,
        config: Arc<Config>,
        node_id: String,
    ) -> Self {
        Self {
            store,
            docker,
            config,
            node_id,
        }
    }

    /// One full reaper pass: stop unaccounted managed containers, then purge
    /// volumes of strays past the retention window.
    pub async fn run_once(&self) -> Result<()> {
        self.stop_strays().await?;
        self.purge_old_stray_volumes().await?;
        Ok(())
    }

    async fn stop_strays(&self) -> Result<()> {
        let running = self.docker.list_managed_containers(true).await?;
        let known = self.store.container_ids_for_node(&self.node_id).await?;

        for container in running {
            let Some(container_id) = container.id else {
                continue;
            };
            if known.contains(&container_id) {
                continue;
            }
            warn!(
                "Stray managed container {} has no location on this node; stopping it",
                container_id
            );
            self.docker
                .stop_container(&container_id, STRAY_STOP_TIMEOUT_SECS)
                .await?;
            let recorded = self
                .store
                .insert_stray_if_absent(&container_id, &self.node_id, Utc::now())
                .await?;
            if recorded {
                info!("Recorded stray container {}", container_id);
            }
        }
        Ok(())
    }

    /// Strays older than a week lose their volumes: named volumes when the
    /// container still exists and still carries the managed label, and the
    /// per-deployment bind directories in all cases.
    async fn purge_old_stray_volumes(&self) -> Result<()> {
        let cutoff = Utc::now() - ChronoDuration::days(VOLUME_PURGE_AFTER_DAYS);
        let strays = self
            .store
            .strays_pending_volume_purge(&self.node_id, cutoff)
            .await?;

        for stray in strays {
            let mut deployment_id = None;
            match self.docker.inspect_container(&stray.container_id).await {
                Ok(Some(inspect)) => {
                    deployment_id = container_label(&inspect, DEPLOYMENT_ID_LABEL).cloned();
                    if is_managed(&inspect) {
                        info!("Purging volumes of stray container {}", stray.container_id);
                        self.docker.remove_container_volumes(&inspect).await.ok();
                        self.docker.remove_container(&stray.container_id, true).await.ok();
                    } else {
                        error!(
                            "SECURITY: stray {} lost its managed label; leaving volumes alone",
                            stray.container_id
                        );
                    }
                }
                Ok(None) => {
                    debug!(
                        "Stray container {} is already gone from the engine",
                        stray.container_id
                    );
                }
                Err(e) => {
                    warn!("Could not inspect stray {}: {}", stray.container_id, e);
                    continue;
                }
            }

            if let Some(deployment_id) = deployment_id {
                remove_bind_directories(&self.config, &deployment_id).await;
            }
            self.store
                .mark_stray_volumes_deleted(&stray.container_id, Utc::now())
                .await?;
        }
        Ok(())
    }

    /// Delete build history rows older than a month along with their log
    /// streams on disk.
    pub async fn cleanup_build_history(&self) -> Result<()> {
        let cutoff = Utc::now() - ChronoDuration::days(BUILD_HISTORY_RETENTION_DAYS);
        let log_paths = self.store.delete_build_history_before(cutoff).await?;
        for path in &log_paths {
            if let Err(e) = tokio::fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Could not remove build log {}: {}", path, e);
                }
            }
        }
        if !log_paths.is_empty() {
            info!(
                "Cleaned {} build history entr(ies) older than {} days",
                log_paths.len(),
                BUILD_HISTORY_RETENTION_DAYS
            );
        }
        Ok(())
    }

    /// Measure every deployment's on-disk volume footprint and upsert the
    /// result. Runs on its own slow cadence.
    pub async fn calculate_storage(&self) -> Result<()> {
        let volumes_root = PathBuf::from(&self.config.data_root).join("volumes");
        let mut entries = match tokio::fs::read_dir(&volumes_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let deployment_id = entry.file_name().to_string_lossy().into_owned();
            let bytes = directory_size(entry.path()).await;
            self.store
                .upsert_storage_usage(&deployment_id, bytes, Utc::now())
                .await?;
        }
        Ok(())
    }
}

/// Recursive directory size, iteratively to keep the future `Send` and the
/// stack flat.
async fn directory_size(root: PathBuf) -> i64 {
    let mut total = 0i64;
    let mut stack = vec![root];
    while let Some(dir) = stack.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if let Ok(metadata) = entry.metadata().await {
                total += metadata.len() as i64;
            }
        }
    }
    total
}

/// Remove a deployment's bind-mount directories under every configured
/// volume root. Missing directories are not errors.
async fn remove_bind_directories(config: &Config, deployment_id: &str) {
    for root in config.data_roots() {
        remove_dir_quietly(&root.join("volumes").join(deployment_id)).await;
    }
}

/// Purge every on-disk trace of a deployment: volumes, rendered manifests
/// and build workspace, across the primary root and all fallbacks.
pub async fn cleanup_deployment_data(config: &Config, deployment_id: &str) {
    for root in config.data_roots() {
        for subdir in ["volumes", "deployments", "builds"] {
            remove_dir_quietly(&root.join(subdir).join(deployment_id)).await;
        }
    }
    debug!("Cleaned on-disk data of deployment {}", deployment_id);
}

async fn remove_dir_quietly(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => debug!("Removed {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove {:?}: {}", path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn directory_size_walks_nested_trees() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        tokio::fs::create_dir_all(&nested).await.unwrap();
        tokio::fs::write(dir.path().join("top.bin"), vec![0u8; 100])
            .await
            .unwrap();
        tokio::fs::write(nested.join("deep.bin"), vec![0u8; 50])
            .await
            .unwrap();
        assert_eq!(directory_size(dir.path().to_path_buf()).await, 150);
    }

    #[tokio::test]
    async fn cleanup_tolerates_missing_directories() {
        let config = Config::default();
        // Nothing exists under the configured roots for this id; the call
        // must simply not error.
        cleanup_deployment_data(&config, "no-such-deployment").await;
    }
}
