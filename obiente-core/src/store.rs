use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite, SqlitePool};
use std::collections::{HashMap, HashSet};

use crate::types::{
    Deployment, DeploymentLocation, DeploymentRouting, HealthState, HealthcheckKind,
    HealthcheckSpec, HourlyUsage, LocationStatus, Node, NodeAvailability, NodeRole, NodeStatus,
    OrganizationPlan, RawSample, ResourceType, RoutingProtocol, StrayContainer, VmInstance,
    VmStatus,
};

/// Persistent state shared by all cooperating orchestrator processes. The
/// database is the single source of truth; every in-memory cache is derived.
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    pub async fn new(database_path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(database_path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if !std::path::Path::new(database_path).exists() {
            tokio::fs::write(database_path, "").await?;
        }

        let db_url = format!("sqlite:{}", database_path);
        tracing::debug!("Database URL: {}", db_url);
        let pool = SqlitePool::connect(&db_url).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                hostname TEXT NOT NULL,
                role TEXT NOT NULL,
                availability TEXT NOT NULL,
                status TEXT NOT NULL,
                total_cpu REAL NOT NULL,
                total_memory INTEGER NOT NULL,
                used_cpu REAL NOT NULL,
                used_memory INTEGER NOT NULL,
                deployment_count INTEGER NOT NULL,
                max_deployments INTEGER NOT NULL,
                labels TEXT NOT NULL,
                last_heartbeat TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                image TEXT,
                start_command TEXT,
                env_vars TEXT NOT NULL,
                labels TEXT NOT NULL,
                port INTEGER,
                memory_bytes INTEGER,
                cpu_shares INTEGER,
                replicas INTEGER,
                domain TEXT NOT NULL,
                healthcheck_type TEXT NOT NULL,
                healthcheck_port INTEGER,
                healthcheck_path TEXT,
                healthcheck_expected_status INTEGER,
                healthcheck_command TEXT,
                compose_yaml TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS deployment_routings (
                id TEXT PRIMARY KEY,
                deployment_id TEXT NOT NULL,
                service_name TEXT NOT NULL,
                domain TEXT NOT NULL,
                path_prefix TEXT,
                target_port INTEGER NOT NULL,
                protocol TEXT NOT NULL,
                ssl_enabled INTEGER NOT NULL,
                ssl_cert_resolver TEXT,
                middleware TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS deployment_locations (
                id TEXT PRIMARY KEY,
                deployment_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                node_hostname TEXT NOT NULL,
                container_id TEXT NOT NULL,
                status TEXT NOT NULL,
                port INTEGER,
                domain TEXT NOT NULL,
                health_status TEXT NOT NULL,
                cpu_usage REAL NOT NULL DEFAULT 0,
                memory_usage INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS organizations (
                id TEXT PRIMARY KEY,
                max_memory_bytes INTEGER,
                max_cpu_cores REAL,
                allow_inter_vm_communication INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS metrics_raw (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                resource_type TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                container_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                cpu_usage REAL NOT NULL,
                memory_usage INTEGER NOT NULL,
                network_rx_bytes INTEGER NOT NULL,
                network_tx_bytes INTEGER NOT NULL,
                disk_read_bytes INTEGER NOT NULL,
                disk_write_bytes INTEGER NOT NULL,
                request_count INTEGER NOT NULL,
                error_count INTEGER NOT NULL,
                timestamp TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS hourly_usage (
                resource_id TEXT NOT NULL,
                organization_id TEXT NOT NULL,
                hour TEXT NOT NULL,
                avg_cpu_usage REAL NOT NULL,
                avg_memory_usage REAL NOT NULL,
                bandwidth_rx_bytes INTEGER NOT NULL,
                bandwidth_tx_bytes INTEGER NOT NULL,
                disk_read_bytes INTEGER NOT NULL,
                disk_write_bytes INTEGER NOT NULL,
                request_count INTEGER NOT NULL,
                error_count INTEGER NOT NULL,
                sample_count INTEGER NOT NULL,
                PRIMARY KEY (resource_id, hour)
            );

            CREATE TABLE IF NOT EXISTS stray_containers (
                container_id TEXT PRIMARY KEY,
                node_id TEXT NOT NULL,
                stopped_at TEXT NOT NULL,
                volumes_deleted_at TEXT
            );

            CREATE TABLE IF NOT EXISTS vm_instances (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                instance_id TEXT,
                status TEXT NOT NULL,
                region TEXT NOT NULL,
                image TEXT NOT NULL,
                size TEXT NOT NULL,
                cpu_cores INTEGER NOT NULL,
                memory_bytes INTEGER NOT NULL,
                disk_bytes INTEGER NOT NULL,
                ipv4 TEXT NOT NULL,
                ipv6 TEXT NOT NULL,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS storage_usage (
                deployment_id TEXT PRIMARY KEY,
                bytes INTEGER NOT NULL,
                measured_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS build_history (
                id TEXT PRIMARY KEY,
                deployment_id TEXT NOT NULL,
                log_path TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_locations_node ON deployment_locations (node_id);
            CREATE INDEX IF NOT EXISTS idx_locations_deployment ON deployment_locations (deployment_id);
            CREATE INDEX IF NOT EXISTS idx_locations_hostname ON deployment_locations (node_hostname);
            CREATE INDEX IF NOT EXISTS idx_metrics_resource_ts ON metrics_raw (resource_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_metrics_ts ON metrics_raw (timestamp);
            CREATE INDEX IF NOT EXISTS idx_routings_deployment ON deployment_routings (deployment_id);
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    pub async fn upsert_node(&self, node: &Node) -> Result<()> {
        let labels = serde_json::to_string(&node.labels)?;
        sqlx::query(
            r#"
            INSERT INTO nodes (
                id, hostname, role, availability, status, total_cpu, total_memory,
                used_cpu, used_memory, deployment_count, max_deployments, labels,
                last_heartbeat, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                hostname = excluded.hostname,
                role = excluded.role,
                availability = excluded.availability,
                status = excluded.status,
                total_cpu = excluded.total_cpu,
                total_memory = excluded.total_memory,
                used_cpu = excluded.used_cpu,
                used_memory = excluded.used_memory,
                deployment_count = excluded.deployment_count,
                max_deployments = excluded.max_deployments,
                labels = excluded.labels,
                last_heartbeat = excluded.last_heartbeat,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&node.id)
        .bind(&node.hostname)
        .bind(node.role.as_str())
        .bind(node.availability.as_str())
        .bind(node.status.as_str())
        .bind(node.total_cpu)
        .bind(node.total_memory)
        .bind(node.used_cpu)
        .bind(node.used_memory)
        .bind(node.deployment_count)
        .bind(node.max_deployments)
        .bind(labels)
        .bind(node.last_heartbeat.to_rfc3339())
        .bind(node.created_at.to_rfc3339())
        .bind(node.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_node_by_hostname(&self, hostname: &str) -> Result<Option<Node>> {
        let row = sqlx::query("SELECT * FROM nodes WHERE hostname = ?")
            .bind(hostname)
            .fetch_optional(&self.pool)
            .await?;
        row.map(node_from_row).transpose()
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        let rows = sqlx::query("SELECT * FROM nodes ORDER BY hostname")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(node_from_row).collect()
    }

    pub async fn delete_node(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM nodes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Replace a node row whose hostname matches but whose id changed (a
    /// cluster re-initialization): the old row is deleted and the new one
    /// inserted in a single transaction, preserving hostname as identity.
    pub async fn replace_node_identity(&self, old_id: &str, node: &Node) -> Result<()> {
        let labels = serde_json::to_string(&node.labels)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM nodes WHERE id = ?")
            .bind(old_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO nodes (
                id, hostname, role, availability, status, total_cpu, total_memory,
                used_cpu, used_memory, deployment_count, max_deployments, labels,
                last_heartbeat, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&node.id)
        .bind(&node.hostname)
        .bind(node.role.as_str())
        .bind(node.availability.as_str())
        .bind(node.status.as_str())
        .bind(node.total_cpu)
        .bind(node.total_memory)
        .bind(node.used_cpu)
        .bind(node.used_memory)
        .bind(node.deployment_count)
        .bind(node.max_deployments)
        .bind(labels)
        .bind(node.last_heartbeat.to_rfc3339())
        .bind(node.created_at.to_rfc3339())
        .bind(node.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Remove rows for cluster nodes that no longer exist. Locally-registered
    /// nodes (`local-` prefixed ids) are never reaped by the cluster sync.
    pub async fn delete_swarm_nodes_except(&self, keep_ids: &[String]) -> Result<u64> {
        let existing = self.list_nodes().await?;
        let keep: HashSet<&str> = keep_ids.iter().map(|s| s.as_str()).collect();
        let mut removed = 0u64;
        for node in existing {
            if node.id.starts_with("local-") || keep.contains(node.id.as_str()) {
                continue;
            }
            self.delete_node(&node.id).await?;
            removed += 1;
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Deployments & routings
    // ------------------------------------------------------------------

    pub async fn get_deployment(&self, id: &str) -> Result<Option<Deployment>> {
        let row = sqlx::query("SELECT * FROM deployments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(deployment_from_row).transpose()
    }

    pub async fn get_routings(&self, deployment_id: &str) -> Result<Vec<DeploymentRouting>> {
        let rows = sqlx::query(
            "SELECT * FROM deployment_routings WHERE deployment_id = ? ORDER BY created_at",
        )
        .bind(deployment_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(routing_from_row).collect()
    }

    pub async fn get_organization_plan(&self, organization_id: &str) -> Result<OrganizationPlan> {
        let row = sqlx::query(
            "SELECT max_memory_bytes, max_cpu_cores, allow_inter_vm_communication
             FROM organizations WHERE id = ?",
        )
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => OrganizationPlan {
                organization_id: organization_id.to_string(),
                max_memory_bytes: row.get("max_memory_bytes"),
                max_cpu_cores: row.get("max_cpu_cores"),
                allow_inter_vm_communication: row.get::<i64, _>("allow_inter_vm_communication")
                    != 0,
            },
            None => OrganizationPlan {
                organization_id: organization_id.to_string(),
                ..Default::default()
            },
        })
    }

    // ------------------------------------------------------------------
    // Deployment locations
    // ------------------------------------------------------------------

    pub async fn insert_location(&self, location: &DeploymentLocation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO deployment_locations (
                id, deployment_id, node_id, node_hostname, container_id, status,
                port, domain, health_status, cpu_usage, memory_usage, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&location.id)
        .bind(&location.deployment_id)
        .bind(&location.node_id)
        .bind(&location.node_hostname)
        .bind(&location.container_id)
        .bind(location.status.as_str())
        .bind(location.port.map(|p| p as i64))
        .bind(&location.domain)
        .bind(location.health_status.as_str())
        .bind(location.cpu_usage)
        .bind(location.memory_usage)
        .bind(location.created_at.to_rfc3339())
        .bind(location.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_location(&self, id: &str) -> Result<Option<DeploymentLocation>> {
        let row = sqlx::query("SELECT * FROM deployment_locations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(location_from_row).transpose()
    }

    pub async fn locations_for_deployment(
        &self,
        deployment_id: &str,
    ) -> Result<Vec<DeploymentLocation>> {
        let rows = sqlx::query(
            "SELECT * FROM deployment_locations WHERE deployment_id = ? ORDER BY created_at",
        )
        .bind(deployment_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(location_from_row).collect()
    }

    pub async fn running_locations_for_node(&self, node_id: &str) -> Result<Vec<DeploymentLocation>> {
        let rows = sqlx::query(
            "SELECT * FROM deployment_locations WHERE node_id = ? AND status = 'running'",
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(location_from_row).collect()
    }

    pub async fn container_ids_for_node(&self, node_id: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query("SELECT container_id FROM deployment_locations WHERE node_id = ?")
            .bind(node_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("container_id"))
            .collect())
    }

    pub async fn count_running_locations_on_hostname(&self, hostname: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS c FROM deployment_locations
             WHERE node_hostname = ? AND status = 'running'",
        )
        .bind(hostname)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("c"))
    }

    /// Sampler-maintained usage totals for one hostname: (cores, bytes).
    pub async fn sum_location_usage_for_hostname(&self, hostname: &str) -> Result<(f64, i64)> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(cpu_usage), 0) AS cpu, COALESCE(SUM(memory_usage), 0) AS mem
             FROM deployment_locations WHERE node_hostname = ? AND status = 'running'",
        )
        .bind(hostname)
        .fetch_one(&self.pool)
        .await?;
        Ok((row.get::<f64, _>("cpu") / 100.0, row.get::<i64, _>("mem")))
    }

    pub async fn update_location_status(&self, id: &str, status: LocationStatus) -> Result<()> {
        sqlx::query("UPDATE deployment_locations SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_location_health(&self, id: &str, health: HealthState) -> Result<()> {
        sqlx::query("UPDATE deployment_locations SET health_status = ?, updated_at = ? WHERE id = ?")
            .bind(health.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_location_usage(
        &self,
        container_id: &str,
        cpu_usage: f64,
        memory_usage: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE deployment_locations SET cpu_usage = ?, memory_usage = ?, updated_at = ?
             WHERE container_id = ?",
        )
        .bind(cpu_usage)
        .bind(memory_usage)
        .bind(Utc::now().to_rfc3339())
        .bind(container_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_location_container(
        &self,
        id: &str,
        container_id: &str,
        port: Option<u16>,
        status: LocationStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE deployment_locations SET container_id = ?, port = ?, status = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(container_id)
        .bind(port.map(|p| p as i64))
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_location_stopped_by_container(&self, container_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE deployment_locations SET status = 'stopped', updated_at = ?
             WHERE container_id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(container_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_location(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM deployment_locations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Rewrite `node_id` on location rows whose stored hostname matches the
    /// re-identified node (synchronizer-driven reconciliation).
    pub async fn adopt_locations_for_hostname(
        &self,
        hostname: &str,
        new_node_id: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE deployment_locations SET node_id = ?, updated_at = ?
             WHERE node_hostname = ? AND node_id != ?",
        )
        .bind(new_node_id)
        .bind(Utc::now().to_rfc3339())
        .bind(hostname)
        .bind(new_node_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Raw samples (time-series store)
    // ------------------------------------------------------------------

    pub async fn insert_samples(&self, samples: &[RawSample]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for sample in samples {
            sqlx::query(
                r#"
                INSERT INTO metrics_raw (
                    resource_type, resource_id, container_id, node_id, cpu_usage,
                    memory_usage, network_rx_bytes, network_tx_bytes, disk_read_bytes,
                    disk_write_bytes, request_count, error_count, timestamp
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(sample.resource_type.as_str())
            .bind(&sample.resource_id)
            .bind(&sample.container_id)
            .bind(&sample.node_id)
            .bind(sample.cpu_usage)
            .bind(sample.memory_usage)
            .bind(sample.network_rx_bytes)
            .bind(sample.network_tx_bytes)
            .bind(sample.disk_read_bytes)
            .bind(sample.disk_write_bytes)
            .bind(sample.request_count)
            .bind(sample.error_count)
            .bind(sample.timestamp.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn resources_with_samples_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(ResourceType, String)>> {
        let rows = sqlx::query(
            "SELECT DISTINCT resource_type, resource_id FROM metrics_raw WHERE timestamp < ?",
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    ResourceType::parse(&row.get::<String, _>("resource_type")),
                    row.get::<String, _>("resource_id"),
                )
            })
            .collect())
    }

    pub async fn oldest_sample_before(
        &self,
        resource_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT MIN(timestamp) AS ts FROM metrics_raw WHERE resource_id = ? AND timestamp < ?",
        )
        .bind(resource_id)
        .bind(cutoff.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        Ok(row
            .get::<Option<String>, _>("ts")
            .and_then(|s| parse_ts(&s)))
    }

    pub async fn samples_in_range(
        &self,
        resource_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawSample>> {
        let rows = sqlx::query(
            "SELECT * FROM metrics_raw
             WHERE resource_id = ? AND timestamp >= ? AND timestamp < ?
             ORDER BY timestamp",
        )
        .bind(resource_id)
        .bind(start.to_rfc3339())
        .bind(end.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(sample_from_row).collect()
    }

    pub async fn delete_samples_in_range(
        &self,
        resource_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM metrics_raw WHERE resource_id = ? AND timestamp >= ? AND timestamp < ?",
        )
        .bind(resource_id)
        .bind(start.to_rfc3339())
        .bind(end.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn deployment_ids_with_samples_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT resource_id FROM metrics_raw
             WHERE resource_type = 'deployment' AND timestamp >= ? AND timestamp < ?",
        )
        .bind(start.to_rfc3339())
        .bind(end.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("resource_id"))
            .collect())
    }

    /// Resolve the owning organization of a metered resource.
    pub async fn organization_for_resource(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> Result<Option<String>> {
        let query = match resource_type {
            ResourceType::Vm => "SELECT organization_id FROM vm_instances WHERE id = ?",
            _ => "SELECT organization_id FROM deployments WHERE id = ?",
        };
        let row = sqlx::query(query)
            .bind(resource_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("organization_id")))
    }

    // ------------------------------------------------------------------
    // Hourly usage
    // ------------------------------------------------------------------

    pub async fn hourly_exists(&self, resource_id: &str, hour: DateTime<Utc>) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS c FROM hourly_usage WHERE resource_id = ? AND hour = ?",
        )
        .bind(resource_id)
        .bind(hour.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("c") > 0)
    }

    pub async fn delete_hourly(&self, resource_id: &str, hour: DateTime<Utc>) -> Result<()> {
        sqlx::query("DELETE FROM hourly_usage WHERE resource_id = ? AND hour = ?")
            .bind(resource_id)
            .bind(hour.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_hourly(&self, usage: &HourlyUsage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO hourly_usage (
                resource_id, organization_id, hour, avg_cpu_usage, avg_memory_usage,
                bandwidth_rx_bytes, bandwidth_tx_bytes, disk_read_bytes, disk_write_bytes,
                request_count, error_count, sample_count
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&usage.resource_id)
        .bind(&usage.organization_id)
        .bind(usage.hour.to_rfc3339())
        .bind(usage.avg_cpu_usage)
        .bind(usage.avg_memory_usage)
        .bind(usage.bandwidth_rx_bytes)
        .bind(usage.bandwidth_tx_bytes)
        .bind(usage.disk_read_bytes)
        .bind(usage.disk_write_bytes)
        .bind(usage.request_count)
        .bind(usage.error_count)
        .bind(usage.sample_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stray containers
    // ------------------------------------------------------------------

    /// Record a stray on first sighting. Returns true when a new row was
    /// written, false when the stray was already known.
    pub async fn insert_stray_if_absent(
        &self,
        container_id: &str,
        node_id: &str,
        stopped_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO stray_containers (container_id, node_id, stopped_at)
             VALUES (?, ?, ?)",
        )
        .bind(container_id)
        .bind(node_id)
        .bind(stopped_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn strays_pending_volume_purge(
        &self,
        node_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StrayContainer>> {
        let rows = sqlx::query(
            "SELECT * FROM stray_containers
             WHERE node_id = ? AND stopped_at <= ? AND volumes_deleted_at IS NULL",
        )
        .bind(node_id)
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(StrayContainer {
                    container_id: row.get("container_id"),
                    node_id: row.get("node_id"),
                    stopped_at: parse_ts(&row.get::<String, _>("stopped_at"))
                        .unwrap_or_else(Utc::now),
                    volumes_deleted_at: row
                        .get::<Option<String>, _>("volumes_deleted_at")
                        .and_then(|s| parse_ts(&s)),
                })
            })
            .collect()
    }

    pub async fn mark_stray_volumes_deleted(
        &self,
        container_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE stray_containers SET volumes_deleted_at = ? WHERE container_id = ?")
            .bind(at.to_rfc3339())
            .bind(container_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // VM instances
    // ------------------------------------------------------------------

    pub async fn insert_vm(&self, vm: &VmInstance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO vm_instances (
                id, organization_id, instance_id, status, region, image, size,
                cpu_cores, memory_bytes, disk_bytes, ipv4, ipv6, metadata,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&vm.id)
        .bind(&vm.organization_id)
        .bind(&vm.instance_id)
        .bind(vm.status.as_str())
        .bind(&vm.region)
        .bind(&vm.image)
        .bind(&vm.size)
        .bind(vm.cpu_cores)
        .bind(vm.memory_bytes)
        .bind(vm.disk_bytes)
        .bind(serde_json::to_string(&vm.ipv4)?)
        .bind(serde_json::to_string(&vm.ipv6)?)
        .bind(serde_json::to_string(&vm.metadata)?)
        .bind(vm.created_at.to_rfc3339())
        .bind(vm.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_vm(&self, id: &str) -> Result<Option<VmInstance>> {
        let row = sqlx::query("SELECT * FROM vm_instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(vm_from_row).transpose()
    }

    pub async fn update_vm_status(&self, id: &str, status: VmStatus) -> Result<()> {
        sqlx::query("UPDATE vm_instances SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_vm_instance_id(&self, id: &str, instance_id: &str) -> Result<()> {
        sqlx::query("UPDATE vm_instances SET instance_id = ?, updated_at = ? WHERE id = ?")
            .bind(instance_id)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_vm_ips(&self, id: &str, ipv4: &[String], ipv6: &[String]) -> Result<()> {
        sqlx::query("UPDATE vm_instances SET ipv4 = ?, ipv6 = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(ipv4)?)
            .bind(serde_json::to_string(ipv6)?)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_vm_metadata(&self, id: &str, metadata: &serde_json::Value) -> Result<()> {
        sqlx::query("UPDATE vm_instances SET metadata = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(metadata)?)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Storage usage & build history
    // ------------------------------------------------------------------

    pub async fn upsert_storage_usage(
        &self,
        deployment_id: &str,
        bytes: i64,
        measured_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO storage_usage (deployment_id, bytes, measured_at) VALUES (?, ?, ?)
            ON CONFLICT(deployment_id) DO UPDATE SET
                bytes = excluded.bytes,
                measured_at = excluded.measured_at
            "#,
        )
        .bind(deployment_id)
        .bind(bytes)
        .bind(measured_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete build history rows older than the cutoff and return the log
    /// paths that should be removed from disk alongside.
    pub async fn delete_build_history_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT log_path FROM build_history WHERE created_at < ?")
            .bind(cutoff.to_rfc3339())
            .fetch_all(&self.pool)
            .await?;
        let log_paths: Vec<String> = rows
            .into_iter()
            .filter_map(|row| row.get::<Option<String>, _>("log_path"))
            .collect();
        sqlx::query("DELETE FROM build_history WHERE created_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(log_paths)
    }
}

// ----------------------------------------------------------------------
// Row converters
// ----------------------------------------------------------------------

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn ts_or_epoch(s: String) -> DateTime<Utc> {
    parse_ts(&s).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn node_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Node> {
    let labels: HashMap<String, String> =
        serde_json::from_str(&row.get::<String, _>("labels")).unwrap_or_default();
    Ok(Node {
        id: row.get("id"),
        hostname: row.get("hostname"),
        role: NodeRole::parse(&row.get::<String, _>("role")),
        availability: NodeAvailability::parse(&row.get::<String, _>("availability")),
        status: NodeStatus::parse(&row.get::<String, _>("status")),
        total_cpu: row.get("total_cpu"),
        total_memory: row.get("total_memory"),
        used_cpu: row.get("used_cpu"),
        used_memory: row.get("used_memory"),
        deployment_count: row.get("deployment_count"),
        max_deployments: row.get("max_deployments"),
        labels,
        last_heartbeat: ts_or_epoch(row.get("last_heartbeat")),
        created_at: ts_or_epoch(row.get("created_at")),
        updated_at: ts_or_epoch(row.get("updated_at")),
    })
}

fn deployment_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Deployment> {
    let env_vars: HashMap<String, String> =
        serde_json::from_str(&row.get::<String, _>("env_vars")).unwrap_or_default();
    let labels: HashMap<String, String> =
        serde_json::from_str(&row.get::<String, _>("labels")).unwrap_or_default();
    Ok(Deployment {
        id: row.get("id"),
        organization_id: row.get("organization_id"),
        image: row.get("image"),
        start_command: row.get("start_command"),
        env_vars,
        labels,
        port: row.get::<Option<i64>, _>("port").map(|p| p as u16),
        memory_bytes: row.get("memory_bytes"),
        cpu_shares: row.get("cpu_shares"),
        replicas: row.get::<Option<i64>, _>("replicas").map(|r| r as u32),
        domain: row.get("domain"),
        healthcheck: HealthcheckSpec {
            kind: HealthcheckKind::parse(&row.get::<String, _>("healthcheck_type")),
            port: row
                .get::<Option<i64>, _>("healthcheck_port")
                .map(|p| p as u16),
            path: row.get("healthcheck_path"),
            expected_status: row
                .get::<Option<i64>, _>("healthcheck_expected_status")
                .map(|s| s as u16),
            custom_command: row.get("healthcheck_command"),
        },
        compose_yaml: row.get("compose_yaml"),
        created_at: ts_or_epoch(row.get("created_at")),
        updated_at: ts_or_epoch(row.get("updated_at")),
    })
}

fn routing_from_row(row: sqlx::sqlite::SqliteRow) -> Result<DeploymentRouting> {
    let middleware: serde_json::Value =
        serde_json::from_str(&row.get::<String, _>("middleware")).unwrap_or_default();
    Ok(DeploymentRouting {
        id: row.get("id"),
        deployment_id: row.get("deployment_id"),
        service_name: row.get("service_name"),
        domain: row.get("domain"),
        path_prefix: row.get("path_prefix"),
        target_port: row.get::<i64, _>("target_port") as u16,
        protocol: RoutingProtocol::parse(&row.get::<String, _>("protocol")),
        ssl_enabled: row.get::<i64, _>("ssl_enabled") != 0,
        ssl_cert_resolver: row.get("ssl_cert_resolver"),
        middleware,
        created_at: ts_or_epoch(row.get("created_at")),
        updated_at: ts_or_epoch(row.get("updated_at")),
    })
}

fn location_from_row(row: sqlx::sqlite::SqliteRow) -> Result<DeploymentLocation> {
    Ok(DeploymentLocation {
        id: row.get("id"),
        deployment_id: row.get("deployment_id"),
        node_id: row.get("node_id"),
        node_hostname: row.get("node_hostname"),
        container_id: row.get("container_id"),
        status: LocationStatus::parse(&row.get::<String, _>("status")),
        port: row.get::<Option<i64>, _>("port").map(|p| p as u16),
        domain: row.get("domain"),
        health_status: HealthState::parse(&row.get::<String, _>("health_status")),
        cpu_usage: row.get("cpu_usage"),
        memory_usage: row.get("memory_usage"),
        created_at: ts_or_epoch(row.get("created_at")),
        updated_at: ts_or_epoch(row.get("updated_at")),
    })
}

fn sample_from_row(row: sqlx::sqlite::SqliteRow) -> Result<RawSample> {
    Ok(RawSample {
        resource_type: ResourceType::parse(&row.get::<String, _>("resource_type")),
        resource_id: row.get("resource_id"),
        container_id: row.get("container_id"),
        node_id: row.get("node_id"),
        cpu_usage: row.get("cpu_usage"),
        memory_usage: row.get("memory_usage"),
        network_rx_bytes: row.get("network_rx_bytes"),
        network_tx_bytes: row.get("network_tx_bytes"),
        disk_read_bytes: row.get("disk_read_bytes"),
        disk_write_bytes: row.get("disk_write_bytes"),
        request_count: row.get("request_count"),
        error_count: row.get("error_count"),
        timestamp: ts_or_epoch(row.get("timestamp")),
    })
}

fn vm_from_row(row: sqlx::sqlite::SqliteRow) -> Result<VmInstance> {
    let ipv4: Vec<String> =
        serde_json::from_str(&row.get::<String, _>("ipv4")).unwrap_or_default();
    let ipv6: Vec<String> =
        serde_json::from_str(&row.get::<String, _>("ipv6")).unwrap_or_default();
    let metadata: serde_json::Value =
        serde_json::from_str(&row.get::<String, _>("metadata")).unwrap_or_default();
    Ok(VmInstance {
        id: row.get("id"),
        organization_id: row.get("organization_id"),
        instance_id: row.get("instance_id"),
        status: VmStatus::parse(&row.get::<String, _>("status")),
        region: row.get("region"),
        image: row.get("image"),
        size: row.get("size"),
        cpu_cores: row.get("cpu_cores"),
        memory_bytes: row.get("memory_bytes"),
        disk_bytes: row.get("disk_bytes"),
        ipv4,
        ipv6,
        metadata,
        created_at: ts_or_epoch(row.get("created_at")),
        updated_at: ts_or_epoch(row.get("updated_at")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> Store {
        let temp = tempfile::NamedTempFile::new().unwrap();
        let path = temp.path().to_str().unwrap().to_string();
        // Keep the file alive for the duration of the test.
        std::mem::forget(temp);
        Store::new(&path).await.unwrap()
    }

    fn sample_node(id: &str, hostname: &str) -> Node {
        let now = Utc::now();
        Node {
            id: id.to_string(),
            hostname: hostname.to_string(),
            role: NodeRole::Worker,
            availability: NodeAvailability::Active,
            status: NodeStatus::Ready,
            total_cpu: 8.0,
            total_memory: 16_000_000_000,
            used_cpu: 1.0,
            used_memory: 2_000_000_000,
            deployment_count: 3,
            max_deployments: 100,
            labels: HashMap::new(),
            last_heartbeat: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn node_upsert_and_replace_identity() {
        let store = test_store().await;
        let node = sample_node("old-id", "host-a");
        store.upsert_node(&node).await.unwrap();

        let mut replacement = sample_node("new-id", "host-a");
        replacement.deployment_count = 5;
        store
            .replace_node_identity("old-id", &replacement)
            .await
            .unwrap();

        let nodes = store.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "new-id");
        assert_eq!(nodes[0].deployment_count, 5);
    }

    #[tokio::test]
    async fn swarm_node_reaping_spares_local_rows() {
        let store = test_store().await;
        store
            .upsert_node(&sample_node("local-host-a", "host-a"))
            .await
            .unwrap();
        store
            .upsert_node(&sample_node("swarm-node-1", "host-b"))
            .await
            .unwrap();
        store
            .upsert_node(&sample_node("swarm-node-2", "host-c"))
            .await
            .unwrap();

        let removed = store
            .delete_swarm_nodes_except(&["swarm-node-1".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let remaining: Vec<String> = store
            .list_nodes()
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert!(remaining.contains(&"local-host-a".to_string()));
        assert!(remaining.contains(&"swarm-node-1".to_string()));
        assert!(!remaining.contains(&"swarm-node-2".to_string()));
    }

    #[tokio::test]
    async fn location_adoption_rewrites_node_id() {
        let store = test_store().await;
        let now = Utc::now();
        let location = DeploymentLocation {
            id: "loc-1".to_string(),
            deployment_id: "dep-1".to_string(),
            node_id: "stale-node".to_string(),
            node_hostname: "host-a".to_string(),
            container_id: "abc123".to_string(),
            status: LocationStatus::Running,
            port: Some(8080),
            domain: "app.example.com".to_string(),
            health_status: HealthState::Healthy,
            cpu_usage: 0.0,
            memory_usage: 0,
            created_at: now,
            updated_at: now,
        };
        store.insert_location(&location).await.unwrap();

        let adopted = store
            .adopt_locations_for_hostname("host-a", "fresh-node")
            .await
            .unwrap();
        assert_eq!(adopted, 1);

        let reloaded = store.get_location("loc-1").await.unwrap().unwrap();
        assert_eq!(reloaded.node_id, "fresh-node");
        assert_eq!(reloaded.port, Some(8080));
    }

    #[tokio::test]
    async fn stray_insert_is_first_sighting_only() {
        let store = test_store().await;
        let now = Utc::now();
        assert!(store
            .insert_stray_if_absent("c1", "node-1", now)
            .await
            .unwrap());
        assert!(!store
            .insert_stray_if_absent("c1", "node-1", now)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn hourly_rows_are_unique_per_resource_hour() {
        let store = test_store().await;
        let hour = Utc::now();
        let usage = HourlyUsage {
            resource_id: "dep-1".to_string(),
            organization_id: "org-1".to_string(),
            hour,
            avg_cpu_usage: 1.5,
            avg_memory_usage: 1024.0,
            bandwidth_rx_bytes: 10,
            bandwidth_tx_bytes: 20,
            disk_read_bytes: 0,
            disk_write_bytes: 0,
            request_count: 0,
            error_count: 0,
            sample_count: 12,
        };
        store.insert_hourly(&usage).await.unwrap();
        assert!(store.hourly_exists("dep-1", hour).await.unwrap());
        // Second insert for the same (resource, hour) violates the key.
        assert!(store.insert_hourly(&usage).await.is_err());

        store.delete_hourly("dep-1", hour).await.unwrap();
        assert!(!store.hourly_exists("dep-1", hour).await.unwrap());
    }
}
