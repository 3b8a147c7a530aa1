///! Database layer using SQLite
///!
///! Provides persistent storage for VM contexts, backup chains, replication
///! jobs, failovers, the job log, schedules, flows and node enrollments.

pub mod migrations;

use skybridge_common::Result;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(database_url: &str) -> Result<Self> {
        // Create parent directory if needed
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            if let Some(parent) = Path::new(path).parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    skybridge_common::Error::System(format!("Failed to create DB directory: {}", e))
                })?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(32)
            .connect(database_url)
            .await
            .map_err(|e| {
                skybridge_common::Error::System(format!("Database connection failed: {}", e))
            })?;

        tracing::info!("Database connection established");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        migrations::run_migrations(&self.pool).await?;
        tracing::info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("Database connection closed");
    }

    /// Health check - verify database connectivity
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                skybridge_common::Error::System(format!("Database health check failed: {}", e))
            })?;
        Ok(())
    }
}

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn db_err(what: &str, e: sqlx::Error) -> skybridge_common::Error {
    skybridge_common::Error::System(format!("{}: {}", what, e))
}

/// VM context operations
pub mod contexts {
    use super::*;
    use serde::{Deserialize, Serialize};
    use sqlx::Row;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct VmContext {
        pub context_id: String,
        pub vmware_vm_id: String,
        pub vm_name: String,
        pub vcenter_host: String,
        pub datacenter: Option<String>,
        pub vm_path: String,
        pub credential_id: Option<String>,
        pub cpus: i64,
        pub memory_mb: i64,
        pub os_type: Option<String>,
        pub power_state: Option<String>,
        pub scheduler_enabled: bool,
        pub status: String,
        pub current_job_id: Option<String>,
        pub created_at: i64,
        pub updated_at: i64,
    }

    fn row_to_context(row: &sqlx::sqlite::SqliteRow) -> VmContext {
        VmContext {
            context_id: row.get("context_id"),
            vmware_vm_id: row.get("vmware_vm_id"),
            vm_name: row.get("vm_name"),
            vcenter_host: row.get("vcenter_host"),
            datacenter: row.get("datacenter"),
            vm_path: row.get("vm_path"),
            credential_id: row.get("credential_id"),
            cpus: row.get("cpus"),
            memory_mb: row.get("memory_mb"),
            os_type: row.get("os_type"),
            power_state: row.get("power_state"),
            scheduler_enabled: row.get::<i64, _>("scheduler_enabled") != 0,
            status: row.get("status"),
            current_job_id: row.get("current_job_id"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }

    pub async fn create(pool: &SqlitePool, ctx: &VmContext) -> Result<()> {
        sqlx::query(
            "INSERT INTO vm_replication_contexts
             (context_id, vmware_vm_id, vm_name, vcenter_host, datacenter, vm_path,
              credential_id, cpus, memory_mb, os_type, power_state, scheduler_enabled,
              status, current_job_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&ctx.context_id)
        .bind(&ctx.vmware_vm_id)
        .bind(&ctx.vm_name)
        .bind(&ctx.vcenter_host)
        .bind(&ctx.datacenter)
        .bind(&ctx.vm_path)
        .bind(&ctx.credential_id)
        .bind(ctx.cpus)
        .bind(ctx.memory_mb)
        .bind(&ctx.os_type)
        .bind(&ctx.power_state)
        .bind(ctx.scheduler_enabled as i64)
        .bind(&ctx.status)
        .bind(&ctx.current_job_id)
        .bind(ctx.created_at)
        .bind(ctx.updated_at)
        .execute(pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref d) if d.message().contains("UNIQUE") => {
                skybridge_common::Error::Conflict(format!(
                    "VM '{}' is already managed",
                    ctx.vm_name
                ))
            }
            other => db_err("Failed to create VM context", other),
        })?;

        Ok(())
    }

    pub async fn get(pool: &SqlitePool, context_id: &str) -> Result<VmContext> {
        let row = sqlx::query("SELECT * FROM vm_replication_contexts WHERE context_id = ?")
            .bind(context_id)
            .fetch_optional(pool)
            .await
            .map_err(|e| db_err("Failed to load VM context", e))?;

        row.map(|r| row_to_context(&r)).ok_or_else(|| {
            skybridge_common::Error::NotFound(format!("VM context '{}' not found", context_id))
        })
    }

    pub async fn get_by_name(pool: &SqlitePool, vm_name: &str) -> Result<VmContext> {
        let row = sqlx::query(
            "SELECT * FROM vm_replication_contexts WHERE vm_name = ? ORDER BY created_at LIMIT 1",
        )
        .bind(vm_name)
        .fetch_optional(pool)
        .await
        .map_err(|e| db_err("Failed to load VM context", e))?;

        row.map(|r| row_to_context(&r)).ok_or_else(|| {
            skybridge_common::Error::NotFound(format!("VM '{}' not found", vm_name))
        })
    }

    pub async fn get_by_vmware_id(pool: &SqlitePool, vmware_vm_id: &str) -> Result<VmContext> {
        let row = sqlx::query("SELECT * FROM vm_replication_contexts WHERE vmware_vm_id = ?")
            .bind(vmware_vm_id)
            .fetch_optional(pool)
            .await
            .map_err(|e| db_err("Failed to load VM context", e))?;

        row.map(|r| row_to_context(&r)).ok_or_else(|| {
            skybridge_common::Error::NotFound(format!("VM '{}' not found", vmware_vm_id))
        })
    }

    pub async fn list(pool: &SqlitePool) -> Result<Vec<VmContext>> {
        let rows = sqlx::query("SELECT * FROM vm_replication_contexts ORDER BY vm_name")
            .fetch_all(pool)
            .await
            .map_err(|e| db_err("Failed to list VM contexts", e))?;

        Ok(rows.iter().map(row_to_context).collect())
    }

    pub async fn update_status(pool: &SqlitePool, context_id: &str, status: &str) -> Result<()> {
        sqlx::query(
            "UPDATE vm_replication_contexts SET status = ?, updated_at = ? WHERE context_id = ?",
        )
        .bind(status)
        .bind(now())
        .bind(context_id)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to update VM context status", e))?;

        Ok(())
    }

    pub async fn update_inventory(
        pool: &SqlitePool,
        context_id: &str,
        cpus: i64,
        memory_mb: i64,
        os_type: Option<&str>,
        power_state: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE vm_replication_contexts
             SET cpus = ?, memory_mb = ?, os_type = ?, power_state = ?, updated_at = ?
             WHERE context_id = ?",
        )
        .bind(cpus)
        .bind(memory_mb)
        .bind(os_type)
        .bind(power_state)
        .bind(now())
        .bind(context_id)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to update VM inventory", e))?;

        Ok(())
    }

    /// Claim the single in-flight job slot for a context.
    /// Fails with Conflict when another job already holds the slot.
    pub async fn claim_job_slot(
        pool: &SqlitePool,
        context_id: &str,
        job_id: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE vm_replication_contexts
             SET current_job_id = ?, updated_at = ?
             WHERE context_id = ? AND current_job_id IS NULL",
        )
        .bind(job_id)
        .bind(now())
        .bind(context_id)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to claim job slot", e))?;

        if result.rows_affected() == 0 {
            let ctx = get(pool, context_id).await?;
            return Err(skybridge_common::Error::Conflict(format!(
                "VM '{}' already has an active job ({})",
                ctx.vm_name,
                ctx.current_job_id.unwrap_or_default()
            )));
        }

        Ok(())
    }

    /// Release the job slot; only the owning job may release it, and
    /// releasing an already-free slot is a no-op.
    pub async fn release_job_slot(
        pool: &SqlitePool,
        context_id: &str,
        job_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE vm_replication_contexts
             SET current_job_id = NULL, updated_at = ?
             WHERE context_id = ? AND current_job_id = ?",
        )
        .bind(now())
        .bind(context_id)
        .bind(job_id)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to release job slot", e))?;

        Ok(())
    }
}

/// Per-VM disk records used by replication and backup planning
pub mod disks {
    use super::*;
    use serde::{Deserialize, Serialize};
    use sqlx::Row;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct VmDiskRecord {
        pub id: String,
        pub context_id: String,
        pub disk_index: i64,
        pub size_gb: i64,
        pub datastore: Option<String>,
        pub vmdk_path: Option<String>,
        pub disk_change_id: String,
        pub updated_at: i64,
    }

    fn row_to_disk(row: &sqlx::sqlite::SqliteRow) -> VmDiskRecord {
        VmDiskRecord {
            id: row.get("id"),
            context_id: row.get("context_id"),
            disk_index: row.get("disk_index"),
            size_gb: row.get("size_gb"),
            datastore: row.get("datastore"),
            vmdk_path: row.get("vmdk_path"),
            disk_change_id: row.get("disk_change_id"),
            updated_at: row.get("updated_at"),
        }
    }

    pub async fn upsert(pool: &SqlitePool, disk: &VmDiskRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO vm_disks
             (id, context_id, disk_index, size_gb, datastore, vmdk_path, disk_change_id, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (context_id, disk_index) DO UPDATE SET
               size_gb = excluded.size_gb,
               datastore = excluded.datastore,
               vmdk_path = excluded.vmdk_path,
               updated_at = excluded.updated_at",
        )
        .bind(&disk.id)
        .bind(&disk.context_id)
        .bind(disk.disk_index)
        .bind(disk.size_gb)
        .bind(&disk.datastore)
        .bind(&disk.vmdk_path)
        .bind(&disk.disk_change_id)
        .bind(disk.updated_at)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to upsert VM disk", e))?;

        Ok(())
    }

    pub async fn list_for_context(
        pool: &SqlitePool,
        context_id: &str,
    ) -> Result<Vec<VmDiskRecord>> {
        let rows =
            sqlx::query("SELECT * FROM vm_disks WHERE context_id = ? ORDER BY disk_index")
                .bind(context_id)
                .fetch_all(pool)
                .await
                .map_err(|e| db_err("Failed to list VM disks", e))?;

        Ok(rows.iter().map(row_to_disk).collect())
    }

    pub async fn get(
        pool: &SqlitePool,
        context_id: &str,
        disk_index: i64,
    ) -> Result<VmDiskRecord> {
        let row = sqlx::query("SELECT * FROM vm_disks WHERE context_id = ? AND disk_index = ?")
            .bind(context_id)
            .bind(disk_index)
            .fetch_optional(pool)
            .await
            .map_err(|e| db_err("Failed to load VM disk", e))?;

        row.map(|r| row_to_disk(&r)).ok_or_else(|| {
            skybridge_common::Error::NotFound(format!(
                "disk {} of context '{}' not found",
                disk_index, context_id
            ))
        })
    }

    pub async fn set_change_id(
        pool: &SqlitePool,
        context_id: &str,
        disk_index: i64,
        change_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE vm_disks SET disk_change_id = ?, updated_at = ?
             WHERE context_id = ? AND disk_index = ?",
        )
        .bind(change_id)
        .bind(now())
        .bind(context_id)
        .bind(disk_index)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to update disk change id", e))?;

        Ok(())
    }
}

/// Backup chain persistence: backup contexts, parent jobs, per-disk children
pub mod backups {
    use super::*;
    use serde::{Deserialize, Serialize};
    use sqlx::Row;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct VmBackupContext {
        pub id: String,
        pub vm_name: String,
        pub repository_id: String,
        pub created_at: i64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct BackupJobRecord {
        pub id: String,
        pub vm_backup_context_id: String,
        pub vm_name: String,
        pub repository_id: String,
        pub backup_type: String,
        pub status: String,
        pub bytes_transferred: i64,
        pub progress_percent: f64,
        pub transfer_speed_bps: i64,
        pub current_phase: Option<String>,
        pub tags: Option<String>,
        pub error_message: Option<String>,
        pub started_at: i64,
        pub completed_at: Option<i64>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct BackupDiskRecord {
        pub id: String,
        pub backup_job_id: String,
        pub vm_backup_context_id: String,
        pub disk_index: i64,
        pub status: String,
        pub qcow2_path: String,
        pub nbd_port: Option<i64>,
        pub export_name: Option<String>,
        pub disk_change_id: String,
        pub bytes_transferred: i64,
        pub error_message: Option<String>,
        pub started_at: i64,
        pub completed_at: Option<i64>,
    }

    /// Child ids embed the disk index so listings and lookups can tell
    /// children from parents by naming convention alone.
    pub fn disk_record_id(backup_job_id: &str, disk_index: i64) -> String {
        format!("{}-disk{}", backup_job_id, disk_index)
    }

    /// Strip a `-disk<i>` suffix, resolving a child id to its parent id.
    pub fn parent_id_of(any_id: &str) -> &str {
        match any_id.rfind("-disk") {
            Some(pos) if any_id[pos + 5..].chars().all(|c| c.is_ascii_digit())
                && !any_id[pos + 5..].is_empty() =>
            {
                &any_id[..pos]
            }
            _ => any_id,
        }
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> BackupJobRecord {
        BackupJobRecord {
            id: row.get("id"),
            vm_backup_context_id: row.get("vm_backup_context_id"),
            vm_name: row.get("vm_name"),
            repository_id: row.get("repository_id"),
            backup_type: row.get("backup_type"),
            status: row.get("status"),
            bytes_transferred: row.get("bytes_transferred"),
            progress_percent: row.get("progress_percent"),
            transfer_speed_bps: row.get("transfer_speed_bps"),
            current_phase: row.get("current_phase"),
            tags: row.get("tags"),
            error_message: row.get("error_message"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        }
    }

    fn row_to_disk(row: &sqlx::sqlite::SqliteRow) -> BackupDiskRecord {
        BackupDiskRecord {
            id: row.get("id"),
            backup_job_id: row.get("backup_job_id"),
            vm_backup_context_id: row.get("vm_backup_context_id"),
            disk_index: row.get("disk_index"),
            status: row.get("status"),
            qcow2_path: row.get("qcow2_path"),
            nbd_port: row.get("nbd_port"),
            export_name: row.get("export_name"),
            disk_change_id: row.get("disk_change_id"),
            bytes_transferred: row.get("bytes_transferred"),
            error_message: row.get("error_message"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        }
    }

    /// Locate or lazily create the backup context for (vm_name, repository)
    pub async fn upsert_backup_context(
        pool: &SqlitePool,
        vm_name: &str,
        repository_id: &str,
    ) -> Result<VmBackupContext> {
        if let Some(row) = sqlx::query(
            "SELECT * FROM vm_backup_contexts WHERE vm_name = ? AND repository_id = ?",
        )
        .bind(vm_name)
        .bind(repository_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| db_err("Failed to load backup context", e))?
        {
            return Ok(VmBackupContext {
                id: row.get("id"),
                vm_name: row.get("vm_name"),
                repository_id: row.get("repository_id"),
                created_at: row.get("created_at"),
            });
        }

        let ctx = VmBackupContext {
            id: format!("vbc-{}", uuid::Uuid::new_v4()),
            vm_name: vm_name.to_string(),
            repository_id: repository_id.to_string(),
            created_at: now(),
        };

        sqlx::query(
            "INSERT INTO vm_backup_contexts (id, vm_name, repository_id, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&ctx.id)
        .bind(&ctx.vm_name)
        .bind(&ctx.repository_id)
        .bind(ctx.created_at)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to create backup context", e))?;

        Ok(ctx)
    }

    pub async fn insert_job(pool: &SqlitePool, job: &BackupJobRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO backup_jobs
             (id, vm_backup_context_id, vm_name, repository_id, backup_type, status,
              bytes_transferred, progress_percent, transfer_speed_bps, current_phase,
              tags, error_message, started_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(&job.vm_backup_context_id)
        .bind(&job.vm_name)
        .bind(&job.repository_id)
        .bind(&job.backup_type)
        .bind(&job.status)
        .bind(job.bytes_transferred)
        .bind(job.progress_percent)
        .bind(job.transfer_speed_bps)
        .bind(&job.current_phase)
        .bind(&job.tags)
        .bind(&job.error_message)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to insert backup job", e))?;

        Ok(())
    }

    pub async fn insert_disk(pool: &SqlitePool, disk: &BackupDiskRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO backup_disks
             (id, backup_job_id, vm_backup_context_id, disk_index, status, qcow2_path,
              nbd_port, export_name, disk_change_id, bytes_transferred, error_message,
              started_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&disk.id)
        .bind(&disk.backup_job_id)
        .bind(&disk.vm_backup_context_id)
        .bind(disk.disk_index)
        .bind(&disk.status)
        .bind(&disk.qcow2_path)
        .bind(disk.nbd_port)
        .bind(&disk.export_name)
        .bind(&disk.disk_change_id)
        .bind(disk.bytes_transferred)
        .bind(&disk.error_message)
        .bind(disk.started_at)
        .bind(disk.completed_at)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to insert backup disk", e))?;

        Ok(())
    }

    pub async fn get_job(pool: &SqlitePool, id: &str) -> Result<BackupJobRecord> {
        let row = sqlx::query("SELECT * FROM backup_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|e| db_err("Failed to load backup job", e))?;

        row.map(|r| row_to_job(&r)).ok_or_else(|| {
            skybridge_common::Error::NotFound(format!("backup '{}' not found", id))
        })
    }

    pub async fn list_jobs(
        pool: &SqlitePool,
        vm_name: Option<&str>,
        repository_id: Option<&str>,
    ) -> Result<Vec<BackupJobRecord>> {
        // User-facing listings present parents only; per-disk children live
        // in backup_disks and additionally carry the "-disk<i>" id suffix.
        let mut query = "SELECT * FROM backup_jobs WHERE 1=1".to_string();
        if vm_name.is_some() {
            query.push_str(" AND vm_name = ?");
        }
        if repository_id.is_some() {
            query.push_str(" AND repository_id = ?");
        }
        query.push_str(" ORDER BY started_at DESC");

        let mut sql_query = sqlx::query(&query);
        if let Some(name) = vm_name {
            sql_query = sql_query.bind(name);
        }
        if let Some(repo) = repository_id {
            sql_query = sql_query.bind(repo);
        }

        let rows = sql_query
            .fetch_all(pool)
            .await
            .map_err(|e| db_err("Failed to list backup jobs", e))?;

        Ok(rows.iter().map(row_to_job).collect())
    }

    pub async fn list_disks_for_job(
        pool: &SqlitePool,
        backup_job_id: &str,
    ) -> Result<Vec<BackupDiskRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM backup_disks WHERE backup_job_id = ? ORDER BY disk_index",
        )
        .bind(backup_job_id)
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("Failed to list backup disks", e))?;

        Ok(rows.iter().map(row_to_disk).collect())
    }

    pub async fn get_disk(
        pool: &SqlitePool,
        backup_job_id: &str,
        disk_index: i64,
    ) -> Result<BackupDiskRecord> {
        let row = sqlx::query(
            "SELECT * FROM backup_disks WHERE backup_job_id = ? AND disk_index = ?",
        )
        .bind(backup_job_id)
        .bind(disk_index)
        .fetch_optional(pool)
        .await
        .map_err(|e| db_err("Failed to load backup disk", e))?;

        row.map(|r| row_to_disk(&r)).ok_or_else(|| {
            skybridge_common::Error::NotFound(format!(
                "disk {} of backup '{}' not found",
                disk_index, backup_job_id
            ))
        })
    }

    /// Most recent completed child with a non-empty change id, used as the
    /// parent of the next incremental. Ties break on completed_at DESC.
    pub async fn latest_completed_disk(
        pool: &SqlitePool,
        vm_backup_context_id: &str,
        disk_index: i64,
    ) -> Result<Option<BackupDiskRecord>> {
        let row = sqlx::query(
            "SELECT * FROM backup_disks
             WHERE vm_backup_context_id = ? AND disk_index = ?
               AND status = 'completed' AND disk_change_id != ''
             ORDER BY completed_at DESC LIMIT 1",
        )
        .bind(vm_backup_context_id)
        .bind(disk_index)
        .fetch_optional(pool)
        .await
        .map_err(|e| db_err("Failed to resolve incremental parent", e))?;

        Ok(row.map(|r| row_to_disk(&r)))
    }

    /// Ordered completed chain for (backup context, disk index)
    pub async fn chain(
        pool: &SqlitePool,
        vm_backup_context_id: &str,
        disk_index: i64,
    ) -> Result<Vec<BackupDiskRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM backup_disks
             WHERE vm_backup_context_id = ? AND disk_index = ? AND status = 'completed'
             ORDER BY completed_at ASC",
        )
        .bind(vm_backup_context_id)
        .bind(disk_index)
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("Failed to load backup chain", e))?;

        Ok(rows.iter().map(row_to_disk).collect())
    }

    /// Idempotent per-disk completion. Returns false when the child had
    /// already left the running state.
    pub async fn complete_disk(
        pool: &SqlitePool,
        backup_job_id: &str,
        disk_index: i64,
        change_id: &str,
        bytes_transferred: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE backup_disks
             SET status = 'completed', disk_change_id = ?, bytes_transferred = ?,
                 completed_at = ?
             WHERE backup_job_id = ? AND disk_index = ? AND status = 'running'",
        )
        .bind(change_id)
        .bind(bytes_transferred)
        .bind(now())
        .bind(backup_job_id)
        .bind(disk_index)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to complete backup disk", e))?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn fail_disk(
        pool: &SqlitePool,
        backup_job_id: &str,
        disk_index: i64,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE backup_disks
             SET status = 'failed', error_message = ?, completed_at = ?
             WHERE backup_job_id = ? AND disk_index = ? AND status = 'running'",
        )
        .bind(error)
        .bind(now())
        .bind(backup_job_id)
        .bind(disk_index)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to fail backup disk", e))?;

        Ok(())
    }

    /// (total, completed, failed) child counts for a parent
    pub async fn disk_counts(pool: &SqlitePool, backup_job_id: &str) -> Result<(i64, i64, i64)> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total,
                    SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) AS completed,
                    SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed
             FROM backup_disks WHERE backup_job_id = ?",
        )
        .bind(backup_job_id)
        .fetch_one(pool)
        .await
        .map_err(|e| db_err("Failed to count backup disks", e))?;

        let total: i64 = row.get("total");
        let completed: i64 = row.get::<Option<i64>, _>("completed").unwrap_or(0);
        let failed: i64 = row.get::<Option<i64>, _>("failed").unwrap_or(0);
        Ok((total, completed, failed))
    }

    /// Terminal parent update; write-once (running -> terminal only)
    pub async fn set_job_status(
        pool: &SqlitePool,
        backup_job_id: &str,
        status: &str,
        error: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE backup_jobs
             SET status = ?, error_message = COALESCE(?, error_message), completed_at = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(status)
        .bind(error)
        .bind(now())
        .bind(backup_job_id)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to update backup job status", e))?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a parent and its children in one transaction
    pub async fn delete_job(pool: &SqlitePool, backup_job_id: &str) -> Result<()> {
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| db_err("Failed to open transaction", e))?;

        sqlx::query("DELETE FROM backup_disks WHERE backup_job_id = ?")
            .bind(backup_job_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("Failed to delete backup disks", e))?;

        sqlx::query("DELETE FROM backup_copies WHERE backup_job_id = ?")
            .bind(backup_job_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("Failed to delete backup copies", e))?;

        let result = sqlx::query("DELETE FROM backup_jobs WHERE id = ?")
            .bind(backup_job_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("Failed to delete backup job", e))?;

        if result.rows_affected() == 0 {
            return Err(skybridge_common::Error::NotFound(format!(
                "backup '{}' not found",
                backup_job_id
            )));
        }

        tx.commit()
            .await
            .map_err(|e| db_err("Failed to commit delete", e))?;

        Ok(())
    }

    /// Aggregate counters for GET /backups/stats
    pub async fn stats(pool: &SqlitePool) -> Result<(i64, i64, i64, i64)> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total,
                    SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) AS completed,
                    SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed,
                    SUM(bytes_transferred) AS bytes
             FROM backup_jobs",
        )
        .fetch_one(pool)
        .await
        .map_err(|e| db_err("Failed to compute backup stats", e))?;

        Ok((
            row.get("total"),
            row.get::<Option<i64>, _>("completed").unwrap_or(0),
            row.get::<Option<i64>, _>("failed").unwrap_or(0),
            row.get::<Option<i64>, _>("bytes").unwrap_or(0),
        ))
    }

    /// Atomic telemetry merge for a parent backup job; terminal status
    /// never regresses.
    pub async fn update_progress(
        pool: &SqlitePool,
        id: &str,
        update: &skybridge_common::TelemetryUpdate,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE backup_jobs SET
                bytes_transferred = COALESCE(?, bytes_transferred),
                progress_percent = COALESCE(?, progress_percent),
                transfer_speed_bps = COALESCE(?, transfer_speed_bps),
                current_phase = COALESCE(?, current_phase),
                status = CASE
                    WHEN status IN ('completed', 'failed', 'cancelled') THEN status
                    ELSE COALESCE(?, status)
                END,
                completed_at = CASE
                    WHEN status NOT IN ('completed', 'failed', 'cancelled')
                         AND ? IN ('completed', 'failed', 'cancelled') THEN ?
                    ELSE completed_at
                END
             WHERE id = ?",
        )
        .bind(update.bytes_transferred)
        .bind(update.progress_percent)
        .bind(update.transfer_speed_bps)
        .bind(&update.current_phase)
        .bind(&update.status)
        .bind(&update.status)
        .bind(now())
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to merge backup telemetry", e))?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn update_phase(pool: &SqlitePool, backup_job_id: &str, phase: &str) -> Result<()> {
        sqlx::query("UPDATE backup_jobs SET current_phase = ? WHERE id = ?")
            .bind(phase)
            .bind(backup_job_id)
            .execute(pool)
            .await
            .map_err(|e| db_err("Failed to update backup phase", e))?;

        Ok(())
    }

    /// All backup contexts recorded for a VM, across repositories
    pub async fn backup_contexts_for_vm(
        pool: &SqlitePool,
        vm_name: &str,
    ) -> Result<Vec<VmBackupContext>> {
        let rows = sqlx::query("SELECT * FROM vm_backup_contexts WHERE vm_name = ?")
            .bind(vm_name)
            .fetch_all(pool)
            .await
            .map_err(|e| db_err("Failed to list backup contexts", e))?;

        Ok(rows
            .iter()
            .map(|row| VmBackupContext {
                id: row.get("id"),
                vm_name: row.get("vm_name"),
                repository_id: row.get("repository_id"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    /// Distinct disk indexes with chain entries under a backup context
    pub async fn disk_indexes_for_context(
        pool: &SqlitePool,
        vm_backup_context_id: &str,
    ) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT DISTINCT disk_index FROM backup_disks
             WHERE vm_backup_context_id = ? ORDER BY disk_index",
        )
        .bind(vm_backup_context_id)
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("Failed to list disk indexes", e))?;

        Ok(rows.iter().map(|row| row.get("disk_index")).collect())
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct BackupCopyRecord {
        pub id: String,
        pub backup_job_id: String,
        pub policy_id: Option<String>,
        pub repository_id: String,
        pub status: String,
        pub error_message: Option<String>,
        pub created_at: i64,
        pub completed_at: Option<i64>,
    }

    fn row_to_copy(row: &sqlx::sqlite::SqliteRow) -> BackupCopyRecord {
        BackupCopyRecord {
            id: row.get("id"),
            backup_job_id: row.get("backup_job_id"),
            policy_id: row.get("policy_id"),
            repository_id: row.get("repository_id"),
            status: row.get("status"),
            error_message: row.get("error_message"),
            created_at: row.get("created_at"),
            completed_at: row.get("completed_at"),
        }
    }

    pub async fn insert_copy(pool: &SqlitePool, copy: &BackupCopyRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO backup_copies
             (id, backup_job_id, policy_id, repository_id, status, error_message,
              created_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&copy.id)
        .bind(&copy.backup_job_id)
        .bind(&copy.policy_id)
        .bind(&copy.repository_id)
        .bind(&copy.status)
        .bind(&copy.error_message)
        .bind(copy.created_at)
        .bind(copy.completed_at)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to insert backup copy", e))?;

        Ok(())
    }

    pub async fn list_copies(
        pool: &SqlitePool,
        backup_job_id: &str,
    ) -> Result<Vec<BackupCopyRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM backup_copies WHERE backup_job_id = ? ORDER BY created_at DESC",
        )
        .bind(backup_job_id)
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("Failed to list backup copies", e))?;

        Ok(rows.iter().map(row_to_copy).collect())
    }

    pub async fn finish_copy(
        pool: &SqlitePool,
        copy_id: &str,
        status: &str,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE backup_copies SET status = ?, error_message = ?, completed_at = ?
             WHERE id = ?",
        )
        .bind(status)
        .bind(error)
        .bind(now())
        .bind(copy_id)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to finish backup copy", e))?;

        Ok(())
    }
}

/// Replication job persistence
pub mod replications {
    use super::*;
    use serde::{Deserialize, Serialize};
    use sqlx::Row;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ReplicationJobRecord {
        pub id: String,
        pub context_id: String,
        pub vm_name: String,
        pub replication_type: String,
        pub status: String,
        pub bytes_transferred: i64,
        pub progress_percent: f64,
        pub transfer_speed_bps: i64,
        pub current_phase: Option<String>,
        pub error_message: Option<String>,
        pub created_at: i64,
        pub updated_at: i64,
        pub completed_at: Option<i64>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ReplicationVolumeRecord {
        pub id: String,
        pub replication_job_id: String,
        pub disk_index: i64,
        pub volume_id: String,
        pub mount_point: Option<String>,
        pub created_at: i64,
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> ReplicationJobRecord {
        ReplicationJobRecord {
            id: row.get("id"),
            context_id: row.get("context_id"),
            vm_name: row.get("vm_name"),
            replication_type: row.get("replication_type"),
            status: row.get("status"),
            bytes_transferred: row.get("bytes_transferred"),
            progress_percent: row.get("progress_percent"),
            transfer_speed_bps: row.get("transfer_speed_bps"),
            current_phase: row.get("current_phase"),
            error_message: row.get("error_message"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            completed_at: row.get("completed_at"),
        }
    }

    pub async fn insert(pool: &SqlitePool, job: &ReplicationJobRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO replication_jobs
             (id, context_id, vm_name, replication_type, status, bytes_transferred,
              progress_percent, transfer_speed_bps, current_phase, error_message,
              created_at, updated_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(&job.context_id)
        .bind(&job.vm_name)
        .bind(&job.replication_type)
        .bind(&job.status)
        .bind(job.bytes_transferred)
        .bind(job.progress_percent)
        .bind(job.transfer_speed_bps)
        .bind(&job.current_phase)
        .bind(&job.error_message)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.completed_at)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to insert replication job", e))?;

        Ok(())
    }

    pub async fn get(pool: &SqlitePool, id: &str) -> Result<ReplicationJobRecord> {
        let row = sqlx::query("SELECT * FROM replication_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|e| db_err("Failed to load replication job", e))?;

        row.map(|r| row_to_job(&r)).ok_or_else(|| {
            skybridge_common::Error::NotFound(format!("replication job '{}' not found", id))
        })
    }

    pub async fn list(pool: &SqlitePool, context_id: Option<&str>) -> Result<Vec<ReplicationJobRecord>> {
        let rows = match context_id {
            Some(ctx) => sqlx::query(
                "SELECT * FROM replication_jobs WHERE context_id = ? ORDER BY created_at DESC",
            )
            .bind(ctx)
            .fetch_all(pool)
            .await,
            None => {
                sqlx::query("SELECT * FROM replication_jobs ORDER BY created_at DESC")
                    .fetch_all(pool)
                    .await
            }
        }
        .map_err(|e| db_err("Failed to list replication jobs", e))?;

        Ok(rows.iter().map(row_to_job).collect())
    }

    pub async fn update_status(
        pool: &SqlitePool,
        id: &str,
        status: &str,
        error: Option<&str>,
    ) -> Result<()> {
        let completed_at = if skybridge_common::JobStatus::parse(status).is_terminal() {
            Some(now())
        } else {
            None
        };

        sqlx::query(
            "UPDATE replication_jobs
             SET status = ?, error_message = COALESCE(?, error_message),
                 completed_at = COALESCE(?, completed_at), updated_at = ?
             WHERE id = ?",
        )
        .bind(status)
        .bind(error)
        .bind(completed_at)
        .bind(now())
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to update replication job", e))?;

        Ok(())
    }

    /// Atomic telemetry merge. Progress fields take the pushed values;
    /// a terminal status never regresses to an earlier phase.
    pub async fn update_progress(
        pool: &SqlitePool,
        id: &str,
        update: &skybridge_common::TelemetryUpdate,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE replication_jobs SET
                bytes_transferred = COALESCE(?, bytes_transferred),
                progress_percent = COALESCE(?, progress_percent),
                transfer_speed_bps = COALESCE(?, transfer_speed_bps),
                current_phase = COALESCE(?, current_phase),
                status = CASE
                    WHEN status IN ('completed', 'failed', 'cancelled') THEN status
                    ELSE COALESCE(?, status)
                END,
                completed_at = CASE
                    WHEN status NOT IN ('completed', 'failed', 'cancelled')
                         AND ? IN ('completed', 'failed', 'cancelled') THEN ?
                    ELSE completed_at
                END,
                updated_at = ?
             WHERE id = ?",
        )
        .bind(update.bytes_transferred)
        .bind(update.progress_percent)
        .bind(update.transfer_speed_bps)
        .bind(&update.current_phase)
        .bind(&update.status)
        .bind(&update.status)
        .bind(now())
        .bind(now())
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to merge replication telemetry", e))?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn add_volume(pool: &SqlitePool, vol: &ReplicationVolumeRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO replication_volumes
             (id, replication_job_id, disk_index, volume_id, mount_point, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&vol.id)
        .bind(&vol.replication_job_id)
        .bind(vol.disk_index)
        .bind(&vol.volume_id)
        .bind(&vol.mount_point)
        .bind(vol.created_at)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to record replication volume", e))?;

        Ok(())
    }

    pub async fn list_volumes(
        pool: &SqlitePool,
        replication_job_id: &str,
    ) -> Result<Vec<ReplicationVolumeRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM replication_volumes WHERE replication_job_id = ? ORDER BY disk_index",
        )
        .bind(replication_job_id)
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("Failed to list replication volumes", e))?;

        Ok(rows
            .iter()
            .map(|row| ReplicationVolumeRecord {
                id: row.get("id"),
                replication_job_id: row.get("replication_job_id"),
                disk_index: row.get("disk_index"),
                volume_id: row.get("volume_id"),
                mount_point: row.get("mount_point"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    pub async fn record_change_id(
        pool: &SqlitePool,
        replication_job_id: &str,
        vm_path: &str,
        disk_id: &str,
        change_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO cbt_history (replication_job_id, vm_path, disk_id, change_id, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(replication_job_id)
        .bind(vm_path)
        .bind(disk_id)
        .bind(change_id)
        .bind(now())
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to record change id", e))?;

        Ok(())
    }

    /// Legacy single-disk lookup keyed by vm_path (and optional disk id)
    pub async fn latest_change_id_by_path(
        pool: &SqlitePool,
        vm_path: &str,
        disk_id: Option<&str>,
    ) -> Result<Option<String>> {
        let row = match disk_id {
            Some(d) => sqlx::query(
                "SELECT change_id FROM cbt_history WHERE vm_path = ? AND disk_id = ?
                 ORDER BY created_at DESC LIMIT 1",
            )
            .bind(vm_path)
            .bind(d)
            .fetch_optional(pool)
            .await,
            None => sqlx::query(
                "SELECT change_id FROM cbt_history WHERE vm_path = ?
                 ORDER BY created_at DESC LIMIT 1",
            )
            .bind(vm_path)
            .fetch_optional(pool)
            .await,
        }
        .map_err(|e| db_err("Failed to look up change id", e))?;

        Ok(row.map(|r| r.get("change_id")))
    }

    /// Delete a replication job with its volumes, mounts and CBT history.
    /// Failover jobs that reference it are nulled, not deleted.
    pub async fn delete(pool: &SqlitePool, id: &str) -> Result<()> {
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| db_err("Failed to open transaction", e))?;

        sqlx::query("UPDATE failover_jobs SET replication_job_id = NULL WHERE replication_job_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("Failed to detach failover references", e))?;

        sqlx::query("DELETE FROM cbt_history WHERE replication_job_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("Failed to delete CBT history", e))?;

        sqlx::query("DELETE FROM replication_volumes WHERE replication_job_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("Failed to delete replication volumes", e))?;

        let result = sqlx::query("DELETE FROM replication_jobs WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("Failed to delete replication job", e))?;

        if result.rows_affected() == 0 {
            return Err(skybridge_common::Error::NotFound(format!(
                "replication job '{}' not found",
                id
            )));
        }

        tx.commit()
            .await
            .map_err(|e| db_err("Failed to commit delete", e))?;

        Ok(())
    }
}

/// Failover job persistence
pub mod failovers {
    use super::*;
    use serde::{Deserialize, Serialize};
    use sqlx::Row;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct FailoverJobRecord {
        pub id: String,
        pub context_id: String,
        pub replication_job_id: Option<String>,
        pub vm_name: String,
        pub vmware_vm_id: String,
        pub failover_type: String,
        pub status: String,
        pub destination_vm_id: Option<String>,
        pub snapshot_id: Option<String>,
        pub error_message: Option<String>,
        pub created_at: i64,
        pub updated_at: i64,
        pub completed_at: Option<i64>,
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> FailoverJobRecord {
        FailoverJobRecord {
            id: row.get("id"),
            context_id: row.get("context_id"),
            replication_job_id: row.get("replication_job_id"),
            vm_name: row.get("vm_name"),
            vmware_vm_id: row.get("vmware_vm_id"),
            failover_type: row.get("failover_type"),
            status: row.get("status"),
            destination_vm_id: row.get("destination_vm_id"),
            snapshot_id: row.get("snapshot_id"),
            error_message: row.get("error_message"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            completed_at: row.get("completed_at"),
        }
    }

    pub async fn insert(pool: &SqlitePool, job: &FailoverJobRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO failover_jobs
             (id, context_id, replication_job_id, vm_name, vmware_vm_id, failover_type,
              status, destination_vm_id, snapshot_id, error_message, created_at,
              updated_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(&job.context_id)
        .bind(&job.replication_job_id)
        .bind(&job.vm_name)
        .bind(&job.vmware_vm_id)
        .bind(&job.failover_type)
        .bind(&job.status)
        .bind(&job.destination_vm_id)
        .bind(&job.snapshot_id)
        .bind(&job.error_message)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.completed_at)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to insert failover job", e))?;

        Ok(())
    }

    pub async fn get(pool: &SqlitePool, id: &str) -> Result<FailoverJobRecord> {
        let row = sqlx::query("SELECT * FROM failover_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|e| db_err("Failed to load failover job", e))?;

        row.map(|r| row_to_job(&r)).ok_or_else(|| {
            skybridge_common::Error::NotFound(format!("failover job '{}' not found", id))
        })
    }

    pub async fn list(pool: &SqlitePool) -> Result<Vec<FailoverJobRecord>> {
        let rows = sqlx::query("SELECT * FROM failover_jobs ORDER BY created_at DESC")
            .fetch_all(pool)
            .await
            .map_err(|e| db_err("Failed to list failover jobs", e))?;

        Ok(rows.iter().map(row_to_job).collect())
    }

    /// Most recent failover of a flavor for a VM, used by rollback decisions
    pub async fn latest_for_vm(
        pool: &SqlitePool,
        vm_name: &str,
        failover_type: &str,
    ) -> Result<Option<FailoverJobRecord>> {
        let row = sqlx::query(
            "SELECT * FROM failover_jobs WHERE vm_name = ? AND failover_type = ?
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(vm_name)
        .bind(failover_type)
        .fetch_optional(pool)
        .await
        .map_err(|e| db_err("Failed to load failover job", e))?;

        Ok(row.map(|r| row_to_job(&r)))
    }

    pub async fn update_state(
        pool: &SqlitePool,
        id: &str,
        status: &str,
        destination_vm_id: Option<&str>,
        snapshot_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let completed_at = match status {
            "completed" | "failed" | "rolled_back" => Some(now()),
            _ => None,
        };

        sqlx::query(
            "UPDATE failover_jobs
             SET status = ?,
                 destination_vm_id = COALESCE(?, destination_vm_id),
                 snapshot_id = COALESCE(?, snapshot_id),
                 error_message = COALESCE(?, error_message),
                 completed_at = COALESCE(?, completed_at),
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(status)
        .bind(destination_vm_id)
        .bind(snapshot_id)
        .bind(error)
        .bind(completed_at)
        .bind(now())
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to update failover job", e))?;

        Ok(())
    }

    pub async fn clear_snapshot(pool: &SqlitePool, id: &str) -> Result<()> {
        sqlx::query("UPDATE failover_jobs SET snapshot_id = NULL, updated_at = ? WHERE id = ?")
            .bind(now())
            .bind(id)
            .execute(pool)
            .await
            .map_err(|e| db_err("Failed to clear failover snapshot", e))?;

        Ok(())
    }
}

/// Durable job log used by the tracker
pub mod jobs {
    use super::*;
    use serde::{Deserialize, Serialize};
    use sqlx::Row;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct JobRecord {
        pub id: String,
        pub external_id: Option<String>,
        pub context_id: Option<String>,
        pub job_type: String,
        pub operation: String,
        pub owner: String,
        pub status: String,
        pub cancel_requested: bool,
        pub metadata: Option<String>,
        pub error_message: Option<String>,
        /// Canonical taxonomy name from the error that ended the job
        pub error_category: Option<String>,
        pub started_at: i64,
        pub completed_at: Option<i64>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct StepRecord {
        pub id: i64,
        pub job_id: String,
        pub seq: i64,
        pub name: String,
        pub status: String,
        pub error_message: Option<String>,
        pub started_at: i64,
        pub completed_at: Option<i64>,
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> JobRecord {
        JobRecord {
            id: row.get("id"),
            external_id: row.get("external_id"),
            context_id: row.get("context_id"),
            job_type: row.get("job_type"),
            operation: row.get("operation"),
            owner: row.get("owner"),
            status: row.get("status"),
            cancel_requested: row.get::<i64, _>("cancel_requested") != 0,
            metadata: row.get("metadata"),
            error_message: row.get("error_message"),
            error_category: row.get("error_category"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        }
    }

    fn row_to_step(row: &sqlx::sqlite::SqliteRow) -> StepRecord {
        StepRecord {
            id: row.get("id"),
            job_id: row.get("job_id"),
            seq: row.get("seq"),
            name: row.get("name"),
            status: row.get("status"),
            error_message: row.get("error_message"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        }
    }

    pub async fn insert(pool: &SqlitePool, job: &JobRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO job_tracking
             (id, external_id, context_id, job_type, operation, owner, status,
              cancel_requested, metadata, error_message, error_category,
              started_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(&job.external_id)
        .bind(&job.context_id)
        .bind(&job.job_type)
        .bind(&job.operation)
        .bind(&job.owner)
        .bind(&job.status)
        .bind(job.cancel_requested as i64)
        .bind(&job.metadata)
        .bind(&job.error_message)
        .bind(&job.error_category)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to insert job", e))?;

        Ok(())
    }

    pub async fn get(pool: &SqlitePool, id: &str) -> Result<JobRecord> {
        let row = sqlx::query("SELECT * FROM job_tracking WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|e| db_err("Failed to load job", e))?;

        row.map(|r| row_to_job(&r))
            .ok_or_else(|| skybridge_common::Error::NotFound(format!("job '{}' not found", id)))
    }

    pub async fn get_by_external_id(pool: &SqlitePool, external_id: &str) -> Result<JobRecord> {
        let row = sqlx::query(
            "SELECT * FROM job_tracking WHERE external_id = ? ORDER BY started_at DESC LIMIT 1",
        )
        .bind(external_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| db_err("Failed to load job", e))?;

        row.map(|r| row_to_job(&r)).ok_or_else(|| {
            skybridge_common::Error::NotFound(format!(
                "job with external id '{}' not found",
                external_id
            ))
        })
    }

    /// Lookup by internal or caller-provided id, whichever matches first
    pub async fn find_by_any_id(pool: &SqlitePool, any_id: &str) -> Result<JobRecord> {
        match get(pool, any_id).await {
            Ok(job) => Ok(job),
            Err(skybridge_common::Error::NotFound(_)) => {
                get_by_external_id(pool, any_id).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn list_by_context(
        pool: &SqlitePool,
        context_id: &str,
        limit: i64,
    ) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM job_tracking WHERE context_id = ?
             ORDER BY started_at DESC LIMIT ?",
        )
        .bind(context_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("Failed to list jobs", e))?;

        Ok(rows.iter().map(row_to_job).collect())
    }

    pub async fn list_by_type(
        pool: &SqlitePool,
        context_id: &str,
        job_type: &str,
        limit: i64,
    ) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM job_tracking WHERE context_id = ? AND job_type = ?
             ORDER BY started_at DESC LIMIT ?",
        )
        .bind(context_id)
        .bind(job_type)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("Failed to list jobs", e))?;

        Ok(rows.iter().map(row_to_job).collect())
    }

    /// Terminal transition; returns false when the job was already terminal
    pub async fn set_terminal(
        pool: &SqlitePool,
        id: &str,
        status: &str,
        error: Option<&str>,
        error_category: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE job_tracking
             SET status = ?, error_message = ?, error_category = ?, completed_at = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(status)
        .bind(error)
        .bind(error_category)
        .bind(now())
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to finish job", e))?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn request_cancel(pool: &SqlitePool, id: &str) -> Result<()> {
        let result =
            sqlx::query("UPDATE job_tracking SET cancel_requested = 1 WHERE id = ? AND status = 'running'")
                .bind(id)
                .execute(pool)
                .await
                .map_err(|e| db_err("Failed to request cancellation", e))?;

        if result.rows_affected() == 0 {
            return Err(skybridge_common::Error::Conflict(format!(
                "job '{}' is not running",
                id
            )));
        }

        Ok(())
    }

    pub async fn cancel_requested(pool: &SqlitePool, id: &str) -> Result<bool> {
        let job = get(pool, id).await?;
        Ok(job.cancel_requested)
    }

    /// Insert a running step; the sequence number is assigned atomically
    pub async fn insert_step(pool: &SqlitePool, job_id: &str, name: &str) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO job_steps (job_id, seq, name, status, started_at)
             VALUES (?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM job_steps WHERE job_id = ?),
                     ?, 'running', ?)",
        )
        .bind(job_id)
        .bind(job_id)
        .bind(name)
        .bind(now())
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to insert step", e))?;

        Ok(result.last_insert_rowid())
    }

    pub async fn close_step(
        pool: &SqlitePool,
        step_id: i64,
        status: &str,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE job_steps SET status = ?, error_message = ?, completed_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(error)
        .bind(now())
        .bind(step_id)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to close step", e))?;

        Ok(())
    }

    pub async fn list_steps(pool: &SqlitePool, job_id: &str) -> Result<Vec<StepRecord>> {
        let rows = sqlx::query("SELECT * FROM job_steps WHERE job_id = ? ORDER BY seq")
            .bind(job_id)
            .fetch_all(pool)
            .await
            .map_err(|e| db_err("Failed to list steps", e))?;

        Ok(rows.iter().map(row_to_step).collect())
    }

    /// (total, completed, failed) step counts; progress derives from these
    pub async fn step_counts(pool: &SqlitePool, job_id: &str) -> Result<(i64, i64, i64)> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total,
                    SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) AS completed,
                    SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed
             FROM job_steps WHERE job_id = ?",
        )
        .bind(job_id)
        .fetch_one(pool)
        .await
        .map_err(|e| db_err("Failed to count steps", e))?;

        Ok((
            row.get("total"),
            row.get::<Option<i64>, _>("completed").unwrap_or(0),
            row.get::<Option<i64>, _>("failed").unwrap_or(0),
        ))
    }
}

/// Schedule and execution persistence
pub mod schedules {
    use super::*;
    use serde::{Deserialize, Serialize};
    use sqlx::Row;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ScheduleRecord {
        pub id: String,
        pub name: String,
        pub cron_expression: String,
        pub timezone: Option<String>,
        pub enabled: bool,
        pub max_concurrent_jobs: i64,
        pub retry_attempts: i64,
        pub retry_delay_minutes: i64,
        pub skip_if_running: bool,
        pub created_at: i64,
        pub updated_at: i64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ScheduleExecutionRecord {
        pub id: String,
        pub schedule_id: String,
        pub fire_minute: String,
        pub status: String,
        pub vms_selected: i64,
        pub details: Option<String>,
        pub created_at: i64,
    }

    fn row_to_schedule(row: &sqlx::sqlite::SqliteRow) -> ScheduleRecord {
        ScheduleRecord {
            id: row.get("id"),
            name: row.get("name"),
            cron_expression: row.get("cron_expression"),
            timezone: row.get("timezone"),
            enabled: row.get::<i64, _>("enabled") != 0,
            max_concurrent_jobs: row.get("max_concurrent_jobs"),
            retry_attempts: row.get("retry_attempts"),
            retry_delay_minutes: row.get("retry_delay_minutes"),
            skip_if_running: row.get::<i64, _>("skip_if_running") != 0,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }

    pub async fn create(pool: &SqlitePool, s: &ScheduleRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO schedules
             (id, name, cron_expression, timezone, enabled, max_concurrent_jobs,
              retry_attempts, retry_delay_minutes, skip_if_running, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&s.id)
        .bind(&s.name)
        .bind(&s.cron_expression)
        .bind(&s.timezone)
        .bind(s.enabled as i64)
        .bind(s.max_concurrent_jobs)
        .bind(s.retry_attempts)
        .bind(s.retry_delay_minutes)
        .bind(s.skip_if_running as i64)
        .bind(s.created_at)
        .bind(s.updated_at)
        .execute(pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref d) if d.message().contains("UNIQUE") => {
                skybridge_common::Error::Conflict(format!(
                    "schedule '{}' already exists",
                    s.name
                ))
            }
            other => db_err("Failed to create schedule", other),
        })?;

        Ok(())
    }

    pub async fn get(pool: &SqlitePool, id: &str) -> Result<ScheduleRecord> {
        let row = sqlx::query("SELECT * FROM schedules WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|e| db_err("Failed to load schedule", e))?;

        row.map(|r| row_to_schedule(&r)).ok_or_else(|| {
            skybridge_common::Error::NotFound(format!("schedule '{}' not found", id))
        })
    }

    pub async fn list(pool: &SqlitePool, only_enabled: bool) -> Result<Vec<ScheduleRecord>> {
        let rows = if only_enabled {
            sqlx::query("SELECT * FROM schedules WHERE enabled = 1 ORDER BY name")
                .fetch_all(pool)
                .await
        } else {
            sqlx::query("SELECT * FROM schedules ORDER BY name")
                .fetch_all(pool)
                .await
        }
        .map_err(|e| db_err("Failed to list schedules", e))?;

        Ok(rows.iter().map(row_to_schedule).collect())
    }

    pub async fn update(pool: &SqlitePool, s: &ScheduleRecord) -> Result<()> {
        let result = sqlx::query(
            "UPDATE schedules
             SET name = ?, cron_expression = ?, timezone = ?, enabled = ?,
                 max_concurrent_jobs = ?, retry_attempts = ?, retry_delay_minutes = ?,
                 skip_if_running = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&s.name)
        .bind(&s.cron_expression)
        .bind(&s.timezone)
        .bind(s.enabled as i64)
        .bind(s.max_concurrent_jobs)
        .bind(s.retry_attempts)
        .bind(s.retry_delay_minutes)
        .bind(s.skip_if_running as i64)
        .bind(now())
        .bind(&s.id)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to update schedule", e))?;

        if result.rows_affected() == 0 {
            return Err(skybridge_common::Error::NotFound(format!(
                "schedule '{}' not found",
                s.id
            )));
        }

        Ok(())
    }

    pub async fn set_enabled(pool: &SqlitePool, id: &str, enabled: bool) -> Result<()> {
        let result = sqlx::query("UPDATE schedules SET enabled = ?, updated_at = ? WHERE id = ?")
            .bind(enabled as i64)
            .bind(now())
            .bind(id)
            .execute(pool)
            .await
            .map_err(|e| db_err("Failed to toggle schedule", e))?;

        if result.rows_affected() == 0 {
            return Err(skybridge_common::Error::NotFound(format!(
                "schedule '{}' not found",
                id
            )));
        }

        Ok(())
    }

    pub async fn delete(pool: &SqlitePool, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(|e| db_err("Failed to delete schedule", e))?;

        if result.rows_affected() == 0 {
            return Err(skybridge_common::Error::NotFound(format!(
                "schedule '{}' not found",
                id
            )));
        }

        Ok(())
    }

    /// Record a fire decision for (schedule, wall-clock minute). Returns
    /// false when this minute was already recorded, making replayed
    /// evaluations idempotent.
    pub async fn record_execution(
        pool: &SqlitePool,
        exec: &ScheduleExecutionRecord,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO schedule_executions
             (id, schedule_id, fire_minute, status, vms_selected, details, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&exec.id)
        .bind(&exec.schedule_id)
        .bind(&exec.fire_minute)
        .bind(&exec.status)
        .bind(exec.vms_selected)
        .bind(&exec.details)
        .bind(exec.created_at)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to record schedule execution", e))?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn finish_execution(
        pool: &SqlitePool,
        id: &str,
        status: &str,
        details: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE schedule_executions SET status = ?, details = COALESCE(?, details) WHERE id = ?",
        )
        .bind(status)
        .bind(details)
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to finish schedule execution", e))?;

        Ok(())
    }

    pub async fn list_executions(
        pool: &SqlitePool,
        schedule_id: &str,
        limit: i64,
    ) -> Result<Vec<ScheduleExecutionRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM schedule_executions WHERE schedule_id = ?
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(schedule_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("Failed to list schedule executions", e))?;

        Ok(rows
            .iter()
            .map(|row| ScheduleExecutionRecord {
                id: row.get("id"),
                schedule_id: row.get("schedule_id"),
                fire_minute: row.get("fire_minute"),
                status: row.get("status"),
                vms_selected: row.get("vms_selected"),
                details: row.get("details"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

/// Machine groups and membership
pub mod groups {
    use super::*;
    use serde::{Deserialize, Serialize};
    use sqlx::Row;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct MachineGroupRecord {
        pub id: String,
        pub name: String,
        pub description: Option<String>,
        pub schedule_id: Option<String>,
        pub created_at: i64,
        pub updated_at: i64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct GroupMembershipRecord {
        pub id: String,
        pub group_id: String,
        pub context_id: String,
        pub enabled: bool,
        pub priority: i64,
        pub created_at: i64,
    }

    fn row_to_group(row: &sqlx::sqlite::SqliteRow) -> MachineGroupRecord {
        MachineGroupRecord {
            id: row.get("id"),
            name: row.get("name"),
            description: row.get("description"),
            schedule_id: row.get("schedule_id"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }

    pub async fn create(pool: &SqlitePool, g: &MachineGroupRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO machine_groups (id, name, description, schedule_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&g.id)
        .bind(&g.name)
        .bind(&g.description)
        .bind(&g.schedule_id)
        .bind(g.created_at)
        .bind(g.updated_at)
        .execute(pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref d) if d.message().contains("UNIQUE") => {
                skybridge_common::Error::Conflict(format!("group '{}' already exists", g.name))
            }
            other => db_err("Failed to create machine group", other),
        })?;

        Ok(())
    }

    pub async fn get(pool: &SqlitePool, id: &str) -> Result<MachineGroupRecord> {
        let row = sqlx::query("SELECT * FROM machine_groups WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|e| db_err("Failed to load machine group", e))?;

        row.map(|r| row_to_group(&r)).ok_or_else(|| {
            skybridge_common::Error::NotFound(format!("machine group '{}' not found", id))
        })
    }

    pub async fn list(pool: &SqlitePool) -> Result<Vec<MachineGroupRecord>> {
        let rows = sqlx::query("SELECT * FROM machine_groups ORDER BY name")
            .fetch_all(pool)
            .await
            .map_err(|e| db_err("Failed to list machine groups", e))?;

        Ok(rows.iter().map(row_to_group).collect())
    }

    pub async fn update(pool: &SqlitePool, g: &MachineGroupRecord) -> Result<()> {
        let result = sqlx::query(
            "UPDATE machine_groups SET name = ?, description = ?, schedule_id = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&g.name)
        .bind(&g.description)
        .bind(&g.schedule_id)
        .bind(now())
        .bind(&g.id)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to update machine group", e))?;

        if result.rows_affected() == 0 {
            return Err(skybridge_common::Error::NotFound(format!(
                "machine group '{}' not found",
                g.id
            )));
        }

        Ok(())
    }

    pub async fn delete(pool: &SqlitePool, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM machine_groups WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(|e| db_err("Failed to delete machine group", e))?;

        if result.rows_affected() == 0 {
            return Err(skybridge_common::Error::NotFound(format!(
                "machine group '{}' not found",
                id
            )));
        }

        Ok(())
    }

    pub async fn add_member(pool: &SqlitePool, m: &GroupMembershipRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO group_memberships (id, group_id, context_id, enabled, priority, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&m.id)
        .bind(&m.group_id)
        .bind(&m.context_id)
        .bind(m.enabled as i64)
        .bind(m.priority)
        .bind(m.created_at)
        .execute(pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref d) if d.message().contains("UNIQUE") => {
                skybridge_common::Error::Conflict(format!(
                    "context '{}' already belongs to a group",
                    m.context_id
                ))
            }
            other => db_err("Failed to add group member", other),
        })?;

        Ok(())
    }

    pub async fn remove_member(pool: &SqlitePool, group_id: &str, context_id: &str) -> Result<()> {
        let result =
            sqlx::query("DELETE FROM group_memberships WHERE group_id = ? AND context_id = ?")
                .bind(group_id)
                .bind(context_id)
                .execute(pool)
                .await
                .map_err(|e| db_err("Failed to remove group member", e))?;

        if result.rows_affected() == 0 {
            return Err(skybridge_common::Error::NotFound(format!(
                "context '{}' is not a member of group '{}'",
                context_id, group_id
            )));
        }

        Ok(())
    }

    pub async fn list_members(
        pool: &SqlitePool,
        group_id: &str,
    ) -> Result<Vec<GroupMembershipRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM group_memberships WHERE group_id = ? ORDER BY priority DESC, created_at",
        )
        .bind(group_id)
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("Failed to list group members", e))?;

        Ok(rows
            .iter()
            .map(|row| GroupMembershipRecord {
                id: row.get("id"),
                group_id: row.get("group_id"),
                context_id: row.get("context_id"),
                enabled: row.get::<i64, _>("enabled") != 0,
                priority: row.get("priority"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    pub async fn groups_for_schedule(
        pool: &SqlitePool,
        schedule_id: &str,
    ) -> Result<Vec<MachineGroupRecord>> {
        let rows = sqlx::query("SELECT * FROM machine_groups WHERE schedule_id = ?")
            .bind(schedule_id)
            .fetch_all(pool)
            .await
            .map_err(|e| db_err("Failed to resolve groups for schedule", e))?;

        Ok(rows.iter().map(row_to_group).collect())
    }
}

/// Protection flow persistence
pub mod flows {
    use super::*;
    use serde::{Deserialize, Serialize};
    use sqlx::Row;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ProtectionFlowRecord {
        pub id: String,
        pub name: String,
        pub flow_type: String,
        pub target_type: String,
        pub target_id: String,
        pub repository_id: Option<String>,
        pub policy_id: Option<String>,
        pub schedule_id: Option<String>,
        pub enabled: bool,
        pub last_execution_id: Option<String>,
        pub last_execution_status: Option<String>,
        pub last_execution_at: Option<i64>,
        pub next_execution_at: Option<i64>,
        pub created_at: i64,
        pub updated_at: i64,
    }

    /// One row per (fan-out batch, VM); the queued state is how concurrency
    /// caps surface to the operator
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct FlowExecutionRecord {
        pub id: String,
        pub flow_id: String,
        pub batch_id: String,
        pub context_id: Option<String>,
        pub vm_name: Option<String>,
        pub status: String,
        pub job_id: Option<String>,
        pub error_message: Option<String>,
        pub queued_at: i64,
        pub started_at: Option<i64>,
        pub completed_at: Option<i64>,
    }

    fn row_to_flow(row: &sqlx::sqlite::SqliteRow) -> ProtectionFlowRecord {
        ProtectionFlowRecord {
            id: row.get("id"),
            name: row.get("name"),
            flow_type: row.get("flow_type"),
            target_type: row.get("target_type"),
            target_id: row.get("target_id"),
            repository_id: row.get("repository_id"),
            policy_id: row.get("policy_id"),
            schedule_id: row.get("schedule_id"),
            enabled: row.get::<i64, _>("enabled") != 0,
            last_execution_id: row.get("last_execution_id"),
            last_execution_status: row.get("last_execution_status"),
            last_execution_at: row.get("last_execution_at"),
            next_execution_at: row.get("next_execution_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }

    fn row_to_execution(row: &sqlx::sqlite::SqliteRow) -> FlowExecutionRecord {
        FlowExecutionRecord {
            id: row.get("id"),
            flow_id: row.get("flow_id"),
            batch_id: row.get("batch_id"),
            context_id: row.get("context_id"),
            vm_name: row.get("vm_name"),
            status: row.get("status"),
            job_id: row.get("job_id"),
            error_message: row.get("error_message"),
            queued_at: row.get("queued_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        }
    }

    pub async fn create(pool: &SqlitePool, f: &ProtectionFlowRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO protection_flows
             (id, name, flow_type, target_type, target_id, repository_id, policy_id,
              schedule_id, enabled, last_execution_id, last_execution_status,
              last_execution_at, next_execution_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&f.id)
        .bind(&f.name)
        .bind(&f.flow_type)
        .bind(&f.target_type)
        .bind(&f.target_id)
        .bind(&f.repository_id)
        .bind(&f.policy_id)
        .bind(&f.schedule_id)
        .bind(f.enabled as i64)
        .bind(&f.last_execution_id)
        .bind(&f.last_execution_status)
        .bind(f.last_execution_at)
        .bind(f.next_execution_at)
        .bind(f.created_at)
        .bind(f.updated_at)
        .execute(pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref d) if d.message().contains("UNIQUE") => {
                skybridge_common::Error::Conflict(format!("flow '{}' already exists", f.name))
            }
            other => db_err("Failed to create protection flow", other),
        })?;

        Ok(())
    }

    pub async fn get(pool: &SqlitePool, id: &str) -> Result<ProtectionFlowRecord> {
        let row = sqlx::query("SELECT * FROM protection_flows WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|e| db_err("Failed to load protection flow", e))?;

        row.map(|r| row_to_flow(&r)).ok_or_else(|| {
            skybridge_common::Error::NotFound(format!("protection flow '{}' not found", id))
        })
    }

    pub async fn list(pool: &SqlitePool) -> Result<Vec<ProtectionFlowRecord>> {
        let rows = sqlx::query("SELECT * FROM protection_flows ORDER BY name")
            .fetch_all(pool)
            .await
            .map_err(|e| db_err("Failed to list protection flows", e))?;

        Ok(rows.iter().map(row_to_flow).collect())
    }

    pub async fn list_for_schedule(
        pool: &SqlitePool,
        schedule_id: &str,
    ) -> Result<Vec<ProtectionFlowRecord>> {
        let rows =
            sqlx::query("SELECT * FROM protection_flows WHERE schedule_id = ? AND enabled = 1")
                .bind(schedule_id)
                .fetch_all(pool)
                .await
                .map_err(|e| db_err("Failed to resolve flows for schedule", e))?;

        Ok(rows.iter().map(row_to_flow).collect())
    }

    pub async fn update(pool: &SqlitePool, f: &ProtectionFlowRecord) -> Result<()> {
        let result = sqlx::query(
            "UPDATE protection_flows
             SET name = ?, flow_type = ?, target_type = ?, target_id = ?, repository_id = ?,
                 policy_id = ?, schedule_id = ?, enabled = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&f.name)
        .bind(&f.flow_type)
        .bind(&f.target_type)
        .bind(&f.target_id)
        .bind(&f.repository_id)
        .bind(&f.policy_id)
        .bind(&f.schedule_id)
        .bind(f.enabled as i64)
        .bind(now())
        .bind(&f.id)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to update protection flow", e))?;

        if result.rows_affected() == 0 {
            return Err(skybridge_common::Error::NotFound(format!(
                "protection flow '{}' not found",
                f.id
            )));
        }

        Ok(())
    }

    pub async fn set_enabled(pool: &SqlitePool, id: &str, enabled: bool) -> Result<()> {
        let result =
            sqlx::query("UPDATE protection_flows SET enabled = ?, updated_at = ? WHERE id = ?")
                .bind(enabled as i64)
                .bind(now())
                .bind(id)
                .execute(pool)
                .await
                .map_err(|e| db_err("Failed to toggle protection flow", e))?;

        if result.rows_affected() == 0 {
            return Err(skybridge_common::Error::NotFound(format!(
                "protection flow '{}' not found",
                id
            )));
        }

        Ok(())
    }

    pub async fn delete(pool: &SqlitePool, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM protection_flows WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(|e| db_err("Failed to delete protection flow", e))?;

        if result.rows_affected() == 0 {
            return Err(skybridge_common::Error::NotFound(format!(
                "protection flow '{}' not found",
                id
            )));
        }

        Ok(())
    }

    pub async fn insert_execution(pool: &SqlitePool, e: &FlowExecutionRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO flow_executions
             (id, flow_id, batch_id, context_id, vm_name, status, job_id, error_message,
              queued_at, started_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&e.id)
        .bind(&e.flow_id)
        .bind(&e.batch_id)
        .bind(&e.context_id)
        .bind(&e.vm_name)
        .bind(&e.status)
        .bind(&e.job_id)
        .bind(&e.error_message)
        .bind(e.queued_at)
        .bind(e.started_at)
        .bind(e.completed_at)
        .execute(pool)
        .await
        .map_err(|err| db_err("Failed to insert flow execution", err))?;

        Ok(())
    }

    pub async fn mark_execution_running(pool: &SqlitePool, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE flow_executions SET status = 'running', started_at = ?
             WHERE id = ? AND status = 'queued'",
        )
        .bind(now())
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to start flow execution", e))?;

        Ok(())
    }

    pub async fn finish_execution(
        pool: &SqlitePool,
        id: &str,
        status: &str,
        job_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE flow_executions
             SET status = ?, job_id = COALESCE(?, job_id), error_message = ?, completed_at = ?
             WHERE id = ?",
        )
        .bind(status)
        .bind(job_id)
        .bind(error)
        .bind(now())
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to finish flow execution", e))?;

        Ok(())
    }

    pub async fn list_executions(
        pool: &SqlitePool,
        flow_id: &str,
        limit: i64,
    ) -> Result<Vec<FlowExecutionRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM flow_executions WHERE flow_id = ? ORDER BY queued_at DESC LIMIT ?",
        )
        .bind(flow_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("Failed to list flow executions", e))?;

        Ok(rows.iter().map(row_to_execution).collect())
    }

    pub async fn list_batch(pool: &SqlitePool, batch_id: &str) -> Result<Vec<FlowExecutionRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM flow_executions WHERE batch_id = ? ORDER BY vm_name",
        )
        .bind(batch_id)
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("Failed to list batch executions", e))?;

        Ok(rows.iter().map(row_to_execution).collect())
    }

    /// Any execution of the flow still queued or running?
    pub async fn has_live_execution(pool: &SqlitePool, flow_id: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS live FROM flow_executions
             WHERE flow_id = ? AND status IN ('queued', 'running')",
        )
        .bind(flow_id)
        .fetch_one(pool)
        .await
        .map_err(|e| db_err("Failed to probe live executions", e))?;

        Ok(row.get::<i64, _>("live") > 0)
    }

    pub async fn record_last_execution(
        pool: &SqlitePool,
        flow_id: &str,
        execution_id: &str,
        status: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE protection_flows
             SET last_execution_id = ?, last_execution_status = ?, last_execution_at = ?,
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(execution_id)
        .bind(status)
        .bind(now())
        .bind(now())
        .bind(flow_id)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to record last execution", e))?;

        Ok(())
    }

    /// Executions queued today plus per-status counts, for the summary view
    pub async fn summary(pool: &SqlitePool, since: i64) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM flow_executions
             WHERE queued_at >= ? GROUP BY status",
        )
        .bind(since)
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("Failed to compute flow summary", e))?;

        Ok(rows
            .iter()
            .map(|row| (row.get("status"), row.get("count")))
            .collect())
    }
}

/// Backup copy policies
pub mod policies {
    use super::*;
    use serde::{Deserialize, Serialize};
    use sqlx::Row;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct PolicyRecord {
        pub id: String,
        pub name: String,
        pub copy_repository_id: String,
        pub retention_days: i64,
        pub enabled: bool,
        pub created_at: i64,
    }

    fn row_to_policy(row: &sqlx::sqlite::SqliteRow) -> PolicyRecord {
        PolicyRecord {
            id: row.get("id"),
            name: row.get("name"),
            copy_repository_id: row.get("copy_repository_id"),
            retention_days: row.get("retention_days"),
            enabled: row.get::<i64, _>("enabled") != 0,
            created_at: row.get("created_at"),
        }
    }

    pub async fn create(pool: &SqlitePool, p: &PolicyRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO backup_policies (id, name, copy_repository_id, retention_days, enabled, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&p.id)
        .bind(&p.name)
        .bind(&p.copy_repository_id)
        .bind(p.retention_days)
        .bind(p.enabled as i64)
        .bind(p.created_at)
        .execute(pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref d) if d.message().contains("UNIQUE") => {
                skybridge_common::Error::Conflict(format!("policy '{}' already exists", p.name))
            }
            other => db_err("Failed to create policy", other),
        })?;

        Ok(())
    }

    pub async fn get(pool: &SqlitePool, id: &str) -> Result<PolicyRecord> {
        let row = sqlx::query("SELECT * FROM backup_policies WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|e| db_err("Failed to load policy", e))?;

        row.map(|r| row_to_policy(&r)).ok_or_else(|| {
            skybridge_common::Error::NotFound(format!("policy '{}' not found", id))
        })
    }

    pub async fn list(pool: &SqlitePool) -> Result<Vec<PolicyRecord>> {
        let rows = sqlx::query("SELECT * FROM backup_policies ORDER BY name")
            .fetch_all(pool)
            .await
            .map_err(|e| db_err("Failed to list policies", e))?;

        Ok(rows.iter().map(row_to_policy).collect())
    }

    pub async fn delete(pool: &SqlitePool, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM backup_policies WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(|e| db_err("Failed to delete policy", e))?;

        if result.rows_affected() == 0 {
            return Err(skybridge_common::Error::NotFound(format!(
                "policy '{}' not found",
                id
            )));
        }

        Ok(())
    }
}

/// Named backup repositories
pub mod repositories {
    use super::*;
    use serde::{Deserialize, Serialize};
    use sqlx::Row;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct RepositoryRecord {
        pub id: String,
        pub name: String,
        pub repo_type: String,
        pub config: String,
        pub enabled: bool,
        pub created_at: i64,
    }

    fn row_to_repo(row: &sqlx::sqlite::SqliteRow) -> RepositoryRecord {
        RepositoryRecord {
            id: row.get("id"),
            name: row.get("name"),
            repo_type: row.get("repo_type"),
            config: row.get("config"),
            enabled: row.get::<i64, _>("enabled") != 0,
            created_at: row.get("created_at"),
        }
    }

    pub async fn create(pool: &SqlitePool, r: &RepositoryRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO backup_repositories (id, name, repo_type, config, enabled, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&r.id)
        .bind(&r.name)
        .bind(&r.repo_type)
        .bind(&r.config)
        .bind(r.enabled as i64)
        .bind(r.created_at)
        .execute(pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref d) if d.message().contains("UNIQUE") => {
                skybridge_common::Error::Conflict(format!(
                    "repository '{}' already exists",
                    r.name
                ))
            }
            other => db_err("Failed to create repository", other),
        })?;

        Ok(())
    }

    pub async fn get(pool: &SqlitePool, id: &str) -> Result<RepositoryRecord> {
        let row = sqlx::query("SELECT * FROM backup_repositories WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|e| db_err("Failed to load repository", e))?;

        row.map(|r| row_to_repo(&r)).ok_or_else(|| {
            skybridge_common::Error::NotFound(format!("repository '{}' not found", id))
        })
    }

    pub async fn list(pool: &SqlitePool) -> Result<Vec<RepositoryRecord>> {
        let rows = sqlx::query("SELECT * FROM backup_repositories ORDER BY name")
            .fetch_all(pool)
            .await
            .map_err(|e| db_err("Failed to list repositories", e))?;

        Ok(rows.iter().map(row_to_repo).collect())
    }
}

/// vCenter credentials (passwords stored encrypted)
pub mod credentials {
    use super::*;
    use serde::{Deserialize, Serialize};
    use sqlx::Row;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CredentialRecord {
        pub id: String,
        pub name: String,
        pub vcenter_host: String,
        pub username: String,
        pub password_enc: String,
        pub created_at: i64,
        pub updated_at: i64,
    }

    fn row_to_credential(row: &sqlx::sqlite::SqliteRow) -> CredentialRecord {
        CredentialRecord {
            id: row.get("id"),
            name: row.get("name"),
            vcenter_host: row.get("vcenter_host"),
            username: row.get("username"),
            password_enc: row.get("password_enc"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }

    pub async fn create(pool: &SqlitePool, c: &CredentialRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO vcenter_credentials
             (id, name, vcenter_host, username, password_enc, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&c.id)
        .bind(&c.name)
        .bind(&c.vcenter_host)
        .bind(&c.username)
        .bind(&c.password_enc)
        .bind(c.created_at)
        .bind(c.updated_at)
        .execute(pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref d) if d.message().contains("UNIQUE") => {
                skybridge_common::Error::Conflict(format!(
                    "credential '{}' already exists",
                    c.name
                ))
            }
            other => db_err("Failed to create credential", other),
        })?;

        Ok(())
    }

    pub async fn get(pool: &SqlitePool, id: &str) -> Result<CredentialRecord> {
        let row = sqlx::query("SELECT * FROM vcenter_credentials WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|e| db_err("Failed to load credential", e))?;

        row.map(|r| row_to_credential(&r)).ok_or_else(|| {
            skybridge_common::Error::NotFound(format!("credential '{}' not found", id))
        })
    }

    pub async fn get_for_host(pool: &SqlitePool, vcenter_host: &str) -> Result<CredentialRecord> {
        let row = sqlx::query(
            "SELECT * FROM vcenter_credentials WHERE vcenter_host = ?
             ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(vcenter_host)
        .fetch_optional(pool)
        .await
        .map_err(|e| db_err("Failed to load credential", e))?;

        row.map(|r| row_to_credential(&r)).ok_or_else(|| {
            skybridge_common::Error::NotFound(format!(
                "no credential stored for vCenter '{}'",
                vcenter_host
            ))
        })
    }
}

/// Node enrollment, connections and the enrollment audit trail
pub mod enrollments {
    use super::*;
    use serde::{Deserialize, Serialize};
    use sqlx::Row;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct EnrollmentRecord {
        pub id: String,
        pub pairing_code: String,
        pub node_name: Option<String>,
        pub node_version: Option<String>,
        pub node_public_key: Option<String>,
        pub node_fingerprint: Option<String>,
        pub challenge_nonce: Option<String>,
        pub status: String,
        pub expires_at: i64,
        pub approved_by: Option<String>,
        pub approved_at: Option<i64>,
        pub created_at: i64,
        pub updated_at: i64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ConnectionRecord {
        pub id: String,
        pub enrollment_id: String,
        pub node_name: String,
        pub node_fingerprint: String,
        pub status: String,
        pub connected_at: i64,
        pub revoked_at: Option<i64>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct AuditRecord {
        pub id: i64,
        pub event_type: String,
        pub enrollment_id: Option<String>,
        pub node_fingerprint: Option<String>,
        pub actor: Option<String>,
        pub details: Option<String>,
        pub created_at: i64,
    }

    fn row_to_enrollment(row: &sqlx::sqlite::SqliteRow) -> EnrollmentRecord {
        EnrollmentRecord {
            id: row.get("id"),
            pairing_code: row.get("pairing_code"),
            node_name: row.get("node_name"),
            node_version: row.get("node_version"),
            node_public_key: row.get("node_public_key"),
            node_fingerprint: row.get("node_fingerprint"),
            challenge_nonce: row.get("challenge_nonce"),
            status: row.get("status"),
            expires_at: row.get("expires_at"),
            approved_by: row.get("approved_by"),
            approved_at: row.get("approved_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }

    fn row_to_connection(row: &sqlx::sqlite::SqliteRow) -> ConnectionRecord {
        ConnectionRecord {
            id: row.get("id"),
            enrollment_id: row.get("enrollment_id"),
            node_name: row.get("node_name"),
            node_fingerprint: row.get("node_fingerprint"),
            status: row.get("status"),
            connected_at: row.get("connected_at"),
            revoked_at: row.get("revoked_at"),
        }
    }

    pub async fn insert(pool: &SqlitePool, e: &EnrollmentRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO node_enrollments
             (id, pairing_code, node_name, node_version, node_public_key, node_fingerprint,
              challenge_nonce, status, expires_at, approved_by, approved_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&e.id)
        .bind(&e.pairing_code)
        .bind(&e.node_name)
        .bind(&e.node_version)
        .bind(&e.node_public_key)
        .bind(&e.node_fingerprint)
        .bind(&e.challenge_nonce)
        .bind(&e.status)
        .bind(e.expires_at)
        .bind(&e.approved_by)
        .bind(e.approved_at)
        .bind(e.created_at)
        .bind(e.updated_at)
        .execute(pool)
        .await
        .map_err(|err| db_err("Failed to insert enrollment", err))?;

        Ok(())
    }

    pub async fn get(pool: &SqlitePool, id: &str) -> Result<EnrollmentRecord> {
        let row = sqlx::query("SELECT * FROM node_enrollments WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|e| db_err("Failed to load enrollment", e))?;

        row.map(|r| row_to_enrollment(&r)).ok_or_else(|| {
            skybridge_common::Error::NotFound(format!("enrollment '{}' not found", id))
        })
    }

    pub async fn find_issued_by_code(
        pool: &SqlitePool,
        pairing_code: &str,
    ) -> Result<Vec<EnrollmentRecord>> {
        let rows = sqlx::query("SELECT * FROM node_enrollments WHERE status = 'issued'")
            .fetch_all(pool)
            .await
            .map_err(|e| db_err("Failed to scan enrollments", e))?;

        // Comparison happens in the caller with a constant-time check;
        // here we only narrow to candidates still in the issued state.
        let _ = pairing_code;
        Ok(rows.iter().map(row_to_enrollment).collect())
    }

    pub async fn list(pool: &SqlitePool) -> Result<Vec<EnrollmentRecord>> {
        let rows = sqlx::query("SELECT * FROM node_enrollments ORDER BY created_at DESC")
            .fetch_all(pool)
            .await
            .map_err(|e| db_err("Failed to list enrollments", e))?;

        Ok(rows.iter().map(row_to_enrollment).collect())
    }

    pub async fn update_enrollment(pool: &SqlitePool, e: &EnrollmentRecord) -> Result<()> {
        sqlx::query(
            "UPDATE node_enrollments
             SET node_name = ?, node_version = ?, node_public_key = ?, node_fingerprint = ?,
                 challenge_nonce = ?, status = ?, approved_by = ?, approved_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&e.node_name)
        .bind(&e.node_version)
        .bind(&e.node_public_key)
        .bind(&e.node_fingerprint)
        .bind(&e.challenge_nonce)
        .bind(&e.status)
        .bind(&e.approved_by)
        .bind(e.approved_at)
        .bind(now())
        .bind(&e.id)
        .execute(pool)
        .await
        .map_err(|err| db_err("Failed to update enrollment", err))?;

        Ok(())
    }

    pub async fn insert_connection(pool: &SqlitePool, c: &ConnectionRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO node_connections
             (id, enrollment_id, node_name, node_fingerprint, status, connected_at, revoked_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&c.id)
        .bind(&c.enrollment_id)
        .bind(&c.node_name)
        .bind(&c.node_fingerprint)
        .bind(&c.status)
        .bind(c.connected_at)
        .bind(c.revoked_at)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to insert connection", e))?;

        Ok(())
    }

    pub async fn get_connection(pool: &SqlitePool, id: &str) -> Result<ConnectionRecord> {
        let row = sqlx::query("SELECT * FROM node_connections WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|e| db_err("Failed to load connection", e))?;

        row.map(|r| row_to_connection(&r)).ok_or_else(|| {
            skybridge_common::Error::NotFound(format!("connection '{}' not found", id))
        })
    }

    pub async fn list_connections(pool: &SqlitePool) -> Result<Vec<ConnectionRecord>> {
        let rows = sqlx::query("SELECT * FROM node_connections ORDER BY connected_at DESC")
            .fetch_all(pool)
            .await
            .map_err(|e| db_err("Failed to list connections", e))?;

        Ok(rows.iter().map(row_to_connection).collect())
    }

    /// Mark a connection revoked; already-revoked rows are untouched
    pub async fn revoke_connection(pool: &SqlitePool, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE node_connections SET status = 'revoked', revoked_at = ?
             WHERE id = ? AND status != 'revoked'",
        )
        .bind(now())
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to revoke connection", e))?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn audit(
        pool: &SqlitePool,
        event_type: &str,
        enrollment_id: Option<&str>,
        node_fingerprint: Option<&str>,
        actor: Option<&str>,
        details: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO enrollment_audit
             (event_type, enrollment_id, node_fingerprint, actor, details, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(event_type)
        .bind(enrollment_id)
        .bind(node_fingerprint)
        .bind(actor)
        .bind(details)
        .bind(now())
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to record audit event", e))?;

        Ok(())
    }

    pub async fn query_audit(
        pool: &SqlitePool,
        event_type: Option<&str>,
        limit: i64,
    ) -> Result<Vec<AuditRecord>> {
        let rows = match event_type {
            Some(et) => sqlx::query(
                "SELECT * FROM enrollment_audit WHERE event_type = ?
                 ORDER BY created_at DESC LIMIT ?",
            )
            .bind(et)
            .bind(limit)
            .fetch_all(pool)
            .await,
            None => sqlx::query("SELECT * FROM enrollment_audit ORDER BY created_at DESC LIMIT ?")
                .bind(limit)
                .fetch_all(pool)
                .await,
        }
        .map_err(|e| db_err("Failed to query audit log", e))?;

        Ok(rows
            .iter()
            .map(|row| AuditRecord {
                id: row.get("id"),
                event_type: row.get("event_type"),
                enrollment_id: row.get("enrollment_id"),
                node_fingerprint: row.get("node_fingerprint"),
                actor: row.get("actor"),
                details: row.get("details"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

/// Restore mount bookkeeping
pub mod restore_mounts {
    use super::*;
    use serde::{Deserialize, Serialize};
    use sqlx::Row;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct RestoreMountRecord {
        pub id: String,
        pub backup_job_id: String,
        pub backup_disk_id: String,
        pub disk_index: i64,
        pub mount_path: String,
        pub nbd_device: String,
        pub created_at: i64,
        pub last_accessed_at: i64,
    }

    fn row_to_mount(row: &sqlx::sqlite::SqliteRow) -> RestoreMountRecord {
        RestoreMountRecord {
            id: row.get("id"),
            backup_job_id: row.get("backup_job_id"),
            backup_disk_id: row.get("backup_disk_id"),
            disk_index: row.get("disk_index"),
            mount_path: row.get("mount_path"),
            nbd_device: row.get("nbd_device"),
            created_at: row.get("created_at"),
            last_accessed_at: row.get("last_accessed_at"),
        }
    }

    pub async fn insert(pool: &SqlitePool, m: &RestoreMountRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO restore_mounts
             (id, backup_job_id, backup_disk_id, disk_index, mount_path, nbd_device,
              created_at, last_accessed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&m.id)
        .bind(&m.backup_job_id)
        .bind(&m.backup_disk_id)
        .bind(m.disk_index)
        .bind(&m.mount_path)
        .bind(&m.nbd_device)
        .bind(m.created_at)
        .bind(m.last_accessed_at)
        .execute(pool)
        .await
        .map_err(|e| db_err("Failed to insert restore mount", e))?;

        Ok(())
    }

    pub async fn get(pool: &SqlitePool, id: &str) -> Result<RestoreMountRecord> {
        let row = sqlx::query("SELECT * FROM restore_mounts WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|e| db_err("Failed to load restore mount", e))?;

        row.map(|r| row_to_mount(&r)).ok_or_else(|| {
            skybridge_common::Error::NotFound(format!("restore mount '{}' not found", id))
        })
    }

    pub async fn list(pool: &SqlitePool) -> Result<Vec<RestoreMountRecord>> {
        let rows = sqlx::query("SELECT * FROM restore_mounts ORDER BY created_at DESC")
            .fetch_all(pool)
            .await
            .map_err(|e| db_err("Failed to list restore mounts", e))?;

        Ok(rows.iter().map(row_to_mount).collect())
    }

    pub async fn delete(pool: &SqlitePool, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM restore_mounts WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(|e| db_err("Failed to delete restore mount", e))?;

        Ok(())
    }

    pub async fn touch(pool: &SqlitePool, id: &str) -> Result<()> {
        sqlx::query("UPDATE restore_mounts SET last_accessed_at = ? WHERE id = ?")
            .bind(now())
            .bind(id)
            .execute(pool)
            .await
            .map_err(|e| db_err("Failed to touch restore mount", e))?;

        Ok(())
    }

    pub async fn list_idle(pool: &SqlitePool, cutoff: i64) -> Result<Vec<RestoreMountRecord>> {
        let rows = sqlx::query("SELECT * FROM restore_mounts WHERE last_accessed_at < ?")
            .bind(cutoff)
            .fetch_all(pool)
            .await
            .map_err(|e| db_err("Failed to list idle mounts", e))?;

        Ok(rows.iter().map(row_to_mount).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) async fn create_test_db() -> Database {
        let db = Database::new("sqlite::memory:")
            .await
            .expect("Failed to create database");
        db.migrate().await.expect("Failed to run migrations");
        db
    }

    fn test_context(id: &str, name: &str) -> contexts::VmContext {
        contexts::VmContext {
            context_id: id.to_string(),
            vmware_vm_id: format!("4205-{}", id),
            vm_name: name.to_string(),
            vcenter_host: "vcenter.lab".to_string(),
            datacenter: Some("DC1".to_string()),
            vm_path: format!("/DC1/vm/{}", name),
            credential_id: None,
            cpus: 2,
            memory_mb: 4096,
            os_type: Some("ubuntu64Guest".to_string()),
            power_state: Some("poweredOn".to_string()),
            scheduler_enabled: true,
            status: "discovered".to_string(),
            current_job_id: None,
            created_at: now(),
            updated_at: now(),
        }
    }

    #[tokio::test]
    async fn test_context_crud_and_duplicate() {
        let db = create_test_db().await;
        let pool = db.pool();

        let ctx = test_context("ctx-1", "pgtest1");
        contexts::create(pool, &ctx).await.unwrap();

        let loaded = contexts::get(pool, "ctx-1").await.unwrap();
        assert_eq!(loaded.vm_name, "pgtest1");
        assert!(loaded.current_job_id.is_none());

        // Duplicate vmware_vm_id refuses with Conflict
        let dup = test_context("ctx-1b", "pgtest1-copy");
        let mut dup = dup;
        dup.vmware_vm_id = ctx.vmware_vm_id.clone();
        match contexts::create(pool, &dup).await {
            Err(skybridge_common::Error::Conflict(_)) => {}
            other => panic!("expected Conflict, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_job_slot_is_single_occupancy() {
        let db = create_test_db().await;
        let pool = db.pool();
        contexts::create(pool, &test_context("ctx-1", "pgtest1"))
            .await
            .unwrap();

        contexts::claim_job_slot(pool, "ctx-1", "job-a").await.unwrap();

        match contexts::claim_job_slot(pool, "ctx-1", "job-b").await {
            Err(skybridge_common::Error::Conflict(_)) => {}
            other => panic!("expected Conflict, got {:?}", other.map(|_| ())),
        }

        // Releasing with the wrong owner leaves the slot held
        contexts::release_job_slot(pool, "ctx-1", "job-b").await.unwrap();
        let ctx = contexts::get(pool, "ctx-1").await.unwrap();
        assert_eq!(ctx.current_job_id.as_deref(), Some("job-a"));

        // Owner release frees it; releasing again is a no-op
        contexts::release_job_slot(pool, "ctx-1", "job-a").await.unwrap();
        contexts::release_job_slot(pool, "ctx-1", "job-a").await.unwrap();
        let ctx = contexts::get(pool, "ctx-1").await.unwrap();
        assert!(ctx.current_job_id.is_none());
    }

    #[tokio::test]
    async fn test_backup_chain_parent_selection() {
        let db = create_test_db().await;
        let pool = db.pool();

        let vbc = backups::upsert_backup_context(pool, "pgtest1", "repo-default")
            .await
            .unwrap();
        let again = backups::upsert_backup_context(pool, "pgtest1", "repo-default")
            .await
            .unwrap();
        assert_eq!(vbc.id, again.id);

        // No completed children yet
        let parent = backups::latest_completed_disk(pool, &vbc.id, 0).await.unwrap();
        assert!(parent.is_none());

        let job = backups::BackupJobRecord {
            id: "backup-pgtest1-1".to_string(),
            vm_backup_context_id: vbc.id.clone(),
            vm_name: "pgtest1".to_string(),
            repository_id: "repo-default".to_string(),
            backup_type: "full".to_string(),
            status: "running".to_string(),
            bytes_transferred: 0,
            progress_percent: 0.0,
            transfer_speed_bps: 0,
            current_phase: None,
            tags: None,
            error_message: None,
            started_at: now(),
            completed_at: None,
        };
        backups::insert_job(pool, &job).await.unwrap();

        let disk = backups::BackupDiskRecord {
            id: backups::disk_record_id(&job.id, 0),
            backup_job_id: job.id.clone(),
            vm_backup_context_id: vbc.id.clone(),
            disk_index: 0,
            status: "running".to_string(),
            qcow2_path: "/repo/pgtest1/disk0/full.qcow2".to_string(),
            nbd_port: Some(10100),
            export_name: Some("backup-pgtest1-1-disk0".to_string()),
            disk_change_id: String::new(),
            bytes_transferred: 0,
            error_message: None,
            started_at: now(),
            completed_at: None,
        };
        backups::insert_disk(pool, &disk).await.unwrap();

        // Running children are not chain parents
        assert!(backups::latest_completed_disk(pool, &vbc.id, 0)
            .await
            .unwrap()
            .is_none());

        let first = backups::complete_disk(pool, &job.id, 0, "52 de 42/55", 1024)
            .await
            .unwrap();
        assert!(first);

        // Idempotent: the second completion is a no-op
        let second = backups::complete_disk(pool, &job.id, 0, "52 de 42/55", 1024)
            .await
            .unwrap();
        assert!(!second);

        let parent = backups::latest_completed_disk(pool, &vbc.id, 0)
            .await
            .unwrap()
            .expect("completed child should be selectable");
        assert_eq!(parent.disk_change_id, "52 de 42/55");
        assert_eq!(parent.id, "backup-pgtest1-1-disk0");
    }

    #[test]
    fn test_child_id_naming_convention() {
        assert_eq!(backups::disk_record_id("backup-x", 2), "backup-x-disk2");
        assert_eq!(backups::parent_id_of("backup-x-disk2"), "backup-x");
        assert_eq!(backups::parent_id_of("backup-x"), "backup-x");
        // A name that merely contains "-disk" without a numeric suffix is a parent
        assert_eq!(backups::parent_id_of("backup-disky"), "backup-disky");
    }

    #[tokio::test]
    async fn test_job_terminal_write_once() {
        let db = create_test_db().await;
        let pool = db.pool();

        let job = jobs::JobRecord {
            id: "job-1".to_string(),
            external_id: Some("ext-1".to_string()),
            context_id: Some("ctx-1".to_string()),
            job_type: "backup".to_string(),
            operation: "start_vm_backup".to_string(),
            owner: "api".to_string(),
            status: "running".to_string(),
            cancel_requested: false,
            metadata: None,
            error_message: None,
            error_category: None,
            started_at: now(),
            completed_at: None,
        };
        jobs::insert(pool, &job).await.unwrap();

        assert!(jobs::set_terminal(pool, "job-1", "completed", None, None)
            .await
            .unwrap());
        // terminal -> terminal is rejected
        assert!(
            !jobs::set_terminal(pool, "job-1", "failed", Some("late"), Some("internal"))
                .await
                .unwrap()
        );

        let loaded = jobs::get(pool, "job-1").await.unwrap();
        assert_eq!(loaded.status, "completed");
        assert!(loaded.error_message.is_none());
        assert!(loaded.error_category.is_none());

        // Lookup works by internal and external id
        let by_ext = jobs::find_by_any_id(pool, "ext-1").await.unwrap();
        assert_eq!(by_ext.id, "job-1");
    }

    #[tokio::test]
    async fn test_replication_delete_cascades_and_nulls_failovers() {
        let db = create_test_db().await;
        let pool = db.pool();
        contexts::create(pool, &test_context("ctx-1", "pgtest1"))
            .await
            .unwrap();

        let job = replications::ReplicationJobRecord {
            id: "repl-1".to_string(),
            context_id: "ctx-1".to_string(),
            vm_name: "pgtest1".to_string(),
            replication_type: "initial".to_string(),
            status: "completed".to_string(),
            bytes_transferred: 0,
            progress_percent: 100.0,
            transfer_speed_bps: 0,
            current_phase: None,
            error_message: None,
            created_at: now(),
            updated_at: now(),
            completed_at: Some(now()),
        };
        replications::insert(pool, &job).await.unwrap();
        replications::record_change_id(pool, "repl-1", "/DC1/vm/pgtest1", "disk-2000", "52 aa/9")
            .await
            .unwrap();

        let fo = failovers::FailoverJobRecord {
            id: "fo-1".to_string(),
            context_id: "ctx-1".to_string(),
            replication_job_id: Some("repl-1".to_string()),
            vm_name: "pgtest1".to_string(),
            vmware_vm_id: "4205-ctx-1".to_string(),
            failover_type: "test".to_string(),
            status: "completed".to_string(),
            destination_vm_id: Some("cs-vm-1".to_string()),
            snapshot_id: None,
            error_message: None,
            created_at: now(),
            updated_at: now(),
            completed_at: Some(now()),
        };
        failovers::insert(pool, &fo).await.unwrap();

        replications::delete(pool, "repl-1").await.unwrap();

        // Failover survives with the reference nulled
        let fo = failovers::get(pool, "fo-1").await.unwrap();
        assert!(fo.replication_job_id.is_none());

        // CBT history is gone with the job
        let change = replications::latest_change_id_by_path(pool, "/DC1/vm/pgtest1", None)
            .await
            .unwrap();
        assert!(change.is_none());

        // Second delete reports NotFound
        match replications::delete(pool, "repl-1").await {
            Err(skybridge_common::Error::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_schedule_execution_replay_is_idempotent() {
        let db = create_test_db().await;
        let pool = db.pool();

        let schedule = schedules::ScheduleRecord {
            id: "sched-1".to_string(),
            name: "nightly".to_string(),
            cron_expression: "*/5 * * * *".to_string(),
            timezone: None,
            enabled: true,
            max_concurrent_jobs: 2,
            retry_attempts: 1,
            retry_delay_minutes: 5,
            skip_if_running: true,
            created_at: now(),
            updated_at: now(),
        };
        schedules::create(pool, &schedule).await.unwrap();

        let exec = schedules::ScheduleExecutionRecord {
            id: "exec-1".to_string(),
            schedule_id: "sched-1".to_string(),
            fire_minute: "2026-08-01T12:05".to_string(),
            status: "running".to_string(),
            vms_selected: 2,
            details: None,
            created_at: now(),
        };
        assert!(schedules::record_execution(pool, &exec).await.unwrap());

        // Replaying the same (schedule, minute) does not fire again
        let replay = schedules::ScheduleExecutionRecord {
            id: "exec-2".to_string(),
            ..exec.clone()
        };
        assert!(!schedules::record_execution(pool, &replay).await.unwrap());
    }

    #[tokio::test]
    async fn test_connection_revoke_is_idempotent() {
        let db = create_test_db().await;
        let pool = db.pool();

        let enrollment = enrollments::EnrollmentRecord {
            id: "enr-1".to_string(),
            pairing_code: "AX7K-PJ3F-TH2Q".to_string(),
            node_name: Some("site-a".to_string()),
            node_version: None,
            node_public_key: None,
            node_fingerprint: Some("SHA256:abc".to_string()),
            challenge_nonce: None,
            status: "approved".to_string(),
            expires_at: now() + 600,
            approved_by: Some("admin".to_string()),
            approved_at: Some(now()),
            created_at: now(),
            updated_at: now(),
        };
        enrollments::insert(pool, &enrollment).await.unwrap();

        let conn = enrollments::ConnectionRecord {
            id: "conn-1".to_string(),
            enrollment_id: "enr-1".to_string(),
            node_name: "site-a".to_string(),
            node_fingerprint: "SHA256:abc".to_string(),
            status: "connected".to_string(),
            connected_at: now(),
            revoked_at: None,
        };
        enrollments::insert_connection(pool, &conn).await.unwrap();

        assert!(enrollments::revoke_connection(pool, "conn-1").await.unwrap());
        assert!(!enrollments::revoke_connection(pool, "conn-1").await.unwrap());

        let loaded = enrollments::get_connection(pool, "conn-1").await.unwrap();
        assert_eq!(loaded.status, "revoked");
    }
}
