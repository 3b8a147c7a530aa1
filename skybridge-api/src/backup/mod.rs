///! Backup orchestration
///!
///! Backups are VM-level so the Node takes a single source-side snapshot;
///! there is no per-disk entry point. Per disk the orchestrator resolves the
///! chain parent, asks the repository for a wired QCOW2 file, arms a block
///! server, and hands the full NBD target list to the Node. Completion
///! arrives per disk through callbacks and commits the new change-tracking
///! id; the last child promotes the parent.

use crate::blockserver::{export_name, BlockServerSupervisor};
use crate::credentials::CredentialService;
use crate::db;
use crate::node::{NodeBackupRequest, NodeClient};
use crate::repository::RepositoryManager;
use crate::tracker::{JobTracker, NewJob};
use serde::{Deserialize, Serialize};
use skybridge_common::{BackupType, JobStatus, Result};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Device keys on the wire start at 2000 and step by disk index
const DISK_KEY_BASE: i64 = 2000;

#[derive(Debug, Clone, Deserialize)]
pub struct StartBackupRequest {
    pub vm_name: String,
    pub backup_type: BackupType,
    pub repository_id: String,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskResult {
    pub disk_index: i64,
    pub disk_key: i64,
    pub qcow2_path: String,
    pub nbd_port: u16,
    pub export_name: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartBackupResponse {
    pub backup_id: String,
    pub vm_name: String,
    pub backup_type: BackupType,
    pub repository_id: String,
    pub nbd_targets_string: String,
    pub disk_results: Vec<DiskResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainView {
    pub disk_index: i64,
    pub repository_id: String,
    pub entries: Vec<db::backups::BackupDiskRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupStats {
    pub total_backups: i64,
    pub completed_backups: i64,
    pub failed_backups: i64,
    pub total_bytes: i64,
}

/// Resources held while preparing one disk, undone by the compensator
struct PreparedDisk {
    disk_index: i64,
    port: u16,
    qcow2_path: PathBuf,
}

#[derive(Clone)]
pub struct BackupOrchestrator {
    pool: SqlitePool,
    tracker: JobTracker,
    repositories: RepositoryManager,
    block_servers: Arc<BlockServerSupervisor>,
    credentials: CredentialService,
    node: NodeClient,
}

impl BackupOrchestrator {
    pub fn new(
        pool: SqlitePool,
        tracker: JobTracker,
        repositories: RepositoryManager,
        block_servers: Arc<BlockServerSupervisor>,
        credentials: CredentialService,
        node: NodeClient,
    ) -> Self {
        Self {
            pool,
            tracker,
            repositories,
            block_servers,
            credentials,
            node,
        }
    }

    /// Start a VM-level backup. Returns as soon as every disk is armed and
    /// the Node acknowledged the push; completion lands via callbacks.
    pub async fn start_vm_backup(
        &self,
        request: StartBackupRequest,
    ) -> Result<StartBackupResponse> {
        let backup_id = format!(
            "backup-{}-{}",
            request.vm_name,
            chrono::Utc::now().timestamp()
        );

        let job_id = self
            .tracker
            .start_job(NewJob {
                job_type: "backup".to_string(),
                operation: "start_vm_backup".to_string(),
                owner: "api".to_string(),
                external_id: Some(backup_id.clone()),
                metadata: Some(serde_json::json!({
                    "vm_name": request.vm_name,
                    "backup_type": request.backup_type.to_string(),
                    "repository_id": request.repository_id,
                })),
                ..Default::default()
            })
            .await?;

        match self.run_backup_start(&job_id, &backup_id, &request).await {
            Ok(response) => {
                self.tracker.end_job(&job_id, JobStatus::Completed, None).await?;
                Ok(response)
            }
            Err(e) => {
                let _ = self
                    .tracker
                    .end_job(&job_id, JobStatus::Failed, Some(&e))
                    .await;
                Err(e)
            }
        }
    }

    async fn run_backup_start(
        &self,
        job_id: &str,
        backup_id: &str,
        request: &StartBackupRequest,
    ) -> Result<StartBackupResponse> {
        // 1. Context resolution
        let (context, vm_disks) = self
            .tracker
            .run_step(job_id, "resolve-context", async {
                let context = db::contexts::get_by_name(&self.pool, &request.vm_name).await?;
                let vm_disks = db::disks::list_for_context(&self.pool, &context.context_id).await?;
                if vm_disks.is_empty() {
                    return Err(skybridge_common::Error::PreconditionFailed(format!(
                        "VM '{}' has no discovered disks",
                        request.vm_name
                    )));
                }
                Ok((context, vm_disks))
            })
            .await?;

        // 2. Backup-context upsert
        let backup_context = self
            .tracker
            .run_step(job_id, "resolve-backup-context", async {
                db::backups::upsert_backup_context(
                    &self.pool,
                    &request.vm_name,
                    &request.repository_id,
                )
                .await
            })
            .await?;

        // 3. Eager parent row, so children can reference it immediately.
        //    Everything after this point is covered by the compensator.
        self.tracker
            .run_step(job_id, "create-parent-record", async {
                db::backups::insert_job(
                    &self.pool,
                    &db::backups::BackupJobRecord {
                        id: backup_id.to_string(),
                        vm_backup_context_id: backup_context.id.clone(),
                        vm_name: request.vm_name.clone(),
                        repository_id: request.repository_id.clone(),
                        backup_type: request.backup_type.to_string(),
                        status: "running".to_string(),
                        bytes_transferred: 0,
                        progress_percent: 0.0,
                        transfer_speed_bps: 0,
                        current_phase: Some("preparing".to_string()),
                        tags: request
                            .tags
                            .as_ref()
                            .map(|t| serde_json::to_string(t).unwrap_or_default()),
                        error_message: None,
                        started_at: chrono::Utc::now().timestamp(),
                        completed_at: None,
                    },
                )
                .await
            })
            .await?;

        let mut prepared: Vec<PreparedDisk> = Vec::new();

        let result = self
            .prepare_and_dispatch(job_id, backup_id, request, &backup_context, &context, &vm_disks, &mut prepared)
            .await;

        match result {
            Ok(response) => Ok(response),
            Err(e) => {
                self.compensate(backup_id, &request.repository_id, &prepared).await;
                Err(e)
            }
        }
    }

    async fn prepare_and_dispatch(
        &self,
        job_id: &str,
        backup_id: &str,
        request: &StartBackupRequest,
        backup_context: &db::backups::VmBackupContext,
        context: &db::contexts::VmContext,
        vm_disks: &[db::disks::VmDiskRecord],
        prepared: &mut Vec<PreparedDisk>,
    ) -> Result<StartBackupResponse> {
        let repository = self.repositories.resolve(&request.repository_id).await?;
        let nbd_host = self.block_servers.advertise_host().to_string();

        let mut nbd_targets = Vec::with_capacity(vm_disks.len());
        let mut disk_results = Vec::with_capacity(vm_disks.len());

        // 4. Per-disk preparation, ordered by disk index
        for vm_disk in vm_disks {
            let disk_index = vm_disk.disk_index;
            let step_name = format!("prepare-disk-{}", disk_index);

            let (port, qcow2_path, export) = self
                .tracker
                .run_step(job_id, &step_name, async {
                    let parent_file = match request.backup_type {
                        BackupType::Incremental => {
                            let parent = db::backups::latest_completed_disk(
                                &self.pool,
                                &backup_context.id,
                                disk_index,
                            )
                            .await?;
                            match parent {
                                Some(parent) => Some(PathBuf::from(parent.qcow2_path)),
                                None => {
                                    return Err(skybridge_common::Error::InvalidRequest(
                                        format!(
                                            "no previous backup found for disk {} of '{}'",
                                            disk_index, request.vm_name
                                        ),
                                    ))
                                }
                            }
                        }
                        BackupType::Full => None,
                    };

                    let qcow2_path = repository
                        .create_backup_file(
                            &request.vm_name,
                            disk_index,
                            request.backup_type,
                            parent_file.as_deref(),
                        )
                        .await?;

                    // The compensator only sees fully prepared disks, so a
                    // half-armed disk cleans up after itself here
                    let port = match self.block_servers.allocate(backup_id).await {
                        Ok(port) => port,
                        Err(e) => {
                            let _ = repository.delete_backup_file(&qcow2_path).await;
                            return Err(e);
                        }
                    };

                    let export = export_name(backup_id, disk_index);
                    if let Err(e) = self.block_servers.start(port, &qcow2_path, &export).await {
                        let _ = self.block_servers.release(port).await;
                        let _ = repository.delete_backup_file(&qcow2_path).await;
                        return Err(e);
                    }

                    Ok((port, qcow2_path, export))
                })
                .await?;

            prepared.push(PreparedDisk {
                disk_index,
                port,
                qcow2_path: qcow2_path.clone(),
            });

            db::backups::insert_disk(
                &self.pool,
                &db::backups::BackupDiskRecord {
                    id: db::backups::disk_record_id(backup_id, disk_index),
                    backup_job_id: backup_id.to_string(),
                    vm_backup_context_id: backup_context.id.clone(),
                    disk_index,
                    status: "running".to_string(),
                    qcow2_path: qcow2_path.to_string_lossy().into_owned(),
                    nbd_port: Some(port as i64),
                    export_name: Some(export.clone()),
                    disk_change_id: String::new(),
                    bytes_transferred: 0,
                    error_message: None,
                    started_at: chrono::Utc::now().timestamp(),
                    completed_at: None,
                },
            )
            .await?;

            let disk_key = DISK_KEY_BASE + disk_index;
            nbd_targets.push(format!(
                "{}:nbd://{}:{}/{}",
                disk_key, nbd_host, port, export
            ));
            disk_results.push(DiskResult {
                disk_index,
                disk_key,
                qcow2_path: qcow2_path.to_string_lossy().into_owned(),
                nbd_port: port,
                export_name: export,
                status: "running".to_string(),
            });
        }

        let nbd_targets_string = nbd_targets.join(",");

        // 5. Remote orchestration over the tunnel. The Node resolves the
        //    per-disk change ids itself by querying /backups/changeid, so the
        //    request carries a placeholder.
        self.tracker
            .run_step(job_id, "notify-node", async {
                let credential = self.credentials.for_host(&context.vcenter_host).await?;
                self.node
                    .start_backup(&NodeBackupRequest {
                        vm_name: request.vm_name.clone(),
                        vcenter_host: credential.vcenter_host.clone(),
                        vcenter_user: credential.username.clone(),
                        vcenter_password: credential.password.clone(),
                        vm_path: context.vm_path.clone(),
                        nbd_host: nbd_host.clone(),
                        nbd_targets: nbd_targets_string.clone(),
                        job_id: backup_id.to_string(),
                        backup_type: request.backup_type.to_string(),
                        previous_change_id: "PLACEHOLDER".to_string(),
                    })
                    .await
            })
            .await?;

        db::backups::update_phase(&self.pool, backup_id, "transferring").await?;

        info!(
            "Backup {} armed: {} disk(s), targets [{}]",
            backup_id,
            disk_results.len(),
            nbd_targets_string
        );

        // 6. Return immediately with the prepared per-disk descriptors
        Ok(StartBackupResponse {
            backup_id: backup_id.to_string(),
            vm_name: request.vm_name.clone(),
            backup_type: request.backup_type,
            repository_id: request.repository_id.clone(),
            nbd_targets_string,
            disk_results,
        })
    }

    /// Deferred cleanup after a failed preparation: stop block servers,
    /// release ports, remove created files, delete the parent row.
    async fn compensate(&self, backup_id: &str, repository_id: &str, prepared: &[PreparedDisk]) {
        warn!(
            "Backup {} failed during preparation, rolling back {} disk(s)",
            backup_id,
            prepared.len()
        );

        for disk in prepared {
            if let Err(e) = self.block_servers.stop(disk.port).await {
                error!("Cleanup: failed to stop block server on {}: {}", disk.port, e);
            }
        }

        if let Ok(repository) = self.repositories.resolve(repository_id).await {
            for disk in prepared {
                if let Err(e) = repository.delete_backup_file(&disk.qcow2_path).await {
                    error!(
                        "Cleanup: failed to delete {} for disk {}: {}",
                        disk.qcow2_path.display(),
                        disk.disk_index,
                        e
                    );
                }
            }
        }

        if let Err(e) = db::backups::delete_job(&self.pool, backup_id).await {
            if !matches!(e, skybridge_common::Error::NotFound(_)) {
                error!("Cleanup: failed to delete parent row {}: {}", backup_id, e);
            }
        }
    }

    /// Idempotent per-disk completion callback. Marks the child completed,
    /// commits the new change-tracking id, tears down the disk's block
    /// server, and promotes the parent when the last child lands.
    pub async fn complete_backup(
        &self,
        backup_id: &str,
        disk_index: i64,
        change_id: &str,
        bytes_transferred: i64,
    ) -> Result<db::backups::BackupDiskRecord> {
        if change_id.is_empty() {
            return Err(skybridge_common::Error::InvalidRequest(
                "completion requires a non-empty change id".to_string(),
            ));
        }

        let parent_id = db::backups::parent_id_of(backup_id).to_string();
        let parent = db::backups::get_job(&self.pool, &parent_id).await?;

        let freshly_completed = db::backups::complete_disk(
            &self.pool,
            &parent_id,
            disk_index,
            change_id,
            bytes_transferred,
        )
        .await?;

        if freshly_completed {
            let disk = db::backups::get_disk(&self.pool, &parent_id, disk_index).await?;

            if let Some(port) = disk.nbd_port {
                if let Err(e) = self.block_servers.stop(port as u16).await {
                    warn!("Failed to stop block server on port {}: {}", port, e);
                }
            }

            // Commit the per-disk change-tracking id on the VM context
            if let Ok(context) = db::contexts::get_by_name(&self.pool, &parent.vm_name).await {
                db::disks::set_change_id(&self.pool, &context.context_id, disk_index, change_id)
                    .await?;
            }

            let (total, completed, failed) =
                db::backups::disk_counts(&self.pool, &parent_id).await?;
            if failed == 0 && completed == total {
                db::backups::set_job_status(&self.pool, &parent_id, "completed", None).await?;
                info!("Backup {} completed ({} disks)", parent_id, total);
            }
        }

        db::backups::get_disk(&self.pool, &parent_id, disk_index).await
    }

    /// Per-disk failure callback. The parent fails immediately; still-running
    /// siblings keep transferring but can no longer promote the parent.
    pub async fn fail_backup(
        &self,
        backup_id: &str,
        disk_index: i64,
        error: &str,
    ) -> Result<()> {
        let parent_id = db::backups::parent_id_of(backup_id).to_string();

        db::backups::fail_disk(&self.pool, &parent_id, disk_index, error).await?;
        db::backups::set_job_status(&self.pool, &parent_id, "failed", Some(error)).await?;

        let disk = db::backups::get_disk(&self.pool, &parent_id, disk_index).await?;
        if let Some(port) = disk.nbd_port {
            let _ = self.block_servers.stop(port as u16).await;
        }

        warn!(
            "Backup {} disk {} failed: {}",
            parent_id, disk_index, error
        );
        Ok(())
    }

    pub async fn get_backup(&self, any_id: &str) -> Result<db::backups::BackupJobRecord> {
        let parent_id = db::backups::parent_id_of(any_id);
        db::backups::get_job(&self.pool, parent_id).await
    }

    pub async fn get_backup_disks(
        &self,
        backup_id: &str,
    ) -> Result<Vec<db::backups::BackupDiskRecord>> {
        db::backups::list_disks_for_job(&self.pool, db::backups::parent_id_of(backup_id)).await
    }

    pub async fn list_backups(
        &self,
        vm_name: Option<&str>,
        repository_id: Option<&str>,
    ) -> Result<Vec<db::backups::BackupJobRecord>> {
        db::backups::list_jobs(&self.pool, vm_name, repository_id).await
    }

    pub async fn stats(&self) -> Result<BackupStats> {
        let (total, completed, failed, bytes) = db::backups::stats(&self.pool).await?;
        Ok(BackupStats {
            total_backups: total,
            completed_backups: completed,
            failed_backups: failed,
            total_bytes: bytes,
        })
    }

    /// The most recent committed change id for (vm, disk), queried back by
    /// the Node at transfer start.
    pub async fn change_id_for_disk(&self, vm_name: &str, disk_index: i64) -> Result<String> {
        let contexts = db::backups::backup_contexts_for_vm(&self.pool, vm_name).await?;
        let mut best: Option<db::backups::BackupDiskRecord> = None;

        for vbc in contexts {
            if let Some(candidate) =
                db::backups::latest_completed_disk(&self.pool, &vbc.id, disk_index).await?
            {
                best = match best {
                    Some(current) if current.completed_at >= candidate.completed_at => {
                        Some(current)
                    }
                    _ => Some(candidate),
                };
            }
        }

        best.map(|disk| disk.disk_change_id).ok_or_else(|| {
            skybridge_common::Error::NotFound(format!(
                "no completed backup for disk {} of '{}'",
                disk_index, vm_name
            ))
        })
    }

    /// Ordered chains for every disk of a VM, across its backup contexts
    pub async fn chains_for_vm(&self, vm_name: &str) -> Result<Vec<ChainView>> {
        let contexts = db::backups::backup_contexts_for_vm(&self.pool, vm_name).await?;
        if contexts.is_empty() {
            return Err(skybridge_common::Error::NotFound(format!(
                "no backups recorded for '{}'",
                vm_name
            )));
        }

        let mut chains = Vec::new();
        for vbc in contexts {
            let indexes = db::backups::disk_indexes_for_context(&self.pool, &vbc.id).await?;
            for disk_index in indexes {
                let entries = db::backups::chain(&self.pool, &vbc.id, disk_index).await?;
                if !entries.is_empty() {
                    chains.push(ChainView {
                        disk_index,
                        repository_id: vbc.repository_id.clone(),
                        entries,
                    });
                }
            }
        }

        Ok(chains)
    }

    /// Delete a backup as a tracked job with explicit compensating steps:
    /// tear down any leftover block servers, remove chain files, drop rows.
    pub async fn delete_backup(&self, backup_id: &str) -> Result<()> {
        let parent_id = db::backups::parent_id_of(backup_id).to_string();
        let parent = db::backups::get_job(&self.pool, &parent_id).await?;

        let job_id = self
            .tracker
            .start_job(NewJob {
                job_type: "backup".to_string(),
                operation: "delete_backup".to_string(),
                owner: "api".to_string(),
                metadata: Some(serde_json::json!({ "backup_id": parent_id })),
                ..Default::default()
            })
            .await?;

        let result: Result<()> = async {
            let disks = self
                .tracker
                .run_step(&job_id, "stop-block-servers", async {
                    let disks = db::backups::list_disks_for_job(&self.pool, &parent_id).await?;
                    for disk in &disks {
                        if disk.status == "running" {
                            if let Some(port) = disk.nbd_port {
                                let _ = self.block_servers.stop(port as u16).await;
                            }
                        }
                    }
                    Ok(disks)
                })
                .await?;

            self.tracker
                .run_step(&job_id, "delete-chain-files", async {
                    let repository = self.repositories.resolve(&parent.repository_id).await?;
                    for disk in &disks {
                        repository
                            .delete_backup_file(std::path::Path::new(&disk.qcow2_path))
                            .await?;
                    }
                    Ok(())
                })
                .await?;

            self.tracker
                .run_step(&job_id, "delete-records", async {
                    db::backups::delete_job(&self.pool, &parent_id).await
                })
                .await?;

            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.tracker.end_job(&job_id, JobStatus::Completed, None).await?;
                Ok(())
            }
            Err(e) => {
                let _ = self
                    .tracker
                    .end_job(&job_id, JobStatus::Failed, Some(&e))
                    .await;
                Err(e)
            }
        }
    }

    /// Copy a completed backup's chain files into another repository
    pub async fn copy_backup(
        &self,
        backup_id: &str,
        target_repository_id: &str,
        policy_id: Option<&str>,
    ) -> Result<db::backups::BackupCopyRecord> {
        let parent_id = db::backups::parent_id_of(backup_id).to_string();
        let parent = db::backups::get_job(&self.pool, &parent_id).await?;

        if parent.status != "completed" {
            return Err(skybridge_common::Error::PreconditionFailed(format!(
                "backup '{}' is {}, only completed backups can be copied",
                parent_id, parent.status
            )));
        }
        if parent.repository_id == target_repository_id {
            return Err(skybridge_common::Error::InvalidRequest(
                "copy target must differ from the source repository".to_string(),
            ));
        }

        let target = self.repositories.resolve(target_repository_id).await?;
        let disks = db::backups::list_disks_for_job(&self.pool, &parent_id).await?;

        let copy = db::backups::BackupCopyRecord {
            id: format!("copy-{}", uuid::Uuid::new_v4()),
            backup_job_id: parent_id.clone(),
            policy_id: policy_id.map(|p| p.to_string()),
            repository_id: target_repository_id.to_string(),
            status: "running".to_string(),
            error_message: None,
            created_at: chrono::Utc::now().timestamp(),
            completed_at: None,
        };
        db::backups::insert_copy(&self.pool, &copy).await?;

        let mut copy_error = None;
        for disk in &disks {
            if let Err(e) = target
                .import_file(
                    std::path::Path::new(&disk.qcow2_path),
                    &parent.vm_name,
                    disk.disk_index,
                )
                .await
            {
                copy_error = Some(e.to_string());
                break;
            }
        }

        match copy_error {
            None => {
                db::backups::finish_copy(&self.pool, &copy.id, "completed", None).await?;
            }
            Some(ref msg) => {
                db::backups::finish_copy(&self.pool, &copy.id, "failed", Some(msg)).await?;
            }
        }

        let copies = db::backups::list_copies(&self.pool, &parent_id).await?;
        copies
            .into_iter()
            .find(|c| c.id == copy.id)
            .ok_or_else(|| skybridge_common::Error::System("copy record vanished".to_string()))
    }

    pub async fn list_copies(&self, backup_id: &str) -> Result<Vec<db::backups::BackupCopyRecord>> {
        let parent_id = db::backups::parent_id_of(backup_id);
        // Verify the parent exists so a bogus id surfaces as 404
        db::backups::get_job(&self.pool, parent_id).await?;
        db::backups::list_copies(&self.pool, parent_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::backups as dbb;

    struct Fixture {
        _db: crate::db::Database,
        pool: SqlitePool,
        orchestrator: BackupOrchestrator,
        supervisor: Arc<BlockServerSupervisor>,
    }

    async fn fixture() -> Fixture {
        let database = crate::db::Database::new("sqlite::memory:").await.unwrap();
        database.migrate().await.unwrap();
        let pool = database.pool().clone();

        let tracker = JobTracker::new(pool.clone());
        let repositories =
            RepositoryManager::new(pool.clone(), std::env::temp_dir().join("skybridge-tests"));
        repositories.ensure_default().await.unwrap();

        let supervisor = Arc::new(BlockServerSupervisor::new(&crate::config::BlockServerConfig {
            binary: "qemu-nbd".to_string(),
            port_low: 10100,
            port_high: 10101,
            advertise_host: "127.0.0.1".to_string(),
        }));
        let credentials =
            CredentialService::with_key(pool.clone(), [3u8; 32]);
        let node = NodeClient::new(9081, std::time::Duration::from_secs(1), 1);

        let orchestrator = BackupOrchestrator::new(
            pool.clone(),
            tracker,
            repositories,
            supervisor.clone(),
            credentials,
            node,
        );

        Fixture {
            _db: database,
            pool,
            orchestrator,
            supervisor,
        }
    }

    async fn seed_context(pool: &SqlitePool, vm_name: &str) -> String {
        let context_id = format!("ctx-{}", vm_name);
        crate::db::contexts::create(
            pool,
            &crate::db::contexts::VmContext {
                context_id: context_id.clone(),
                vmware_vm_id: format!("4205-{}", vm_name),
                vm_name: vm_name.to_string(),
                vcenter_host: "vcenter.lab".to_string(),
                datacenter: Some("DC1".to_string()),
                vm_path: format!("/DC1/vm/{}", vm_name),
                credential_id: None,
                cpus: 2,
                memory_mb: 4096,
                os_type: None,
                power_state: None,
                scheduler_enabled: true,
                status: "discovered".to_string(),
                current_job_id: None,
                created_at: chrono::Utc::now().timestamp(),
                updated_at: chrono::Utc::now().timestamp(),
            },
        )
        .await
        .unwrap();

        crate::db::disks::upsert(
            pool,
            &crate::db::disks::VmDiskRecord {
                id: format!("disk-{}-0", vm_name),
                context_id: context_id.clone(),
                disk_index: 0,
                size_gb: 20,
                datastore: Some("datastore1".to_string()),
                vmdk_path: None,
                disk_change_id: String::new(),
                updated_at: chrono::Utc::now().timestamp(),
            },
        )
        .await
        .unwrap();

        context_id
    }

    /// Insert a parent + running child pair directly, as prepared by start
    async fn seed_running_backup(
        pool: &SqlitePool,
        backup_id: &str,
        vm_name: &str,
        disk_indexes: &[i64],
    ) {
        let vbc = dbb::upsert_backup_context(pool, vm_name, "repo-default")
            .await
            .unwrap();

        dbb::insert_job(
            pool,
            &dbb::BackupJobRecord {
                id: backup_id.to_string(),
                vm_backup_context_id: vbc.id.clone(),
                vm_name: vm_name.to_string(),
                repository_id: "repo-default".to_string(),
                backup_type: "full".to_string(),
                status: "running".to_string(),
                bytes_transferred: 0,
                progress_percent: 0.0,
                transfer_speed_bps: 0,
                current_phase: None,
                tags: None,
                error_message: None,
                started_at: chrono::Utc::now().timestamp(),
                completed_at: None,
            },
        )
        .await
        .unwrap();

        for &disk_index in disk_indexes {
            dbb::insert_disk(
                pool,
                &dbb::BackupDiskRecord {
                    id: dbb::disk_record_id(backup_id, disk_index),
                    backup_job_id: backup_id.to_string(),
                    vm_backup_context_id: vbc.id.clone(),
                    disk_index,
                    status: "running".to_string(),
                    qcow2_path: format!("/tmp/{}-disk{}.qcow2", backup_id, disk_index),
                    nbd_port: Some(10100 + disk_index),
                    export_name: Some(dbb::disk_record_id(backup_id, disk_index)),
                    disk_change_id: String::new(),
                    bytes_transferred: 0,
                    error_message: None,
                    started_at: chrono::Utc::now().timestamp(),
                    completed_at: None,
                },
            )
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn test_unknown_vm_is_not_found() {
        let f = fixture().await;

        let result = f
            .orchestrator
            .start_vm_backup(StartBackupRequest {
                vm_name: "ghost".to_string(),
                backup_type: BackupType::Full,
                repository_id: "repo-default".to_string(),
                tags: None,
            })
            .await;

        match result {
            Err(skybridge_common::Error::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_incremental_without_parent_is_rejected_and_compensated() {
        let f = fixture().await;
        seed_context(&f.pool, "pgtest1").await;

        let result = f
            .orchestrator
            .start_vm_backup(StartBackupRequest {
                vm_name: "pgtest1".to_string(),
                backup_type: BackupType::Incremental,
                repository_id: "repo-default".to_string(),
                tags: None,
            })
            .await;

        match result {
            Err(skybridge_common::Error::InvalidRequest(msg)) => {
                assert!(msg.contains("no previous backup found"), "got: {}", msg);
            }
            other => panic!("expected InvalidRequest, got {:?}", other.map(|_| ())),
        }

        // The eagerly-created parent row was compensated away
        let backups = f.orchestrator.list_backups(Some("pgtest1"), None).await.unwrap();
        assert!(backups.is_empty());
        // No ports leaked
        assert!(f.supervisor.active_leases().await.is_empty());
    }

    #[tokio::test]
    async fn test_complete_backup_is_idempotent_and_promotes_parent() {
        let f = fixture().await;
        seed_context(&f.pool, "pgtest1").await;
        seed_running_backup(&f.pool, "backup-pgtest1-100", "pgtest1", &[0]).await;

        // Simulate the armed block server lease
        let port = f.supervisor.allocate("backup-pgtest1-100").await.unwrap();
        assert_eq!(port, 10100);

        let disk = f
            .orchestrator
            .complete_backup("backup-pgtest1-100", 0, "52 de 42 a7/55", 10_737_418_240)
            .await
            .unwrap();
        assert_eq!(disk.status, "completed");
        assert_eq!(disk.disk_change_id, "52 de 42 a7/55");

        // Parent promoted, lease released, change id committed on the context
        let parent = f.orchestrator.get_backup("backup-pgtest1-100").await.unwrap();
        assert_eq!(parent.status, "completed");
        assert!(f.supervisor.active_leases().await.is_empty());

        let context = crate::db::contexts::get_by_name(&f.pool, "pgtest1").await.unwrap();
        let vm_disk = crate::db::disks::get(&f.pool, &context.context_id, 0).await.unwrap();
        assert_eq!(vm_disk.disk_change_id, "52 de 42 a7/55");

        // Second completion call converges to the same state
        let again = f
            .orchestrator
            .complete_backup("backup-pgtest1-100", 0, "52 de 42 a7/55", 10_737_418_240)
            .await
            .unwrap();
        assert_eq!(again.status, "completed");
        assert_eq!(again.disk_change_id, "52 de 42 a7/55");
    }

    #[tokio::test]
    async fn test_child_id_also_resolves_completion() {
        let f = fixture().await;
        seed_context(&f.pool, "pgtest1").await;
        seed_running_backup(&f.pool, "backup-pgtest1-101", "pgtest1", &[0]).await;

        // Callbacks may arrive with the child id; it resolves to the parent
        let disk = f
            .orchestrator
            .complete_backup("backup-pgtest1-101-disk0", 0, "52 aa/9", 1024)
            .await
            .unwrap();
        assert_eq!(disk.backup_job_id, "backup-pgtest1-101");
    }

    #[tokio::test]
    async fn test_empty_change_id_is_rejected() {
        let f = fixture().await;
        seed_context(&f.pool, "pgtest1").await;
        seed_running_backup(&f.pool, "backup-pgtest1-102", "pgtest1", &[0]).await;

        match f
            .orchestrator
            .complete_backup("backup-pgtest1-102", 0, "", 0)
            .await
        {
            Err(skybridge_common::Error::InvalidRequest(_)) => {}
            other => panic!("expected InvalidRequest, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_partial_failure_fails_parent_but_not_siblings() {
        let f = fixture().await;
        seed_context(&f.pool, "pgtest1").await;
        seed_running_backup(&f.pool, "backup-pgtest1-103", "pgtest1", &[0, 1]).await;

        f.orchestrator
            .fail_backup("backup-pgtest1-103", 0, "NBD stream reset")
            .await
            .unwrap();

        let parent = f.orchestrator.get_backup("backup-pgtest1-103").await.unwrap();
        assert_eq!(parent.status, "failed");

        let disks = f.orchestrator.get_backup_disks("backup-pgtest1-103").await.unwrap();
        assert_eq!(disks[0].status, "failed");
        // Sibling keeps running
        assert_eq!(disks[1].status, "running");

        // A late sibling completion does not resurrect the failed parent
        f.orchestrator
            .complete_backup("backup-pgtest1-103", 1, "52 bb/3", 2048)
            .await
            .unwrap();
        let parent = f.orchestrator.get_backup("backup-pgtest1-103").await.unwrap();
        assert_eq!(parent.status, "failed");
    }

    #[tokio::test]
    async fn test_change_id_lookup_for_node() {
        let f = fixture().await;
        seed_context(&f.pool, "pgtest1").await;
        seed_running_backup(&f.pool, "backup-pgtest1-104", "pgtest1", &[0]).await;

        match f.orchestrator.change_id_for_disk("pgtest1", 0).await {
            Err(skybridge_common::Error::NotFound(_)) => {}
            _ => panic!("expected NotFound before any completion"),
        }

        f.orchestrator
            .complete_backup("backup-pgtest1-104", 0, "52 cc/7", 4096)
            .await
            .unwrap();

        let change_id = f.orchestrator.change_id_for_disk("pgtest1", 0).await.unwrap();
        assert_eq!(change_id, "52 cc/7");
    }

    #[tokio::test]
    async fn test_chain_listing() {
        let f = fixture().await;
        seed_context(&f.pool, "pgtest1").await;

        seed_running_backup(&f.pool, "backup-pgtest1-105", "pgtest1", &[0]).await;
        f.orchestrator
            .complete_backup("backup-pgtest1-105", 0, "52 aa/1", 100)
            .await
            .unwrap();

        seed_running_backup(&f.pool, "backup-pgtest1-106", "pgtest1", &[0]).await;
        f.orchestrator
            .complete_backup("backup-pgtest1-106", 0, "52 aa/2", 50)
            .await
            .unwrap();

        let chains = f.orchestrator.chains_for_vm("pgtest1").await.unwrap();
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].disk_index, 0);
        assert_eq!(chains[0].entries.len(), 2);
        // Chain order is oldest first
        assert_eq!(chains[0].entries[0].disk_change_id, "52 aa/1");
        assert_eq!(chains[0].entries[1].disk_change_id, "52 aa/2");
    }

    #[tokio::test]
    async fn test_delete_backup_is_tracked_and_idempotent() {
        let f = fixture().await;
        seed_context(&f.pool, "pgtest1").await;
        seed_running_backup(&f.pool, "backup-pgtest1-107", "pgtest1", &[0]).await;
        f.orchestrator
            .complete_backup("backup-pgtest1-107", 0, "52 dd/1", 100)
            .await
            .unwrap();

        f.orchestrator.delete_backup("backup-pgtest1-107").await.unwrap();

        // The second delete surfaces NotFound (maps to 404)
        match f.orchestrator.delete_backup("backup-pgtest1-107").await {
            Err(skybridge_common::Error::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
    }
}
