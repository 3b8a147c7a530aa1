///! Replication job service
///!
///! Owns the per-VM replication session: destination volumes provisioned
///! through the Volume Daemon, the streaming push dispatched to the Node,
///! and the legacy single-disk change-id bookkeeping keyed by vm_path.
///! Deleting a replication job is a tracked job with explicit compensating
///! steps rather than a database cascade.

use crate::credentials::CredentialService;
use crate::db;
use crate::node::NodeClient;
use crate::tracker::{JobTracker, NewJob};
use crate::volume::VolumeClient;
use serde::{Deserialize, Serialize};
use skybridge_common::{JobStatus, Result};
use sqlx::SqlitePool;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct StartReplicationRequest {
    pub vm_name: String,
    #[serde(default)]
    pub context_id: Option<String>,
    #[serde(default)]
    pub replication_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateReplicationRequest {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreChangeIdRequest {
    pub change_id: String,
    #[serde(default)]
    pub disk_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicationProgress {
    pub job_id: String,
    pub status: String,
    pub bytes_transferred: i64,
    pub progress_percent: f64,
    pub transfer_speed_bps: i64,
    pub current_phase: Option<String>,
}

#[derive(Clone)]
pub struct ReplicationService {
    pool: SqlitePool,
    tracker: JobTracker,
    volumes: VolumeClient,
    node: NodeClient,
    credentials: CredentialService,
}

impl ReplicationService {
    pub fn new(
        pool: SqlitePool,
        tracker: JobTracker,
        volumes: VolumeClient,
        node: NodeClient,
        credentials: CredentialService,
    ) -> Self {
        Self {
            pool,
            tracker,
            volumes,
            node,
            credentials,
        }
    }

    /// Start a replication session for a VM. The context's single job slot
    /// refuses overlapping sessions.
    pub async fn start_replication(
        &self,
        request: StartReplicationRequest,
    ) -> Result<db::replications::ReplicationJobRecord> {
        let context = match &request.context_id {
            Some(id) => db::contexts::get(&self.pool, id).await?,
            None => db::contexts::get_by_name(&self.pool, &request.vm_name).await?,
        };

        let replication_id = format!("repl-{}", uuid::Uuid::new_v4());

        // Serialize per VM before any resource is provisioned
        db::contexts::claim_job_slot(&self.pool, &context.context_id, &replication_id).await?;

        let job_id = self
            .tracker
            .start_job(NewJob {
                job_type: "replication".to_string(),
                operation: "start_replication".to_string(),
                owner: "api".to_string(),
                external_id: Some(replication_id.clone()),
                context_id: Some(context.context_id.clone()),
                ..Default::default()
            })
            .await?;

        let result = self
            .provision_and_dispatch(&job_id, &replication_id, &request, &context)
            .await;

        match result {
            Ok(record) => {
                self.tracker.end_job(&job_id, JobStatus::Completed, None).await?;
                db::contexts::update_status(&self.pool, &context.context_id, "replicating")
                    .await?;
                Ok(record)
            }
            Err(e) => {
                let _ = self
                    .tracker
                    .end_job(&job_id, JobStatus::Failed, Some(&e))
                    .await;
                db::contexts::release_job_slot(
                    &self.pool,
                    &context.context_id,
                    &replication_id,
                )
                .await?;
                Err(e)
            }
        }
    }

    async fn provision_and_dispatch(
        &self,
        job_id: &str,
        replication_id: &str,
        request: &StartReplicationRequest,
        context: &db::contexts::VmContext,
    ) -> Result<db::replications::ReplicationJobRecord> {
        let vm_disks = self
            .tracker
            .run_step(job_id, "resolve-disks", async {
                let vm_disks =
                    db::disks::list_for_context(&self.pool, &context.context_id).await?;
                if vm_disks.is_empty() {
                    return Err(skybridge_common::Error::PreconditionFailed(format!(
                        "VM '{}' has no discovered disks",
                        context.vm_name
                    )));
                }
                Ok(vm_disks)
            })
            .await?;

        // Incremental sessions resume from the legacy per-path change id
        let previous_change_id = db::replications::latest_change_id_by_path(
            &self.pool,
            &context.vm_path,
            None,
        )
        .await?;

        let replication_type = request
            .replication_type
            .clone()
            .unwrap_or_else(|| {
                if previous_change_id.is_some() {
                    "incremental".to_string()
                } else {
                    "initial".to_string()
                }
            });

        let record = db::replications::ReplicationJobRecord {
            id: replication_id.to_string(),
            context_id: context.context_id.clone(),
            vm_name: context.vm_name.clone(),
            replication_type,
            status: "running".to_string(),
            bytes_transferred: 0,
            progress_percent: 0.0,
            transfer_speed_bps: 0,
            current_phase: Some("provisioning".to_string()),
            error_message: None,
            created_at: chrono::Utc::now().timestamp(),
            updated_at: chrono::Utc::now().timestamp(),
            completed_at: None,
        };
        db::replications::insert(&self.pool, &record).await?;

        // One destination volume per source disk
        self.tracker
            .run_step(job_id, "provision-volumes", async {
                for vm_disk in &vm_disks {
                    let operation = self
                        .volumes
                        .create_volume(
                            &format!("{}-disk{}", context.vm_name, vm_disk.disk_index),
                            vm_disk.size_gb.max(1),
                        )
                        .await?;
                    let status = self.volumes.wait_for_completion(&operation.operation_id).await?;

                    let volume_id = status
                        .volume_id
                        .or(operation.volume_id)
                        .ok_or_else(|| {
                            skybridge_common::Error::System(
                                "volume daemon returned no volume id".to_string(),
                            )
                        })?;

                    db::replications::add_volume(
                        &self.pool,
                        &db::replications::ReplicationVolumeRecord {
                            id: format!("rvol-{}", uuid::Uuid::new_v4()),
                            replication_job_id: replication_id.to_string(),
                            disk_index: vm_disk.disk_index,
                            volume_id,
                            mount_point: None,
                            created_at: chrono::Utc::now().timestamp(),
                        },
                    )
                    .await?;
                }
                Ok(())
            })
            .await?;

        self.tracker
            .run_step(job_id, "notify-node", async {
                let credential = self.credentials.for_host(&context.vcenter_host).await?;
                self.node
                    .start_replication(&crate::node::NodeReplicationRequest {
                        vm_name: context.vm_name.clone(),
                        vcenter_host: credential.vcenter_host.clone(),
                        vcenter_user: credential.username.clone(),
                        vcenter_password: credential.password.clone(),
                        vm_path: context.vm_path.clone(),
                        job_id: replication_id.to_string(),
                        previous_change_id: previous_change_id
                            .unwrap_or_else(|| "PLACEHOLDER".to_string()),
                    })
                    .await
            })
            .await?;

        db::replications::update_status(&self.pool, replication_id, "running", None).await?;
        info!(
            "Replication {} dispatched for '{}'",
            replication_id, context.vm_name
        );

        db::replications::get(&self.pool, replication_id).await
    }

    pub async fn get(&self, id: &str) -> Result<db::replications::ReplicationJobRecord> {
        db::replications::get(&self.pool, id).await
    }

    pub async fn list(
        &self,
        context_id: Option<&str>,
    ) -> Result<Vec<db::replications::ReplicationJobRecord>> {
        db::replications::list(&self.pool, context_id).await
    }

    pub async fn update(
        &self,
        id: &str,
        request: UpdateReplicationRequest,
    ) -> Result<db::replications::ReplicationJobRecord> {
        let existing = db::replications::get(&self.pool, id).await?;

        if let Some(status) = request.status.as_deref() {
            if skybridge_common::JobStatus::parse(&existing.status).is_terminal()
                && status != existing.status
            {
                return Err(skybridge_common::Error::Conflict(format!(
                    "replication job '{}' already ended as {}",
                    id, existing.status
                )));
            }
            db::replications::update_status(
                &self.pool,
                id,
                status,
                request.error_message.as_deref(),
            )
            .await?;

            if skybridge_common::JobStatus::parse(status).is_terminal() {
                db::contexts::release_job_slot(&self.pool, &existing.context_id, id).await?;
            }
        }

        db::replications::get(&self.pool, id).await
    }

    /// Delete a replication job through a tracked job with compensators:
    /// free daemon volumes, drop mounts, then cascade rows. Failover jobs
    /// that referenced it survive with the reference nulled.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let record = db::replications::get(&self.pool, id).await?;

        let job_id = self
            .tracker
            .start_job(NewJob {
                job_type: "replication".to_string(),
                operation: "delete_replication".to_string(),
                owner: "api".to_string(),
                context_id: Some(record.context_id.clone()),
                metadata: Some(serde_json::json!({ "replication_job_id": id })),
                ..Default::default()
            })
            .await?;

        let result: Result<()> = async {
            let volumes = self
                .tracker
                .run_step(&job_id, "release-volumes", async {
                    let volumes = db::replications::list_volumes(&self.pool, id).await?;
                    for volume in &volumes {
                        let operation = self.volumes.delete_volume(&volume.volume_id).await?;
                        self.volumes.wait_for_completion(&operation.operation_id).await?;
                    }
                    Ok(volumes)
                })
                .await?;

            self.tracker
                .run_step(&job_id, "drop-mounts", async {
                    for volume in &volumes {
                        if let Some(ref mount_point) = volume.mount_point {
                            let output = tokio::process::Command::new("umount")
                                .arg(mount_point)
                                .output()
                                .await;
                            if let Ok(output) = output {
                                if !output.status.success() {
                                    warn!(
                                        "umount of {} reported: {}",
                                        mount_point,
                                        String::from_utf8_lossy(&output.stderr)
                                    );
                                }
                            }
                        }
                    }
                    Ok(())
                })
                .await?;

            self.tracker
                .run_step(&job_id, "delete-records", async {
                    db::replications::delete(&self.pool, id).await
                })
                .await?;

            Ok(())
        }
        .await;

        db::contexts::release_job_slot(&self.pool, &record.context_id, id).await?;

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

    /// Legacy single-disk change-id lookup keyed by vm_path. The multi-disk
    /// backup path coexists deliberately; neither replaces the other.
    pub async fn change_id_by_path(
        &self,
        vm_path: &str,
        disk_id: Option<&str>,
    ) -> Result<String> {
        db::replications::latest_change_id_by_path(&self.pool, vm_path, disk_id)
            .await?
            .ok_or_else(|| {
                skybridge_common::Error::NotFound(format!(
                    "no change id recorded for '{}'",
                    vm_path
                ))
            })
    }

    /// Record the change id delivered by the Node at sync completion
    pub async fn store_change_id(
        &self,
        job_id: &str,
        request: StoreChangeIdRequest,
    ) -> Result<()> {
        if request.change_id.is_empty() {
            return Err(skybridge_common::Error::InvalidRequest(
                "change_id must not be empty".to_string(),
            ));
        }

        let job = db::replications::get(&self.pool, job_id).await?;
        let context = db::contexts::get(&self.pool, &job.context_id).await?;

        db::replications::record_change_id(
            &self.pool,
            job_id,
            &context.vm_path,
            request.disk_id.as_deref().unwrap_or("disk-2000"),
            &request.change_id,
        )
        .await
    }

    pub async fn progress(&self, job_id: &str) -> Result<ReplicationProgress> {
        let job = db::replications::get(&self.pool, job_id).await?;
        Ok(ReplicationProgress {
            job_id: job.id,
            status: job.status,
            bytes_transferred: job.bytes_transferred,
            progress_percent: job.progress_percent,
            transfer_speed_bps: job.transfer_speed_bps,
            current_phase: job.current_phase,
        })
    }

    /// Live progress proxied from the Node over the tunnel
    pub async fn proxy_progress(&self, job_id: &str) -> Result<crate::node::NodeProgress> {
        self.node.job_progress(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _db: crate::db::Database,
        pool: SqlitePool,
        service: ReplicationService,
    }

    async fn fixture() -> Fixture {
        let database = crate::db::Database::new("sqlite::memory:").await.unwrap();
        database.migrate().await.unwrap();
        let pool = database.pool().clone();

        let service = ReplicationService::new(
            pool.clone(),
            JobTracker::new(pool.clone()),
            VolumeClient::new("http://localhost:1", std::time::Duration::from_secs(1)),
            NodeClient::new(9081, std::time::Duration::from_secs(1), 1),
            CredentialService::with_key(pool.clone(), [5u8; 32]),
        );

        Fixture {
            _db: database,
            pool,
            service,
        }
    }

    async fn seed_context(pool: &SqlitePool) {
        crate::db::contexts::create(
            pool,
            &crate::db::contexts::VmContext {
                context_id: "ctx-1".to_string(),
                vmware_vm_id: "4205-1".to_string(),
                vm_name: "pgtest1".to_string(),
                vcenter_host: "vcenter.lab".to_string(),
                datacenter: None,
                vm_path: "/DC1/vm/pgtest1".to_string(),
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
    }

    async fn seed_job(pool: &SqlitePool, id: &str, status: &str) {
        crate::db::replications::insert(
            pool,
            &crate::db::replications::ReplicationJobRecord {
                id: id.to_string(),
                context_id: "ctx-1".to_string(),
                vm_name: "pgtest1".to_string(),
                replication_type: "initial".to_string(),
                status: status.to_string(),
                bytes_transferred: 0,
                progress_percent: 0.0,
                transfer_speed_bps: 0,
                current_phase: None,
                error_message: None,
                created_at: chrono::Utc::now().timestamp(),
                updated_at: chrono::Utc::now().timestamp(),
                completed_at: None,
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_start_requires_known_vm() {
        let f = fixture().await;
        let result = f
            .service
            .start_replication(StartReplicationRequest {
                vm_name: "ghost".to_string(),
                context_id: None,
                replication_type: None,
            })
            .await;

        match result {
            Err(skybridge_common::Error::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_overlapping_session_is_refused_and_slot_released_on_failure() {
        let f = fixture().await;
        seed_context(&f.pool).await;

        // The context has no discovered disks, so the start fails during
        // preparation; what matters is the slot lifecycle around it.
        let first = f
            .service
            .start_replication(StartReplicationRequest {
                vm_name: "pgtest1".to_string(),
                context_id: None,
                replication_type: None,
            })
            .await;
        assert!(first.is_err());

        // The failed start released the slot, so a retry is not Conflict
        let ctx = crate::db::contexts::get(&f.pool, "ctx-1").await.unwrap();
        assert!(ctx.current_job_id.is_none());

        // An occupied slot refuses a second session
        crate::db::contexts::claim_job_slot(&f.pool, "ctx-1", "repl-held").await.unwrap();
        let second = f
            .service
            .start_replication(StartReplicationRequest {
                vm_name: "pgtest1".to_string(),
                context_id: None,
                replication_type: None,
            })
            .await;
        match second {
            Err(skybridge_common::Error::Conflict(_)) => {}
            other => panic!("expected Conflict, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_change_id_round_trip() {
        let f = fixture().await;
        seed_context(&f.pool).await;
        seed_job(&f.pool, "repl-1", "running").await;

        match f.service.change_id_by_path("/DC1/vm/pgtest1", None).await {
            Err(skybridge_common::Error::NotFound(_)) => {}
            _ => panic!("expected NotFound before any record"),
        }

        f.service
            .store_change_id(
                "repl-1",
                StoreChangeIdRequest {
                    change_id: "52 aa bb/17".to_string(),
                    disk_id: None,
                },
            )
            .await
            .unwrap();

        let change_id = f
            .service
            .change_id_by_path("/DC1/vm/pgtest1", None)
            .await
            .unwrap();
        assert_eq!(change_id, "52 aa bb/17");

        // The disk-scoped lookup path stays functional alongside
        let scoped = f
            .service
            .change_id_by_path("/DC1/vm/pgtest1", Some("disk-2000"))
            .await
            .unwrap();
        assert_eq!(scoped, "52 aa bb/17");
    }

    #[tokio::test]
    async fn test_empty_change_id_is_rejected() {
        let f = fixture().await;
        seed_context(&f.pool).await;
        seed_job(&f.pool, "repl-1", "running").await;

        let result = f
            .service
            .store_change_id(
                "repl-1",
                StoreChangeIdRequest {
                    change_id: String::new(),
                    disk_id: None,
                },
            )
            .await;
        match result {
            Err(skybridge_common::Error::InvalidRequest(_)) => {}
            other => panic!("expected InvalidRequest, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_terminal_update_releases_slot_and_is_write_once() {
        let f = fixture().await;
        seed_context(&f.pool).await;
        seed_job(&f.pool, "repl-1", "running").await;
        crate::db::contexts::claim_job_slot(&f.pool, "ctx-1", "repl-1").await.unwrap();

        f.service
            .update(
                "repl-1",
                UpdateReplicationRequest {
                    status: Some("completed".to_string()),
                    error_message: None,
                },
            )
            .await
            .unwrap();

        let ctx = crate::db::contexts::get(&f.pool, "ctx-1").await.unwrap();
        assert!(ctx.current_job_id.is_none());

        // Terminal status cannot be rewritten
        let result = f
            .service
            .update(
                "repl-1",
                UpdateReplicationRequest {
                    status: Some("failed".to_string()),
                    error_message: Some("late".to_string()),
                },
            )
            .await;
        match result {
            Err(skybridge_common::Error::Conflict(_)) => {}
            other => panic!("expected Conflict, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_delete_without_volumes_is_tracked() {
        let f = fixture().await;
        seed_context(&f.pool).await;
        seed_job(&f.pool, "repl-1", "completed").await;

        f.service.delete("repl-1").await.unwrap();

        match f.service.get("repl-1").await {
            Err(skybridge_common::Error::NotFound(_)) => {}
            _ => panic!("expected NotFound after delete"),
        }
    }
}
