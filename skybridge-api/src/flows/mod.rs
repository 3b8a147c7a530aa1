///! Protection flows
///!
///! A flow aggregates {target, repository, policy, schedule, enabled} into
///! one addressable entity. Executing a flow fans out one child job per VM
///! through the backup orchestrator or the replication service, with a
///! semaphore enforcing the concurrency cap; VMs beyond the cap sit in the
///! queued state until a slot frees up.

use crate::backup::{BackupOrchestrator, StartBackupRequest};
use crate::db;
use crate::replication::{ReplicationService, StartReplicationRequest};
use serde::{Deserialize, Serialize};
use skybridge_common::{BackupType, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateFlowRequest {
    pub name: String,
    pub flow_type: String,
    pub target_type: String,
    pub target_id: String,
    #[serde(default)]
    pub repository_id: Option<String>,
    #[serde(default)]
    pub policy_id: Option<String>,
    #[serde(default)]
    pub schedule_id: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkFlowRequest {
    pub flow_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub flow_id: String,
    pub vms_total: usize,
    pub vms_succeeded: usize,
    pub vms_failed: usize,
    pub executions: Vec<db::flows::FlowExecutionRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowStatus {
    pub flow: db::flows::ProtectionFlowRecord,
    pub recent_executions: Vec<db::flows::FlowExecutionRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowSummary {
    pub total_flows: usize,
    pub enabled_flows: usize,
    pub executions_today: i64,
    pub by_status: std::collections::HashMap<String, i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DryRunTarget {
    pub context_id: String,
    pub vm_name: String,
    pub eligible: bool,
    pub reason: Option<String>,
}

#[derive(Clone)]
pub struct ProtectionFlowService {
    pool: SqlitePool,
    backups: BackupOrchestrator,
    replications: ReplicationService,
}

impl ProtectionFlowService {
    pub fn new(
        pool: SqlitePool,
        backups: BackupOrchestrator,
        replications: ReplicationService,
    ) -> Self {
        Self {
            pool,
            backups,
            replications,
        }
    }

    pub async fn create(&self, request: CreateFlowRequest) -> Result<db::flows::ProtectionFlowRecord> {
        validate_flow_shape(&request)?;

        // The target must exist up front
        match request.target_type.as_str() {
            "vm" => {
                db::contexts::get(&self.pool, &request.target_id).await?;
            }
            "group" => {
                db::groups::get(&self.pool, &request.target_id).await?;
            }
            _ => unreachable!("validated above"),
        }

        let flow = db::flows::ProtectionFlowRecord {
            id: format!("flow-{}", uuid::Uuid::new_v4()),
            name: request.name,
            flow_type: request.flow_type,
            target_type: request.target_type,
            target_id: request.target_id,
            repository_id: request.repository_id,
            policy_id: request.policy_id,
            schedule_id: request.schedule_id,
            enabled: request.enabled,
            last_execution_id: None,
            last_execution_status: None,
            last_execution_at: None,
            next_execution_at: None,
            created_at: chrono::Utc::now().timestamp(),
            updated_at: chrono::Utc::now().timestamp(),
        };

        db::flows::create(&self.pool, &flow).await?;
        info!("Created protection flow '{}' ({})", flow.name, flow.id);
        Ok(flow)
    }

    pub async fn get(&self, id: &str) -> Result<db::flows::ProtectionFlowRecord> {
        db::flows::get(&self.pool, id).await
    }

    pub async fn list(&self) -> Result<Vec<db::flows::ProtectionFlowRecord>> {
        db::flows::list(&self.pool).await
    }

    pub async fn update(&self, flow: db::flows::ProtectionFlowRecord) -> Result<()> {
        db::flows::update(&self.pool, &flow).await
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        db::flows::set_enabled(&self.pool, id, enabled).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        db::flows::delete(&self.pool, id).await
    }

    pub async fn bulk_enabled(&self, ids: &[String], enabled: bool) -> Result<usize> {
        let mut changed = 0;
        for id in ids {
            match db::flows::set_enabled(&self.pool, id, enabled).await {
                Ok(()) => changed += 1,
                Err(skybridge_common::Error::NotFound(_)) => {
                    warn!("Bulk toggle skipped unknown flow '{}'", id)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(changed)
    }

    pub async fn bulk_delete(&self, ids: &[String]) -> Result<usize> {
        let mut deleted = 0;
        for id in ids {
            match db::flows::delete(&self.pool, id).await {
                Ok(()) => deleted += 1,
                Err(skybridge_common::Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }

    /// Resolve the VMs a fan-out would touch, with eligibility reasons
    pub async fn resolve_targets(&self, flow: &db::flows::ProtectionFlowRecord) -> Result<Vec<DryRunTarget>> {
        let contexts = match flow.target_type.as_str() {
            "vm" => vec![db::contexts::get(&self.pool, &flow.target_id).await?],
            "group" => {
                let members = db::groups::list_members(&self.pool, &flow.target_id).await?;
                let mut contexts = Vec::with_capacity(members.len());
                for member in members {
                    if !member.enabled {
                        continue;
                    }
                    contexts.push(db::contexts::get(&self.pool, &member.context_id).await?);
                }
                contexts
            }
            other => {
                return Err(skybridge_common::Error::InvalidRequest(format!(
                    "unknown target type '{}'",
                    other
                )))
            }
        };

        Ok(contexts
            .into_iter()
            .map(|ctx| {
                let (eligible, reason) = if !ctx.scheduler_enabled {
                    (false, Some("scheduler disabled for this VM".to_string()))
                } else if let Some(ref job) = ctx.current_job_id {
                    (false, Some(format!("job '{}' already active", job)))
                } else {
                    (true, None)
                };
                DryRunTarget {
                    context_id: ctx.context_id,
                    vm_name: ctx.vm_name,
                    eligible,
                    reason,
                }
            })
            .collect())
    }

    /// Fan out one child job per eligible VM, capped by `max_concurrent`.
    /// Returns once the whole batch has drained.
    pub async fn execute_flow(&self, flow_id: &str, max_concurrent: i64) -> Result<BatchSummary> {
        let flow = db::flows::get(&self.pool, flow_id).await?;
        let targets = self.resolve_targets(&flow).await?;
        let eligible: Vec<&DryRunTarget> = targets.iter().filter(|t| t.eligible).collect();

        let batch_id = format!("batch-{}", uuid::Uuid::new_v4());
        info!(
            "Executing flow '{}': {} eligible VM(s), cap {}",
            flow.name,
            eligible.len(),
            max_concurrent
        );

        // Every eligible VM gets a queued row before anything runs
        let mut execution_ids = Vec::with_capacity(eligible.len());
        for target in &eligible {
            let execution = db::flows::FlowExecutionRecord {
                id: format!("exec-{}", uuid::Uuid::new_v4()),
                flow_id: flow.id.clone(),
                batch_id: batch_id.clone(),
                context_id: Some(target.context_id.clone()),
                vm_name: Some(target.vm_name.clone()),
                status: "queued".to_string(),
                job_id: None,
                error_message: None,
                queued_at: chrono::Utc::now().timestamp(),
                started_at: None,
                completed_at: None,
            };
            db::flows::insert_execution(&self.pool, &execution).await?;
            execution_ids.push((execution.id, target.vm_name.clone()));
        }

        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1) as usize));
        let mut handles = Vec::with_capacity(execution_ids.len());

        for (execution_id, vm_name) in execution_ids {
            let permit_pool = semaphore.clone();
            let service = self.clone();
            let flow = flow.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit_pool.acquire_owned().await.ok()?;

                if let Err(e) = db::flows::mark_execution_running(&service.pool, &execution_id).await
                {
                    warn!("Failed to start execution {}: {}", execution_id, e);
                }

                let outcome = service.run_child(&flow, &vm_name).await;
                let (status, job_id, error) = match outcome {
                    Ok(job_id) => ("completed", job_id, None),
                    Err(e) => ("failed", None, Some(e.to_string())),
                };

                if let Err(e) = db::flows::finish_execution(
                    &service.pool,
                    &execution_id,
                    status,
                    job_id.as_deref(),
                    error.as_deref(),
                )
                .await
                {
                    warn!("Failed to finish execution {}: {}", execution_id, e);
                }

                Some(status == "completed")
            });
            handles.push(handle);
        }

        let mut succeeded = 0;
        let mut failed = 0;
        for handle in handles {
            match handle.await {
                Ok(Some(true)) => succeeded += 1,
                Ok(Some(false)) | Ok(None) => failed += 1,
                Err(e) => {
                    warn!("Flow child task panicked: {}", e);
                    failed += 1;
                }
            }
        }

        let batch_status = if failed == 0 { "completed" } else { "failed" };
        db::flows::record_last_execution(&self.pool, &flow.id, &batch_id, batch_status).await?;

        let executions = db::flows::list_batch(&self.pool, &batch_id).await?;
        Ok(BatchSummary {
            batch_id,
            flow_id: flow.id,
            vms_total: executions.len(),
            vms_succeeded: succeeded,
            vms_failed: failed,
            executions,
        })
    }

    async fn run_child(
        &self,
        flow: &db::flows::ProtectionFlowRecord,
        vm_name: &str,
    ) -> Result<Option<String>> {
        match flow.flow_type.as_str() {
            "backup" => {
                let repository_id = flow.repository_id.clone().ok_or_else(|| {
                    skybridge_common::Error::PreconditionFailed(format!(
                        "backup flow '{}' has no repository",
                        flow.name
                    ))
                })?;

                // Chains grow incrementally once a full exists
                let backup_type = match self.backups.change_id_for_disk(vm_name, 0).await {
                    Ok(_) => BackupType::Incremental,
                    Err(skybridge_common::Error::NotFound(_)) => BackupType::Full,
                    Err(e) => return Err(e),
                };

                let response = self
                    .backups
                    .start_vm_backup(StartBackupRequest {
                        vm_name: vm_name.to_string(),
                        backup_type,
                        repository_id,
                        tags: Some(vec![format!("flow:{}", flow.id)]),
                    })
                    .await?;
                Ok(Some(response.backup_id))
            }
            "replication" => {
                let record = self
                    .replications
                    .start_replication(StartReplicationRequest {
                        vm_name: vm_name.to_string(),
                        context_id: None,
                        replication_type: None,
                    })
                    .await?;
                Ok(Some(record.id))
            }
            other => Err(skybridge_common::Error::InvalidRequest(format!(
                "unknown flow type '{}'",
                other
            ))),
        }
    }

    pub async fn executions(&self, flow_id: &str, limit: i64) -> Result<Vec<db::flows::FlowExecutionRecord>> {
        db::flows::get(&self.pool, flow_id).await?;
        db::flows::list_executions(&self.pool, flow_id, limit).await
    }

    pub async fn status(&self, flow_id: &str) -> Result<FlowStatus> {
        let flow = db::flows::get(&self.pool, flow_id).await?;
        let recent_executions = db::flows::list_executions(&self.pool, flow_id, 20).await?;
        Ok(FlowStatus {
            flow,
            recent_executions,
        })
    }

    pub async fn has_live_execution(&self, flow_id: &str) -> Result<bool> {
        db::flows::has_live_execution(&self.pool, flow_id).await
    }

    pub async fn list_for_schedule(
        &self,
        schedule_id: &str,
    ) -> Result<Vec<db::flows::ProtectionFlowRecord>> {
        db::flows::list_for_schedule(&self.pool, schedule_id).await
    }

    /// Aggregate view: today's executions and per-status counts
    pub async fn summary(&self) -> Result<FlowSummary> {
        let flows = db::flows::list(&self.pool).await?;
        let midnight = chrono::Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(0);

        let counts = db::flows::summary(&self.pool, midnight).await?;
        let executions_today = counts.iter().map(|(_, n)| n).sum();

        Ok(FlowSummary {
            total_flows: flows.len(),
            enabled_flows: flows.iter().filter(|f| f.enabled).count(),
            executions_today,
            by_status: counts.into_iter().collect(),
        })
    }
}

fn validate_flow_shape(request: &CreateFlowRequest) -> Result<()> {
    match request.flow_type.as_str() {
        "backup" => {
            if request.repository_id.is_none() {
                return Err(skybridge_common::Error::InvalidRequest(
                    "backup flows require a repository_id".to_string(),
                ));
            }
        }
        "replication" => {}
        other => {
            return Err(skybridge_common::Error::InvalidRequest(format!(
                "unknown flow_type '{}', expected backup or replication",
                other
            )))
        }
    }

    match request.target_type.as_str() {
        "vm" | "group" => Ok(()),
        other => Err(skybridge_common::Error::InvalidRequest(format!(
            "unknown target_type '{}', expected vm or group",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockserver::BlockServerSupervisor;
    use crate::credentials::CredentialService;
    use crate::node::NodeClient;
    use crate::repository::RepositoryManager;
    use crate::tracker::JobTracker;
    use crate::volume::VolumeClient;

    struct Fixture {
        _db: crate::db::Database,
        pool: SqlitePool,
        service: ProtectionFlowService,
    }

    async fn fixture() -> Fixture {
        let database = crate::db::Database::new("sqlite::memory:").await.unwrap();
        database.migrate().await.unwrap();
        let pool = database.pool().clone();

        let tracker = JobTracker::new(pool.clone());
        let repositories =
            RepositoryManager::new(pool.clone(), std::env::temp_dir().join("skybridge-flows"));
        repositories.ensure_default().await.unwrap();

        let supervisor = Arc::new(BlockServerSupervisor::new(&crate::config::BlockServerConfig {
            binary: "qemu-nbd".to_string(),
            port_low: 10100,
            port_high: 10110,
            advertise_host: "127.0.0.1".to_string(),
        }));
        let credentials = CredentialService::with_key(pool.clone(), [9u8; 32]);
        let node = NodeClient::new(9081, std::time::Duration::from_secs(1), 1);
        let volumes = VolumeClient::new("http://localhost:1", std::time::Duration::from_secs(1));

        let backups = BackupOrchestrator::new(
            pool.clone(),
            tracker.clone(),
            repositories,
            supervisor,
            credentials.clone(),
            node.clone(),
        );
        let replications =
            ReplicationService::new(pool.clone(), tracker, volumes, node, credentials);

        Fixture {
            _db: database,
            pool: pool.clone(),
            service: ProtectionFlowService::new(pool, backups, replications),
        }
    }

    async fn seed_context(pool: &SqlitePool, id: &str, name: &str, busy: bool) {
        crate::db::contexts::create(
            pool,
            &crate::db::contexts::VmContext {
                context_id: id.to_string(),
                vmware_vm_id: format!("4205-{}", id),
                vm_name: name.to_string(),
                vcenter_host: "vcenter.lab".to_string(),
                datacenter: None,
                vm_path: format!("/DC1/vm/{}", name),
                credential_id: None,
                cpus: 2,
                memory_mb: 4096,
                os_type: None,
                power_state: None,
                scheduler_enabled: true,
                status: "discovered".to_string(),
                current_job_id: if busy { Some("job-busy".to_string()) } else { None },
                created_at: chrono::Utc::now().timestamp(),
                updated_at: chrono::Utc::now().timestamp(),
            },
        )
        .await
        .unwrap();
    }

    async fn seed_group(pool: &SqlitePool, group_id: &str, member_ids: &[&str]) {
        crate::db::groups::create(
            pool,
            &crate::db::groups::MachineGroupRecord {
                id: group_id.to_string(),
                name: format!("group-{}", group_id),
                description: None,
                schedule_id: None,
                created_at: chrono::Utc::now().timestamp(),
                updated_at: chrono::Utc::now().timestamp(),
            },
        )
        .await
        .unwrap();

        for member in member_ids {
            crate::db::groups::add_member(
                pool,
                &crate::db::groups::GroupMembershipRecord {
                    id: format!("mem-{}", member),
                    group_id: group_id.to_string(),
                    context_id: member.to_string(),
                    enabled: true,
                    priority: 0,
                    created_at: chrono::Utc::now().timestamp(),
                },
            )
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn test_flow_shape_validation() {
        let f = fixture().await;

        let result = f
            .service
            .create(CreateFlowRequest {
                name: "nightly".to_string(),
                flow_type: "backup".to_string(),
                target_type: "vm".to_string(),
                target_id: "ctx-1".to_string(),
                repository_id: None,
                policy_id: None,
                schedule_id: None,
                enabled: true,
            })
            .await;
        match result {
            Err(skybridge_common::Error::InvalidRequest(msg)) => {
                assert!(msg.contains("repository_id"));
            }
            other => panic!("expected InvalidRequest, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_target_resolution_excludes_busy_vms() {
        let f = fixture().await;
        seed_context(&f.pool, "ctx-1", "vm-a", false).await;
        seed_context(&f.pool, "ctx-2", "vm-b", true).await;
        seed_group(&f.pool, "grp-1", &["ctx-1", "ctx-2"]).await;

        let flow = f
            .service
            .create(CreateFlowRequest {
                name: "group-backup".to_string(),
                flow_type: "backup".to_string(),
                target_type: "group".to_string(),
                target_id: "grp-1".to_string(),
                repository_id: Some("repo-default".to_string()),
                policy_id: None,
                schedule_id: None,
                enabled: true,
            })
            .await
            .unwrap();

        let targets = f.service.resolve_targets(&flow).await.unwrap();
        assert_eq!(targets.len(), 2);

        let a = targets.iter().find(|t| t.vm_name == "vm-a").unwrap();
        assert!(a.eligible);
        let b = targets.iter().find(|t| t.vm_name == "vm-b").unwrap();
        assert!(!b.eligible);
        assert!(b.reason.as_deref().unwrap().contains("job-busy"));
    }

    #[tokio::test]
    async fn test_fan_out_records_one_execution_per_vm() {
        let f = fixture().await;
        // Contexts without disks: every child fails fast, which is fine for
        // asserting the batch bookkeeping.
        seed_context(&f.pool, "ctx-1", "vm-a", false).await;
        seed_context(&f.pool, "ctx-2", "vm-b", false).await;
        seed_context(&f.pool, "ctx-3", "vm-c", false).await;
        seed_group(&f.pool, "grp-1", &["ctx-1", "ctx-2", "ctx-3"]).await;

        let flow = f
            .service
            .create(CreateFlowRequest {
                name: "group-backup".to_string(),
                flow_type: "backup".to_string(),
                target_type: "group".to_string(),
                target_id: "grp-1".to_string(),
                repository_id: Some("repo-default".to_string()),
                policy_id: None,
                schedule_id: None,
                enabled: true,
            })
            .await
            .unwrap();

        let summary = f.service.execute_flow(&flow.id, 2).await.unwrap();
        assert_eq!(summary.vms_total, 3);
        assert_eq!(summary.vms_succeeded, 0);
        assert_eq!(summary.vms_failed, 3);

        // Every execution reached a terminal state with an error recorded
        for execution in &summary.executions {
            assert_eq!(execution.status, "failed");
            assert!(execution.error_message.is_some());
            assert!(execution.completed_at.is_some());
        }

        // The flow remembers its last batch
        let flow = f.service.get(&flow.id).await.unwrap();
        assert_eq!(flow.last_execution_id.as_deref(), Some(summary.batch_id.as_str()));
        assert_eq!(flow.last_execution_status.as_deref(), Some("failed"));

        assert!(!f.service.has_live_execution(&flow.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_bulk_toggle_and_delete() {
        let f = fixture().await;
        seed_context(&f.pool, "ctx-1", "vm-a", false).await;

        let flow = f
            .service
            .create(CreateFlowRequest {
                name: "single".to_string(),
                flow_type: "replication".to_string(),
                target_type: "vm".to_string(),
                target_id: "ctx-1".to_string(),
                repository_id: None,
                policy_id: None,
                schedule_id: None,
                enabled: true,
            })
            .await
            .unwrap();

        let changed = f
            .service
            .bulk_enabled(&[flow.id.clone(), "flow-ghost".to_string()], false)
            .await
            .unwrap();
        assert_eq!(changed, 1);
        assert!(!f.service.get(&flow.id).await.unwrap().enabled);

        let deleted = f
            .service
            .bulk_delete(&[flow.id.clone(), "flow-ghost".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
    }

    #[tokio::test]
    async fn test_summary_counts() {
        let f = fixture().await;
        seed_context(&f.pool, "ctx-1", "vm-a", false).await;
        seed_group(&f.pool, "grp-1", &["ctx-1"]).await;

        let flow = f
            .service
            .create(CreateFlowRequest {
                name: "group-backup".to_string(),
                flow_type: "backup".to_string(),
                target_type: "group".to_string(),
                target_id: "grp-1".to_string(),
                repository_id: Some("repo-default".to_string()),
                policy_id: None,
                schedule_id: None,
                enabled: true,
            })
            .await
            .unwrap();

        f.service.execute_flow(&flow.id, 1).await.unwrap();

        let summary = f.service.summary().await.unwrap();
        assert_eq!(summary.total_flows, 1);
        assert_eq!(summary.enabled_flows, 1);
        assert_eq!(summary.executions_today, 1);
        assert_eq!(summary.by_status.get("failed").copied(), Some(1));
    }
}
