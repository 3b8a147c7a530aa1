///! Unified failover engine
///!
///! A single entry point resolves a declarative request into a concrete plan
///! for either a test or live failover and drives it through a fixed state
///! machine: pending -> validating -> snapshotting -> creating_vm ->
///! switching_volume -> powering_on -> completed, with any state able to
///! fall to failed. Execution always runs in a detached task: the HTTP
///! request gets a 202 and its cancellation never reaches the engine.

pub mod rollback;

use crate::backup::BackupOrchestrator;
use crate::cloudstack::{CloudStackClient, DeployVmRequest};
use crate::db;
use crate::node::NodeClient;
use crate::tracker::{JobTracker, NewJob};
use crate::volume::VolumeClient;
use serde::{Deserialize, Serialize};
use skybridge_common::{BackupType, FailoverType, JobStatus, Result};
use sqlx::SqlitePool;
use std::collections::HashMap;
use tracing::{error, info, warn};

fn default_vm_naming() -> String {
    "exact".to_string()
}

/// Declarative failover request; unset options resolve to per-flavor
/// defaults (see `preflight_config`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedFailoverRequest {
    pub context_id: String,
    pub vmware_vm_id: String,
    pub vm_name: String,
    pub failover_type: FailoverType,
    #[serde(default)]
    pub power_off_source: bool,
    #[serde(default)]
    pub perform_final_sync: bool,
    #[serde(default)]
    pub skip_validation: bool,
    #[serde(default)]
    pub skip_virtio: bool,
    #[serde(default)]
    pub network_strategy: Option<String>,
    #[serde(default = "default_vm_naming")]
    pub vm_naming: String,
    #[serde(default)]
    pub test_duration: Option<String>,
    #[serde(default)]
    pub network_mappings: Option<HashMap<String, String>>,
    #[serde(default)]
    pub service_offering_id: Option<String>,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub zone_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreflightCheck {
    pub check: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreflightConfig {
    pub failover_type: FailoverType,
    pub vm_naming: String,
    pub network_strategy: String,
    pub power_off_source: bool,
    pub perform_final_sync: bool,
    pub skip_validation: bool,
    pub skip_virtio: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackDecision {
    pub vm_name: String,
    pub failover_type: FailoverType,
    pub decision: String,
    pub destination_vm_id: Option<String>,
    pub snapshot_count: usize,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub checks: Vec<PreflightCheck>,
}

/// Defaults per flavor: test failovers suffix the destination name and use
/// test networks; live failovers keep the exact name and live networks.
pub fn preflight_config(failover_type: FailoverType) -> PreflightConfig {
    match failover_type {
        FailoverType::Test => PreflightConfig {
            failover_type,
            vm_naming: "suffixed".to_string(),
            network_strategy: "test".to_string(),
            power_off_source: false,
            perform_final_sync: false,
            skip_validation: false,
            skip_virtio: false,
        },
        FailoverType::Live => PreflightConfig {
            failover_type,
            vm_naming: "exact".to_string(),
            network_strategy: "live".to_string(),
            power_off_source: true,
            perform_final_sync: true,
            skip_validation: false,
            skip_virtio: false,
        },
    }
}

/// Destination VM name under the requested naming policy
pub fn destination_vm_name(
    vm_name: &str,
    vm_naming: &str,
    failover_type: FailoverType,
    timestamp: i64,
) -> String {
    match vm_naming {
        "suffixed" => format!("{}-{}-{}", vm_name, failover_type, timestamp),
        _ => vm_name.to_string(),
    }
}

/// Structural validation that needs no remote calls
pub fn validate_request(request: &UnifiedFailoverRequest) -> Result<()> {
    if request.vm_name.is_empty() || request.context_id.is_empty() {
        return Err(skybridge_common::Error::InvalidRequest(
            "context_id and vm_name are required".to_string(),
        ));
    }

    match request.vm_naming.as_str() {
        "exact" | "suffixed" => {}
        other => {
            return Err(skybridge_common::Error::InvalidRequest(format!(
                "unknown vm_naming '{}', expected exact or suffixed",
                other
            )))
        }
    }

    if let Some(ref strategy) = request.network_strategy {
        match strategy.as_str() {
            "test" | "live" => {}
            "custom" => {
                if request
                    .network_mappings
                    .as_ref()
                    .map(|m| m.is_empty())
                    .unwrap_or(true)
                {
                    return Err(skybridge_common::Error::InvalidRequest(
                        "custom network strategy requires network_mappings".to_string(),
                    ));
                }
            }
            other => {
                return Err(skybridge_common::Error::InvalidRequest(format!(
                    "unknown network_strategy '{}'",
                    other
                )))
            }
        }
    }

    if request.failover_type == FailoverType::Test && request.power_off_source {
        return Err(skybridge_common::Error::InvalidRequest(
            "test failovers never power off the source VM".to_string(),
        ));
    }

    Ok(())
}

#[derive(Clone)]
pub struct FailoverEngine {
    pool: SqlitePool,
    tracker: JobTracker,
    cloudstack: CloudStackClient,
    volumes: VolumeClient,
    node: NodeClient,
    backups: BackupOrchestrator,
    /// CloudStack VM that owns replicated volumes between failovers
    appliance_vm_id: String,
}

impl FailoverEngine {
    pub fn new(
        pool: SqlitePool,
        tracker: JobTracker,
        cloudstack: CloudStackClient,
        volumes: VolumeClient,
        node: NodeClient,
        backups: BackupOrchestrator,
        appliance_vm_id: String,
    ) -> Self {
        Self {
            pool,
            tracker,
            cloudstack,
            volumes,
            node,
            backups,
            appliance_vm_id,
        }
    }

    /// Accept a failover request, persist the job in `pending`, and run the
    /// state machine in a detached task. Returns the failover job id.
    pub async fn execute_unified_failover(
        &self,
        request: UnifiedFailoverRequest,
    ) -> Result<String> {
        validate_request(&request)?;

        let context = db::contexts::get(&self.pool, &request.context_id).await?;
        if context.vm_name != request.vm_name {
            return Err(skybridge_common::Error::InvalidRequest(format!(
                "context '{}' belongs to VM '{}', not '{}'",
                request.context_id, context.vm_name, request.vm_name
            )));
        }

        let failover_id = format!("failover-{}-{}", request.failover_type, uuid::Uuid::new_v4());

        let job_id = self
            .tracker
            .start_job(NewJob {
                job_type: "failover".to_string(),
                operation: format!("{}_failover", request.failover_type),
                owner: "api".to_string(),
                external_id: Some(failover_id.clone()),
                context_id: Some(request.context_id.clone()),
                metadata: Some(serde_json::json!({
                    "vm_name": request.vm_name,
                    "failover_type": request.failover_type.to_string(),
                })),
                ..Default::default()
            })
            .await?;

        // Per-VM serialization through the single job slot
        db::contexts::claim_job_slot(&self.pool, &request.context_id, &job_id).await?;

        let replication_job_id = db::replications::list(&self.pool, Some(&request.context_id))
            .await?
            .into_iter()
            .find(|j| j.status == "completed")
            .map(|j| j.id);

        db::failovers::insert(
            &self.pool,
            &db::failovers::FailoverJobRecord {
                id: failover_id.clone(),
                context_id: request.context_id.clone(),
                replication_job_id,
                vm_name: request.vm_name.clone(),
                vmware_vm_id: request.vmware_vm_id.clone(),
                failover_type: request.failover_type.to_string(),
                status: "pending".to_string(),
                destination_vm_id: None,
                snapshot_id: None,
                error_message: None,
                created_at: chrono::Utc::now().timestamp(),
                updated_at: chrono::Utc::now().timestamp(),
                completed_at: None,
            },
        )
        .await?;

        // Detached execution with a lifecycle independent of the request
        let engine = self.clone();
        let failover_id_task = failover_id.clone();
        tokio::spawn(async move {
            engine.run_state_machine(&job_id, &failover_id_task, request).await;
        });

        Ok(failover_id)
    }

    async fn run_state_machine(
        &self,
        job_id: &str,
        failover_id: &str,
        request: UnifiedFailoverRequest,
    ) {
        let outcome = self.drive(job_id, failover_id, &request).await;

        match outcome {
            Ok(()) => {
                let _ = self.tracker.end_job(job_id, JobStatus::Completed, None).await;
                let _ = db::failovers::update_state(
                    &self.pool,
                    failover_id,
                    "completed",
                    None,
                    None,
                    None,
                )
                .await;
                info!("Failover {} completed", failover_id);
            }
            Err(e) => {
                let msg = e.to_string();
                error!("Failover {} failed: {}", failover_id, msg);
                let _ = self
                    .tracker
                    .end_job(job_id, JobStatus::Failed, Some(&e))
                    .await;
                let _ = db::failovers::update_state(
                    &self.pool,
                    failover_id,
                    "failed",
                    None,
                    None,
                    Some(&msg),
                )
                .await;
            }
        }

        db::contexts::release_job_slot(&self.pool, &request.context_id, job_id)
            .await
            .unwrap_or_else(|e| warn!("Failed to release job slot: {}", e));
    }

    async fn drive(
        &self,
        job_id: &str,
        failover_id: &str,
        request: &UnifiedFailoverRequest,
    ) -> Result<()> {
        let context = db::contexts::get(&self.pool, &request.context_id).await?;
        let volumes = self.replicated_volumes(&request.context_id).await?;

        // validate
        if !request.skip_validation {
            self.transition(failover_id, "validating").await?;
            self.tracker
                .run_step(job_id, "validate", async {
                    let checks = self.preflight_checks(request, &context, &volumes).await?;
                    let failures: Vec<&PreflightCheck> =
                        checks.iter().filter(|c| c.status == "error").collect();
                    if !failures.is_empty() {
                        let summary = failures
                            .iter()
                            .map(|c| c.message.as_str())
                            .collect::<Vec<_>>()
                            .join("; ");
                        return Err(skybridge_common::Error::PreconditionFailed(summary));
                    }
                    for check in checks.iter().filter(|c| c.status == "warning") {
                        warn!("Preflight warning for {}: {}", request.vm_name, check.message);
                    }
                    Ok(())
                })
                .await?;
        }

        // snapshot, rollback protection for test failovers only
        if request.failover_type == FailoverType::Test {
            self.transition(failover_id, "snapshotting").await?;
            let snapshot_ids = self
                .tracker
                .run_step(job_id, "snapshot", async {
                    let mut ids = Vec::new();
                    for volume in &volumes {
                        let snapshot = self
                            .cloudstack
                            .create_volume_snapshot(&volume.volume_id)
                            .await?;
                        ids.push(snapshot.id);
                    }
                    Ok(ids)
                })
                .await?;

            db::failovers::update_state(
                &self.pool,
                failover_id,
                "snapshotting",
                None,
                Some(&snapshot_ids.join(",")),
                None,
            )
            .await?;
        }

        // live-only: quiesce the source before the cutover
        if request.failover_type == FailoverType::Live && request.power_off_source {
            self.tracker
                .run_step(job_id, "power-off-source", async {
                    self.node
                        .power_off_source(&request.vm_name, &context.vm_path)
                        .await
                })
                .await?;
        }

        // live-only: one final incremental pass through the backup chain
        if request.failover_type == FailoverType::Live && request.perform_final_sync {
            self.tracker
                .run_step(job_id, "final-sync", async {
                    let contexts =
                        db::backups::backup_contexts_for_vm(&self.pool, &request.vm_name).await?;
                    let repository_id = contexts
                        .first()
                        .map(|c| c.repository_id.clone())
                        .ok_or_else(|| {
                            skybridge_common::Error::PreconditionFailed(format!(
                                "final sync requires an existing backup chain for '{}'",
                                request.vm_name
                            ))
                        })?;

                    self.backups
                        .start_vm_backup(crate::backup::StartBackupRequest {
                            vm_name: request.vm_name.clone(),
                            backup_type: BackupType::Incremental,
                            repository_id,
                            tags: Some(vec!["final-sync".to_string()]),
                        })
                        .await
                        .map(|_| ())
                })
                .await?;
        }

        // create_vm
        self.transition(failover_id, "creating_vm").await?;
        let destination = self
            .tracker
            .run_step(job_id, "create-vm", async {
                let plan = self.resolve_plan(request, &context).await?;
                self.cloudstack.deploy_virtual_machine(&plan).await
            })
            .await?;

        db::failovers::update_state(
            &self.pool,
            failover_id,
            "creating_vm",
            Some(&destination.id),
            None,
            None,
        )
        .await?;

        if !request.skip_virtio && is_windows_guest(context.os_type.as_deref()) {
            self.tracker
                .run_step(job_id, "inject-virtio", async {
                    inject_virtio_drivers(&volumes).await
                })
                .await?;
        }

        // switch_volume, live only: move the replicated root under the new VM
        if request.failover_type == FailoverType::Live {
            self.transition(failover_id, "switching_volume").await?;
            self.tracker
                .run_step(job_id, "switch-volume", async {
                    let root = volumes
                        .iter()
                        .find(|v| v.disk_index == 0)
                        .ok_or_else(|| {
                            skybridge_common::Error::PreconditionFailed(format!(
                                "no replicated root volume for '{}'",
                                request.vm_name
                            ))
                        })?;

                    let detach = self.volumes.detach_volume(&root.volume_id).await?;
                    self.volumes
                        .wait_for_completion(&detach.operation_id)
                        .await?;

                    let attach = self
                        .volumes
                        .attach_volume(&root.volume_id, &destination.id, 0)
                        .await?;
                    self.volumes
                        .wait_for_completion(&attach.operation_id)
                        .await?;

                    Ok(())
                })
                .await?;
        }

        // power_on
        self.transition(failover_id, "powering_on").await?;
        self.tracker
            .run_step(job_id, "power-on", async {
                self.cloudstack.start_virtual_machine(&destination.id).await
            })
            .await?;

        Ok(())
    }

    async fn transition(&self, failover_id: &str, state: &str) -> Result<()> {
        db::failovers::update_state(&self.pool, failover_id, state, None, None, None).await
    }

    async fn replicated_volumes(
        &self,
        context_id: &str,
    ) -> Result<Vec<db::replications::ReplicationVolumeRecord>> {
        let jobs = db::replications::list(&self.pool, Some(context_id)).await?;
        for job in jobs {
            if job.status == "completed" {
                let volumes = db::replications::list_volumes(&self.pool, &job.id).await?;
                if !volumes.is_empty() {
                    return Ok(volumes);
                }
            }
        }
        Ok(Vec::new())
    }

    async fn resolve_plan(
        &self,
        request: &UnifiedFailoverRequest,
        context: &db::contexts::VmContext,
    ) -> Result<DeployVmRequest> {
        let zone_id = match &request.zone_id {
            Some(id) => id.clone(),
            None => self
                .cloudstack
                .list_zones()
                .await?
                .into_iter()
                .next()
                .map(|z| z.id)
                .ok_or_else(|| {
                    skybridge_common::Error::PreconditionFailed(
                        "destination has no zones".to_string(),
                    )
                })?,
        };

        let service_offering_id = match &request.service_offering_id {
            Some(id) => id.clone(),
            None => {
                let offerings = self.cloudstack.list_service_offerings().await?;
                offerings
                    .iter()
                    .find(|o| {
                        o.cpunumber.unwrap_or(0) >= context.cpus
                            && o.memory.unwrap_or(0) >= context.memory_mb
                    })
                    .or_else(|| offerings.first())
                    .map(|o| o.id.clone())
                    .ok_or_else(|| {
                        skybridge_common::Error::PreconditionFailed(
                            "no service offering available".to_string(),
                        )
                    })?
            }
        };

        let template_id = match &request.template_id {
            Some(id) => id.clone(),
            None => self.resolve_template(context).await?,
        };

        let network_ids = match request.network_mappings.as_ref() {
            Some(mappings) if !mappings.is_empty() => mappings.values().cloned().collect(),
            _ => self
                .cloudstack
                .list_networks(Some(&zone_id))
                .await?
                .into_iter()
                .take(1)
                .map(|n| n.id)
                .collect(),
        };

        Ok(DeployVmRequest {
            name: destination_vm_name(
                &request.vm_name,
                &request.vm_naming,
                request.failover_type,
                chrono::Utc::now().timestamp(),
            ),
            service_offering_id,
            template_id,
            zone_id,
            network_ids,
            // Power-on is its own state so volume switching can precede it
            start_vm: false,
        })
    }

    /// Template selection with the documented `ostypeid` anomaly handling:
    /// the os-type catalog id match is authoritative; the name-based match
    /// is the fallback used only when no id can be recovered for the hint.
    async fn resolve_template(&self, context: &db::contexts::VmContext) -> Result<String> {
        let templates = self.cloudstack.list_templates().await?;

        let catalog_entry = match context.os_type.as_deref() {
            Some(os_hint) => self.cloudstack.find_os_type_by_name(os_hint).await?,
            None => None,
        };

        select_template(&templates, context.os_type.as_deref(), catalog_entry.as_ref())
            .map(|t| t.id.clone())
            .ok_or_else(|| {
                skybridge_common::Error::PreconditionFailed(
                    "no executable templates at the destination".to_string(),
                )
            })
    }

    /// Remote-free subset plus remote checks; failures block, warnings don't
    pub async fn preflight_checks(
        &self,
        request: &UnifiedFailoverRequest,
        context: &db::contexts::VmContext,
        volumes: &[db::replications::ReplicationVolumeRecord],
    ) -> Result<Vec<PreflightCheck>> {
        let mut checks = Vec::new();

        checks.push(match validate_request(request) {
            Ok(()) => PreflightCheck {
                check: "request".to_string(),
                status: "ok".to_string(),
                message: "request is well-formed".to_string(),
            },
            Err(e) => PreflightCheck {
                check: "request".to_string(),
                status: "error".to_string(),
                message: e.to_string(),
            },
        });

        checks.push(if volumes.is_empty() {
            PreflightCheck {
                check: "volumes".to_string(),
                status: if request.failover_type == FailoverType::Live {
                    "error".to_string()
                } else {
                    "warning".to_string()
                },
                message: format!("no replicated volumes recorded for '{}'", context.vm_name),
            }
        } else {
            PreflightCheck {
                check: "volumes".to_string(),
                status: "ok".to_string(),
                message: format!("{} replicated volume(s) ready", volumes.len()),
            }
        });

        match self.cloudstack.list_templates().await {
            Ok(templates) if templates.is_empty() => checks.push(PreflightCheck {
                check: "templates".to_string(),
                status: "error".to_string(),
                message: "destination has no executable templates".to_string(),
            }),
            Ok(templates) => checks.push(PreflightCheck {
                check: "templates".to_string(),
                status: "ok".to_string(),
                message: format!("{} template(s) available", templates.len()),
            }),
            Err(e) => checks.push(PreflightCheck {
                check: "templates".to_string(),
                status: "error".to_string(),
                message: format!("destination unreachable: {}", e),
            }),
        }

        match self.cloudstack.list_service_offerings().await {
            Ok(offerings) => {
                let fits = offerings.iter().any(|o| {
                    o.cpunumber.unwrap_or(0) >= context.cpus
                        && o.memory.unwrap_or(0) >= context.memory_mb
                });
                checks.push(PreflightCheck {
                    check: "service_offering".to_string(),
                    status: if fits { "ok" } else { "warning" }.to_string(),
                    message: if fits {
                        "a service offering covers the source sizing".to_string()
                    } else {
                        format!(
                            "no offering covers {} vCPU / {} MB; smallest available will be used",
                            context.cpus, context.memory_mb
                        )
                    },
                });
            }
            Err(e) => checks.push(PreflightCheck {
                check: "service_offering".to_string(),
                status: "error".to_string(),
                message: format!("offering lookup failed: {}", e),
            }),
        }

        Ok(checks)
    }

    /// What a rollback would do right now for (flavor, vm)
    pub async fn rollback_decision(
        &self,
        failover_type: FailoverType,
        vm_name: &str,
    ) -> Result<RollbackDecision> {
        let latest =
            db::failovers::latest_for_vm(&self.pool, vm_name, &failover_type.to_string()).await?;
        Ok(decision_from(failover_type, vm_name, latest))
    }

    /// Readiness of a VM for failover, by vmware id or context id
    pub async fn readiness(&self, vm_id: &str) -> Result<ReadinessReport> {
        let context = match db::contexts::get(&self.pool, vm_id).await {
            Ok(ctx) => ctx,
            Err(skybridge_common::Error::NotFound(_)) => {
                db::contexts::get_by_vmware_id(&self.pool, vm_id).await?
            }
            Err(e) => return Err(e),
        };

        let mut checks = Vec::new();

        checks.push(PreflightCheck {
            check: "job_slot".to_string(),
            status: if context.current_job_id.is_none() {
                "ok"
            } else {
                "error"
            }
            .to_string(),
            message: match &context.current_job_id {
                None => "no job in flight".to_string(),
                Some(job) => format!("job '{}' is already running", job),
            },
        });

        let volumes = self.replicated_volumes(&context.context_id).await?;
        checks.push(PreflightCheck {
            check: "replication".to_string(),
            status: if volumes.is_empty() { "warning" } else { "ok" }.to_string(),
            message: if volumes.is_empty() {
                "no completed replication with volumes".to_string()
            } else {
                format!("{} volume(s) replicated", volumes.len())
            },
        });

        let chains = db::backups::backup_contexts_for_vm(&self.pool, &context.vm_name).await?;
        checks.push(PreflightCheck {
            check: "backups".to_string(),
            status: if chains.is_empty() { "warning" } else { "ok" }.to_string(),
            message: format!("{} backup context(s)", chains.len()),
        });

        let ready = checks.iter().all(|c| c.status != "error");
        Ok(ReadinessReport { ready, checks })
    }

    pub async fn get_failover(&self, failover_id: &str) -> Result<db::failovers::FailoverJobRecord> {
        db::failovers::get(&self.pool, failover_id).await
    }

    pub async fn list_failovers(&self) -> Result<Vec<db::failovers::FailoverJobRecord>> {
        db::failovers::list(&self.pool).await
    }
}

pub fn decision_from(
    failover_type: FailoverType,
    vm_name: &str,
    latest: Option<db::failovers::FailoverJobRecord>,
) -> RollbackDecision {
    match latest {
        None => RollbackDecision {
            vm_name: vm_name.to_string(),
            failover_type,
            decision: "nothing_to_rollback".to_string(),
            destination_vm_id: None,
            snapshot_count: 0,
            reasons: vec![format!("no {} failover recorded for '{}'", failover_type, vm_name)],
        },
        Some(job) if job.status == "rolled_back" || job.destination_vm_id.is_none() => {
            RollbackDecision {
                vm_name: vm_name.to_string(),
                failover_type,
                decision: "nothing_to_rollback".to_string(),
                destination_vm_id: None,
                snapshot_count: 0,
                reasons: vec![format!(
                    "latest {} failover is already clean (status {})",
                    failover_type, job.status
                )],
            }
        }
        Some(job) => {
            let snapshot_count = job
                .snapshot_id
                .as_deref()
                .map(|s| s.split(',').filter(|p| !p.is_empty()).count())
                .unwrap_or(0);
            RollbackDecision {
                vm_name: vm_name.to_string(),
                failover_type,
                decision: "rollback_possible".to_string(),
                destination_vm_id: job.destination_vm_id,
                snapshot_count,
                reasons: vec![format!("failover '{}' left a destination VM", job.id)],
            }
        }
    }
}

/// Pick the destination template for an os hint. The recovered `ostypeid`
/// from the os-type catalog decides first; the `ostypename` substring match
/// only runs when no catalog id matched (the parse-anomaly fallback).
/// Without a hint, the first executable template wins.
fn select_template<'a>(
    templates: &'a [crate::cloudstack::Template],
    os_hint: Option<&str>,
    catalog_entry: Option<&crate::cloudstack::OsType>,
) -> Option<&'a crate::cloudstack::Template> {
    if let Some(os_hint) = os_hint {
        if let Some(os_type) = catalog_entry {
            if let Some(by_id) = templates
                .iter()
                .find(|t| t.ostypeid.as_deref() == Some(os_type.id.as_str()))
            {
                return Some(by_id);
            }
        }

        let needle = os_hint.to_lowercase();
        if let Some(by_name) = templates.iter().find(|t| {
            t.ostypename
                .as_deref()
                .map(|n| n.to_lowercase().contains(&needle))
                .unwrap_or(false)
        }) {
            return Some(by_name);
        }
    }

    templates.first()
}

fn is_windows_guest(os_type: Option<&str>) -> bool {
    os_type
        .map(|t| t.to_lowercase().contains("windows"))
        .unwrap_or(false)
}

/// VirtIO driver injection runs against the replicated volume mounts on the
/// appliance, before the destination VM first boots.
async fn inject_virtio_drivers(
    volumes: &[db::replications::ReplicationVolumeRecord],
) -> Result<()> {
    let root = volumes
        .iter()
        .find(|v| v.disk_index == 0)
        .and_then(|v| v.mount_point.clone())
        .ok_or_else(|| {
            skybridge_common::Error::PreconditionFailed(
                "virtio injection needs the replicated root volume mounted".to_string(),
            )
        })?;

    let output = tokio::process::Command::new("virt-v2v-in-place")
        .arg("-i")
        .arg("disk")
        .arg(&root)
        .output()
        .await
        .map_err(|e| {
            skybridge_common::Error::System(format!("failed to run virt-v2v-in-place: {}", e))
        })?;

    if !output.status.success() {
        return Err(skybridge_common::Error::System(format!(
            "virtio injection failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    info!("VirtIO drivers injected via {}", root);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(failover_type: FailoverType) -> UnifiedFailoverRequest {
        UnifiedFailoverRequest {
            context_id: "ctx-pgtest1".to_string(),
            vmware_vm_id: "4205-1".to_string(),
            vm_name: "pgtest1".to_string(),
            failover_type,
            power_off_source: false,
            perform_final_sync: false,
            skip_validation: false,
            skip_virtio: false,
            network_strategy: None,
            vm_naming: "exact".to_string(),
            test_duration: None,
            network_mappings: None,
            service_offering_id: None,
            template_id: None,
            zone_id: None,
        }
    }

    #[test]
    fn test_destination_naming() {
        assert_eq!(
            destination_vm_name("pgtest1", "exact", FailoverType::Live, 1_700_000_000),
            "pgtest1"
        );
        assert_eq!(
            destination_vm_name("pgtest1", "suffixed", FailoverType::Test, 1_700_000_000),
            "pgtest1-test-1700000000"
        );
    }

    #[test]
    fn test_preflight_defaults_per_flavor() {
        let test = preflight_config(FailoverType::Test);
        assert_eq!(test.vm_naming, "suffixed");
        assert_eq!(test.network_strategy, "test");
        assert!(!test.power_off_source);
        assert!(!test.perform_final_sync);

        let live = preflight_config(FailoverType::Live);
        assert_eq!(live.vm_naming, "exact");
        assert_eq!(live.network_strategy, "live");
        assert!(live.power_off_source);
        assert!(live.perform_final_sync);
    }

    #[test]
    fn test_request_validation() {
        assert!(validate_request(&request(FailoverType::Test)).is_ok());

        let mut bad_naming = request(FailoverType::Test);
        bad_naming.vm_naming = "fancy".to_string();
        assert!(validate_request(&bad_naming).is_err());

        let mut custom_without_mappings = request(FailoverType::Test);
        custom_without_mappings.network_strategy = Some("custom".to_string());
        assert!(validate_request(&custom_without_mappings).is_err());

        let mut custom_with_mappings = custom_without_mappings.clone();
        custom_with_mappings.network_mappings =
            Some([("vlan10".to_string(), "net-1".to_string())].into_iter().collect());
        assert!(validate_request(&custom_with_mappings).is_ok());

        let mut test_power_off = request(FailoverType::Test);
        test_power_off.power_off_source = true;
        assert!(validate_request(&test_power_off).is_err());
    }

    #[test]
    fn test_rollback_decision_shapes() {
        let none = decision_from(FailoverType::Test, "pgtest1", None);
        assert_eq!(none.decision, "nothing_to_rollback");

        let clean = decision_from(
            FailoverType::Test,
            "pgtest1",
            Some(db::failovers::FailoverJobRecord {
                id: "fo-1".to_string(),
                context_id: "ctx-1".to_string(),
                replication_job_id: None,
                vm_name: "pgtest1".to_string(),
                vmware_vm_id: "4205-1".to_string(),
                failover_type: "test".to_string(),
                status: "rolled_back".to_string(),
                destination_vm_id: Some("cs-vm-1".to_string()),
                snapshot_id: None,
                error_message: None,
                created_at: 0,
                updated_at: 0,
                completed_at: None,
            }),
        );
        assert_eq!(clean.decision, "nothing_to_rollback");

        let live = decision_from(
            FailoverType::Test,
            "pgtest1",
            Some(db::failovers::FailoverJobRecord {
                id: "fo-2".to_string(),
                context_id: "ctx-1".to_string(),
                replication_job_id: None,
                vm_name: "pgtest1".to_string(),
                vmware_vm_id: "4205-1".to_string(),
                failover_type: "test".to_string(),
                status: "completed".to_string(),
                destination_vm_id: Some("cs-vm-2".to_string()),
                snapshot_id: Some("snap-1,snap-2".to_string()),
                error_message: None,
                created_at: 0,
                updated_at: 0,
                completed_at: Some(0),
            }),
        );
        assert_eq!(live.decision, "rollback_possible");
        assert_eq!(live.destination_vm_id.as_deref(), Some("cs-vm-2"));
        assert_eq!(live.snapshot_count, 2);
    }

    fn template(
        id: &str,
        name: &str,
        ostypeid: Option<&str>,
        ostypename: Option<&str>,
    ) -> crate::cloudstack::Template {
        crate::cloudstack::Template {
            id: id.to_string(),
            name: name.to_string(),
            ostypeid: ostypeid.map(|s| s.to_string()),
            ostypename: ostypename.map(|s| s.to_string()),
        }
    }

    fn os_type(id: &str, description: &str) -> crate::cloudstack::OsType {
        crate::cloudstack::OsType {
            id: id.to_string(),
            description: description.to_string(),
        }
    }

    #[test]
    fn test_template_selection_prefers_ostypeid_match() {
        // The id match wins even though the matching template's name does
        // not contain the hint and an earlier template's name does
        let templates = vec![
            template("t1", "golden-linux", Some("os-1"), Some("Ubuntu 20.04")),
            template("t2", "dr-base", Some("os-42"), Some("Generic Linux")),
        ];
        let catalog = os_type("os-42", "Ubuntu 22.04 (64-bit)");

        let chosen = select_template(&templates, Some("ubuntu64Guest"), Some(&catalog)).unwrap();
        assert_eq!(chosen.id, "t2");
    }

    #[test]
    fn test_template_selection_name_fallback_on_id_anomaly() {
        // No catalog entry could be recovered for the hint, so the
        // name-based match takes over
        let templates = vec![
            template("t1", "win-base", Some("os-7"), Some("Windows Server 2022")),
            template("t2", "ubuntu-base", None, Some("Ubuntu 22.04")),
        ];

        let chosen = select_template(&templates, Some("ubuntu"), None).unwrap();
        assert_eq!(chosen.id, "t2");

        // A recovered id that matches nothing also falls through to the name
        let stale = os_type("os-99", "Ubuntu 22.04 (64-bit)");
        let chosen = select_template(&templates, Some("ubuntu"), Some(&stale)).unwrap();
        assert_eq!(chosen.id, "t2");
    }

    #[test]
    fn test_template_selection_without_hint_takes_first() {
        let templates = vec![
            template("t1", "first", Some("os-1"), Some("CentOS 7")),
            template("t2", "second", Some("os-2"), Some("Ubuntu 22.04")),
        ];

        let chosen = select_template(&templates, None, None).unwrap();
        assert_eq!(chosen.id, "t1");

        // A hint matching neither id nor name degrades the same way
        let chosen = select_template(&templates, Some("freebsd"), None).unwrap();
        assert_eq!(chosen.id, "t1");

        assert!(select_template(&[], None, None).is_none());
    }

    #[test]
    fn test_windows_guest_detection() {
        assert!(is_windows_guest(Some("windows2019srv_64Guest")));
        assert!(is_windows_guest(Some("Windows 10")));
        assert!(!is_windows_guest(Some("ubuntu64Guest")));
        assert!(!is_windows_guest(None));
    }

    #[test]
    fn test_request_deserialization_defaults() {
        let json = r#"{
            "context_id": "ctx-pgtest1-1",
            "vmware_vm_id": "4205-99",
            "vm_name": "pgtest1",
            "failover_type": "test",
            "vm_naming": "suffixed"
        }"#;
        let request: UnifiedFailoverRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.failover_type, FailoverType::Test);
        assert!(!request.power_off_source);
        assert!(!request.skip_validation);
        assert_eq!(request.vm_naming, "suffixed");
    }
}
