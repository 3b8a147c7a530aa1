///! Failover rollback and recovery
///!
///! Inverts a test or live failover: the destination VM is destroyed and its
///! protection snapshots deleted (test), or the replicated root volume is
///! re-attached to the appliance (live). Rollback on a clean state is a
///! no-op success, and a partially failed rollback keeps going best-effort.

use crate::db;
use serde::{Deserialize, Serialize};
use skybridge_common::{FailoverType, JobStatus, Result};
use tracing::{error, info, warn};

use super::FailoverEngine;
use crate::tracker::NewJob;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub vm_name: String,
    pub failover_type: FailoverType,
    #[serde(default)]
    pub context_id: Option<String>,
    #[serde(default)]
    pub vmware_vm_id: Option<String>,
    #[serde(default)]
    pub power_on_source: bool,
    #[serde(default)]
    pub force_cleanup: bool,
}

/// Rollback action type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RollbackAction {
    /// Re-attach the replicated root volume to the appliance VM
    RevertRootAttachment,
    /// Destroy the destination VM and free its volumes
    DestroyDestinationVm,
    /// Delete the rollback-protection snapshots
    DeleteSnapshots,
    /// Power the source VM back on
    PowerOnSource,
    /// Cancel scheduled followups still pointed at the failover
    CancelFollowups,
}

/// One step of a rollback plan with its execution ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackStep {
    pub action: RollbackAction,
    pub description: String,
    pub executed: bool,
    pub success: Option<bool>,
    pub error: Option<String>,
}

impl RollbackStep {
    fn new(action: RollbackAction, description: String) -> Self {
        Self {
            action,
            description,
            executed: false,
            success: None,
            error: None,
        }
    }

    fn mark_executed(&mut self, success: bool, error: Option<String>) {
        self.executed = true;
        self.success = Some(success);
        self.error = error;
    }
}

/// Ordered plan derived from the failover being reverted
#[derive(Debug, Clone, Serialize)]
pub struct RollbackPlan {
    pub failover_id: String,
    pub vm_name: String,
    pub failover_type: FailoverType,
    pub steps: Vec<RollbackStep>,
}

impl RollbackPlan {
    /// Build the step list for a failover that left resources behind
    pub fn for_failover(
        failover: &db::failovers::FailoverJobRecord,
        failover_type: FailoverType,
        power_on_source: bool,
    ) -> Self {
        let mut steps = Vec::new();

        if failover_type == FailoverType::Live {
            steps.push(RollbackStep::new(
                RollbackAction::RevertRootAttachment,
                format!("Re-attach replicated root volume of '{}'", failover.vm_name),
            ));
        }

        if failover.destination_vm_id.is_some() {
            steps.push(RollbackStep::new(
                RollbackAction::DestroyDestinationVm,
                format!(
                    "Destroy destination VM {}",
                    failover.destination_vm_id.as_deref().unwrap_or("?")
                ),
            ));
        }

        if failover_type == FailoverType::Test && failover.snapshot_id.is_some() {
            steps.push(RollbackStep::new(
                RollbackAction::DeleteSnapshots,
                "Delete rollback-protection snapshots".to_string(),
            ));
        }

        if power_on_source {
            steps.push(RollbackStep::new(
                RollbackAction::PowerOnSource,
                format!("Power source VM '{}' back on", failover.vm_name),
            ));
        }

        steps.push(RollbackStep::new(
            RollbackAction::CancelFollowups,
            "Cancel scheduled followups".to_string(),
        ));

        Self {
            failover_id: failover.id.clone(),
            vm_name: failover.vm_name.clone(),
            failover_type,
            steps,
        }
    }
}

impl FailoverEngine {
    /// Accept a rollback request and run it detached; returns the tracker
    /// job id. A rollback with nothing to undo completes immediately.
    pub async fn execute_rollback(&self, request: RollbackRequest) -> Result<String> {
        let latest = db::failovers::latest_for_vm(
            &self.pool,
            &request.vm_name,
            &request.failover_type.to_string(),
        )
        .await?;

        let job_id = self
            .tracker
            .start_job(NewJob {
                job_type: "rollback".to_string(),
                operation: format!("{}_rollback", request.failover_type),
                owner: "api".to_string(),
                context_id: latest
                    .as_ref()
                    .map(|f| f.context_id.clone())
                    .or(request.context_id.clone()),
                metadata: Some(serde_json::json!({
                    "vm_name": request.vm_name,
                    "failover_type": request.failover_type.to_string(),
                })),
                ..Default::default()
            })
            .await?;

        let failover = match latest {
            Some(f) if f.status != "rolled_back" && f.destination_vm_id.is_some() => f,
            _ => {
                // Clean state. The source occasionally phrased this as an
                // error; it is a successful no-op.
                info!(
                    "Rollback of '{}' ({}) found nothing to undo",
                    request.vm_name, request.failover_type
                );
                self.tracker.end_job(&job_id, JobStatus::Completed, None).await?;
                return Ok(job_id);
            }
        };

        let engine = self.clone();
        let job_id_task = job_id.clone();
        tokio::spawn(async move {
            engine.run_rollback(&job_id_task, failover, request).await;
        });

        Ok(job_id)
    }

    async fn run_rollback(
        &self,
        job_id: &str,
        failover: db::failovers::FailoverJobRecord,
        request: RollbackRequest,
    ) {
        let mut plan =
            RollbackPlan::for_failover(&failover, request.failover_type, request.power_on_source);
        info!(
            "Rolling back failover {} with {} step(s)",
            failover.id,
            plan.steps.len()
        );

        let mut all_successful = true;

        for i in 0..plan.steps.len() {
            let action = plan.steps[i].action.clone();
            let description = plan.steps[i].description.clone();
            let step_name = step_name(&action);

            let result = self
                .tracker
                .run_step(job_id, step_name, self.execute_action(&action, &failover, &request))
                .await;

            match result {
                Ok(()) => {
                    plan.steps[i].mark_executed(true, None);
                }
                Err(e) => {
                    let msg = e.to_string();
                    plan.steps[i].mark_executed(false, Some(msg.clone()));
                    error!("Rollback step failed: {} - {}", description, msg);
                    all_successful = false;

                    if !request.force_cleanup {
                        break;
                    }
                    // force_cleanup keeps going best-effort
                    warn!("Continuing rollback despite failure (force_cleanup)");
                }
            }
        }

        if all_successful {
            let _ = db::failovers::update_state(
                &self.pool,
                &failover.id,
                "rolled_back",
                None,
                None,
                None,
            )
            .await;
            let _ = self.tracker.end_job(job_id, JobStatus::Completed, None).await;
            info!("Rollback of failover {} completed", failover.id);
        } else {
            let failed: Vec<String> = plan
                .steps
                .iter()
                .filter(|s| s.success == Some(false))
                .map(|s| s.description.clone())
                .collect();
            let incomplete = skybridge_common::Error::System(format!(
                "rollback incomplete: {}",
                failed.join("; ")
            ));
            let _ = self
                .tracker
                .end_job(job_id, JobStatus::Failed, Some(&incomplete))
                .await;
        }
    }

    async fn execute_action(
        &self,
        action: &RollbackAction,
        failover: &db::failovers::FailoverJobRecord,
        request: &RollbackRequest,
    ) -> Result<()> {
        match action {
            RollbackAction::RevertRootAttachment => {
                let volumes = match db::replications::list(&self.pool, Some(&failover.context_id))
                    .await?
                    .into_iter()
                    .find(|j| j.status == "completed")
                {
                    Some(job) => db::replications::list_volumes(&self.pool, &job.id).await?,
                    None => Vec::new(),
                };

                let root = match volumes.into_iter().find(|v| v.disk_index == 0) {
                    Some(root) => root,
                    None => {
                        warn!(
                            "No replicated root volume recorded for '{}'; nothing to revert",
                            failover.vm_name
                        );
                        return Ok(());
                    }
                };

                let detach = self.volumes.detach_volume(&root.volume_id).await?;
                self.volumes.wait_for_completion(&detach.operation_id).await?;

                let attach = self
                    .volumes
                    .attach_volume(&root.volume_id, &self.appliance_vm_id, 0)
                    .await?;
                self.volumes.wait_for_completion(&attach.operation_id).await?;
                Ok(())
            }
            RollbackAction::DestroyDestinationVm => {
                let vm_id = failover.destination_vm_id.as_deref().ok_or_else(|| {
                    skybridge_common::Error::System("plan step without destination VM".to_string())
                })?;

                match self.cloudstack.destroy_virtual_machine(vm_id).await {
                    Ok(()) => Ok(()),
                    // Already gone counts as reverted
                    Err(skybridge_common::Error::NotFound(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            RollbackAction::DeleteSnapshots => {
                let snapshot_ids: Vec<String> = failover
                    .snapshot_id
                    .as_deref()
                    .unwrap_or("")
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect();

                for snapshot_id in snapshot_ids {
                    match self.cloudstack.delete_volume_snapshot(&snapshot_id).await {
                        Ok(()) => {}
                        Err(skybridge_common::Error::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }

                db::failovers::clear_snapshot(&self.pool, &failover.id).await
            }
            RollbackAction::PowerOnSource => {
                let context = db::contexts::get(&self.pool, &failover.context_id).await?;
                self.node
                    .power_on_source(&failover.vm_name, &context.vm_path)
                    .await
            }
            RollbackAction::CancelFollowups => {
                // Followup jobs still running against this context observe
                // the flag at their next step boundary.
                let jobs =
                    db::jobs::list_by_context(&self.pool, &failover.context_id, 50).await?;
                for job in jobs {
                    if job.status == "running" && job.job_type == "failover" {
                        let _ = db::jobs::request_cancel(&self.pool, &job.id).await;
                    }
                }
                let _ = request;
                Ok(())
            }
        }
    }
}

fn step_name(action: &RollbackAction) -> &'static str {
    match action {
        RollbackAction::RevertRootAttachment => "revert-root-attachment",
        RollbackAction::DestroyDestinationVm => "destroy-destination-vm",
        RollbackAction::DeleteSnapshots => "delete-snapshots",
        RollbackAction::PowerOnSource => "power-on-source",
        RollbackAction::CancelFollowups => "cancel-followups",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failover(
        destination: Option<&str>,
        snapshots: Option<&str>,
        failover_type: &str,
    ) -> db::failovers::FailoverJobRecord {
        db::failovers::FailoverJobRecord {
            id: "fo-1".to_string(),
            context_id: "ctx-1".to_string(),
            replication_job_id: None,
            vm_name: "pgtest1".to_string(),
            vmware_vm_id: "4205-1".to_string(),
            failover_type: failover_type.to_string(),
            status: "completed".to_string(),
            destination_vm_id: destination.map(|s| s.to_string()),
            snapshot_id: snapshots.map(|s| s.to_string()),
            error_message: None,
            created_at: 0,
            updated_at: 0,
            completed_at: Some(0),
        }
    }

    #[test]
    fn test_test_rollback_plan_order() {
        let plan = RollbackPlan::for_failover(
            &failover(Some("cs-vm-1"), Some("snap-1,snap-2"), "test"),
            FailoverType::Test,
            false,
        );

        let actions: Vec<&RollbackAction> = plan.steps.iter().map(|s| &s.action).collect();
        assert_eq!(
            actions,
            vec![
                &RollbackAction::DestroyDestinationVm,
                &RollbackAction::DeleteSnapshots,
                &RollbackAction::CancelFollowups,
            ]
        );
    }

    #[test]
    fn test_live_rollback_reverts_attachment_first() {
        let plan = RollbackPlan::for_failover(
            &failover(Some("cs-vm-1"), None, "live"),
            FailoverType::Live,
            true,
        );

        assert_eq!(plan.steps[0].action, RollbackAction::RevertRootAttachment);
        assert_eq!(plan.steps[1].action, RollbackAction::DestroyDestinationVm);
        assert!(plan
            .steps
            .iter()
            .any(|s| s.action == RollbackAction::PowerOnSource));
    }

    #[test]
    fn test_plan_without_destination_skips_destroy() {
        let plan = RollbackPlan::for_failover(
            &failover(None, None, "test"),
            FailoverType::Test,
            false,
        );

        assert!(plan
            .steps
            .iter()
            .all(|s| s.action != RollbackAction::DestroyDestinationVm));
        // The followup cancellation always closes a plan
        assert_eq!(
            plan.steps.last().unwrap().action,
            RollbackAction::CancelFollowups
        );
    }

    #[test]
    fn test_step_ledger_marks() {
        let mut step = RollbackStep::new(
            RollbackAction::DeleteSnapshots,
            "Delete snapshots".to_string(),
        );
        assert!(!step.executed);

        step.mark_executed(false, Some("snapshot busy".to_string()));
        assert!(step.executed);
        assert_eq!(step.success, Some(false));
        assert_eq!(step.error.as_deref(), Some("snapshot busy"));
    }
}
