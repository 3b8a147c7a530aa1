//! Recent-operations feed
//!
//! Projects replication jobs and failover/rollback job-log entries for a VM
//! context into one activity feed. Raw error strings never reach the
//! operator: a domain classifier turns them into a category, a readable
//! message and actionable steps.

use crate::db;
use serde::Serialize;
use skybridge_common::Result;
use sqlx::SqlitePool;

const FEED_LIMIT: i64 = 20;

#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub category: String,
    pub user_message: String,
    pub actionable_steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityItem {
    pub operation_id: String,
    pub operation_type: String,
    pub vm_name: Option<String>,
    pub status: String,
    pub progress_percent: Option<f64>,
    pub message: String,
    pub failure: Option<Classification>,
    pub started_at: i64,
    pub completed_at: Option<i64>,
}

/// Operator guidance for one canonical failure category (the taxonomy of
/// `skybridge_common::Error::category`, persisted in the job log). Unknown
/// names collapse into the internal bucket.
pub fn classification_for_category(category: &str) -> Classification {
    let (user_message, steps): (&str, Vec<&str>) = match category {
        "invalid_request" => (
            "The request was rejected as invalid.",
            vec![
                "Review the request parameters",
                "Run a full backup before requesting an incremental",
                "Verify the submitted credentials or signatures",
            ],
        ),
        "not_found" => (
            "A required object could not be found.",
            vec![
                "Confirm the VM is still present in vCenter inventory",
                "Re-run discovery for the affected VM",
            ],
        ),
        "conflict" => (
            "Another operation is already using this resource.",
            vec![
                "Wait for the active job on this VM to finish",
                "Cancel the active job if it is stuck",
            ],
        ),
        "resource_exhausted" => (
            "The system ran out of a pooled resource.",
            vec![
                "Wait for running jobs to finish and retry",
                "Widen the block-server port range or free destination capacity if this recurs",
            ],
        ),
        "precondition_failed" => (
            "A prerequisite for this operation is missing.",
            vec![
                "Verify destination templates, offerings and networks",
                "Inspect the backup chain for the VM",
            ],
        ),
        "remote_unavailable" => (
            "A remote endpoint did not respond in time.",
            vec![
                "Check the tunnel status of the site's node",
                "Verify the destination cloud endpoint is reachable",
                "Retry the operation once connectivity is restored",
            ],
        ),
        "cancelled" => (
            "The operation was cancelled.",
            vec!["Re-run the operation when ready"],
        ),
        _ => (
            "An unexpected internal error occurred.",
            vec![
                "Retry the operation",
                "Contact support with the job id if it persists",
            ],
        ),
    };

    Classification {
        category: if KNOWN_CATEGORIES.contains(&category) {
            category.to_string()
        } else {
            "internal".to_string()
        },
        user_message: user_message.to_string(),
        actionable_steps: steps.into_iter().map(|s| s.to_string()).collect(),
    }
}

const KNOWN_CATEGORIES: &[&str] = &[
    "invalid_request",
    "not_found",
    "conflict",
    "resource_exhausted",
    "precondition_failed",
    "remote_unavailable",
    "cancelled",
    "internal",
];

/// Fallback for rows that only persisted raw error text (replication jobs
/// and job-log entries written before a category was recorded): sniff the
/// text onto the same canonical taxonomy, then classify. Anything that
/// looks like an internal artifact collapses into the generic message.
pub fn classify_failure(raw: &str) -> Classification {
    classification_for_category(category_from_text(raw))
}

fn category_from_text(raw: &str) -> &'static str {
    let lowered = raw.to_lowercase();

    if lowered.contains("not found") || lowered.contains("missing") {
        "not_found"
    } else if lowered.contains("timeout")
        || lowered.contains("timed out")
        || lowered.contains("unreachable")
        || lowered.contains("connection refused")
    {
        "remote_unavailable"
    } else if lowered.contains("no free")
        || lowered.contains("exhausted")
        || lowered.contains("insufficient")
        || lowered.contains("quota")
    {
        "resource_exhausted"
    } else if lowered.contains("no previous backup")
        || lowered.contains("credential")
        || lowered.contains("password")
        || lowered.contains("login")
        || lowered.contains("signature")
    {
        "invalid_request"
    } else if lowered.contains("already")
        || lowered.contains("conflict")
        || lowered.contains("in use")
    {
        "conflict"
    } else if lowered.contains("chain") || lowered.contains("prerequisite") {
        "precondition_failed"
    } else if lowered.contains("cancelled") {
        "cancelled"
    } else {
        "internal"
    }
}

/// Human-facing one-liner for a feed entry
fn operation_message(operation_type: &str, status: &str, vm_name: Option<&str>) -> String {
    let verb = match operation_type {
        "replication" => "Replication",
        "failover" => "Failover",
        "rollback" => "Rollback",
        other => other,
    };
    let subject = vm_name.unwrap_or("VM");

    match status {
        "completed" => format!("{} of {} completed", verb, subject),
        "failed" => format!("{} of {} failed", verb, subject),
        "cancelled" => format!("{} of {} was cancelled", verb, subject),
        "queued" => format!("{} of {} is queued", verb, subject),
        _ => format!("{} of {} is in progress", verb, subject),
    }
}

#[derive(Clone)]
pub struct ActivityProjector {
    pool: SqlitePool,
}

impl ActivityProjector {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The most recent operations for a context: replication jobs unified
    /// with failover and rollback entries from the job log, newest first.
    pub async fn recent_operations(&self, context_id: &str) -> Result<Vec<ActivityItem>> {
        let context = db::contexts::get(&self.pool, context_id).await?;
        let mut items = Vec::new();

        for job in db::replications::list(&self.pool, Some(context_id)).await? {
            let failure = job.error_message.as_deref().map(classify_failure);
            items.push(ActivityItem {
                operation_id: job.id,
                operation_type: "replication".to_string(),
                vm_name: Some(job.vm_name.clone()),
                status: job.status.clone(),
                progress_percent: Some(job.progress_percent),
                message: operation_message("replication", &job.status, Some(&job.vm_name)),
                failure,
                started_at: job.created_at,
                completed_at: job.completed_at,
            });
        }

        for kind in ["failover", "rollback"] {
            for job in db::jobs::list_by_type(&self.pool, context_id, kind, FEED_LIMIT).await? {
                // The job log carries the authoritative category; text
                // sniffing is only for rows without one
                let failure = job.error_message.as_deref().map(|raw| {
                    match job.error_category.as_deref() {
                        Some(category) => classification_for_category(category),
                        None => classify_failure(raw),
                    }
                });
                items.push(ActivityItem {
                    operation_id: job.id,
                    operation_type: kind.to_string(),
                    vm_name: Some(context.vm_name.clone()),
                    status: job.status.clone(),
                    progress_percent: None,
                    message: operation_message(kind, &job.status, Some(&context.vm_name)),
                    failure,
                    started_at: job.started_at,
                    completed_at: job.completed_at,
                });
            }
        }

        items.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        items.truncate(FEED_LIMIT as usize);
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_fallback_maps_onto_canonical_categories() {
        assert_eq!(classify_failure("VM 'pgtest1' not found").category, "not_found");
        assert_eq!(
            classify_failure("node unreachable after 3 attempts: connect timeout").category,
            "remote_unavailable"
        );
        assert_eq!(
            classify_failure("no free block-server ports in [10100, 10200]").category,
            "resource_exhausted"
        );
        assert_eq!(
            classify_failure("no previous backup found for disk 0").category,
            "invalid_request"
        );
        assert_eq!(
            classify_failure("VM 'pgtest1' already has an active job").category,
            "conflict"
        );
        assert_eq!(
            classify_failure("CloudStack job failed: insufficient capacity").category,
            "resource_exhausted"
        );
        assert_eq!(
            classify_failure("challenge signature rejected").category,
            "invalid_request"
        );
        assert_eq!(
            classify_failure("job 'job-1' cancelled before step 'snapshot'").category,
            "cancelled"
        );
    }

    #[test]
    fn test_every_canonical_category_has_guidance() {
        // The classifier consumes the taxonomy of Error::category verbatim
        for kind in [
            skybridge_common::Error::InvalidRequest(String::new()),
            skybridge_common::Error::NotFound(String::new()),
            skybridge_common::Error::Conflict(String::new()),
            skybridge_common::Error::ResourceExhausted(String::new()),
            skybridge_common::Error::PreconditionFailed(String::new()),
            skybridge_common::Error::RemoteUnavailable(String::new()),
            skybridge_common::Error::Cancelled(String::new()),
            skybridge_common::Error::System(String::new()),
        ] {
            let classified = classification_for_category(kind.category());
            assert_eq!(classified.category, kind.category());
            assert!(!classified.user_message.is_empty());
            assert!(!classified.actionable_steps.is_empty());
        }

        // Unknown names collapse into the internal bucket
        assert_eq!(classification_for_category("mystery").category, "internal");
    }

    #[test]
    fn test_classifier_never_echoes_internals() {
        let raw = "thread 'tokio-runtime-worker' panicked at src/backup/mod.rs:217";
        let classified = classify_failure(raw);
        assert_eq!(classified.category, "internal");
        assert!(!classified.user_message.contains("src/"));
        assert!(!classified.user_message.contains("panicked"));
        assert!(!classified.actionable_steps.is_empty());
    }

    #[test]
    fn test_operation_messages() {
        assert_eq!(
            operation_message("failover", "completed", Some("pgtest1")),
            "Failover of pgtest1 completed"
        );
        assert_eq!(
            operation_message("replication", "running", Some("pgtest1")),
            "Replication of pgtest1 is in progress"
        );
        assert_eq!(
            operation_message("rollback", "failed", Some("pgtest1")),
            "Rollback of pgtest1 failed"
        );
    }

    #[tokio::test]
    async fn test_feed_unifies_and_caps() {
        let db = crate::db::Database::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let pool = db.pool();

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
                status: "replicating".to_string(),
                current_job_id: None,
                created_at: 0,
                updated_at: 0,
            },
        )
        .await
        .unwrap();

        // 19 replication jobs and 3 tracked failover/rollback jobs
        for i in 0..19 {
            crate::db::replications::insert(
                pool,
                &crate::db::replications::ReplicationJobRecord {
                    id: format!("repl-{}", i),
                    context_id: "ctx-1".to_string(),
                    vm_name: "pgtest1".to_string(),
                    replication_type: "initial".to_string(),
                    status: "completed".to_string(),
                    bytes_transferred: 0,
                    progress_percent: 100.0,
                    transfer_speed_bps: 0,
                    current_phase: None,
                    error_message: None,
                    created_at: 1000 + i,
                    updated_at: 1000 + i,
                    completed_at: Some(1000 + i),
                },
            )
            .await
            .unwrap();
        }

        for (i, kind) in ["failover", "rollback", "failover"].iter().enumerate() {
            crate::db::jobs::insert(
                pool,
                &crate::db::jobs::JobRecord {
                    id: format!("job-{}", i),
                    external_id: None,
                    context_id: Some("ctx-1".to_string()),
                    job_type: kind.to_string(),
                    operation: format!("{}_test", kind),
                    owner: "api".to_string(),
                    status: if i == 1 { "failed" } else { "completed" }.to_string(),
                    cancel_requested: false,
                    metadata: None,
                    error_message: if i == 1 {
                        Some("node unreachable after 3 attempts".to_string())
                    } else {
                        None
                    },
                    error_category: if i == 1 {
                        Some("remote_unavailable".to_string())
                    } else {
                        None
                    },
                    started_at: 2000 + i as i64,
                    completed_at: Some(2000 + i as i64),
                },
            )
            .await
            .unwrap();
        }

        let projector = ActivityProjector::new(pool.clone());
        let feed = projector.recent_operations("ctx-1").await.unwrap();

        // Capped at 20, newest first
        assert_eq!(feed.len(), 20);
        assert_eq!(feed[0].operation_id, "job-2");
        assert!(feed[0].started_at >= feed[19].started_at);

        // The failed rollback carries a sanitized classification derived
        // from the stored canonical category
        let failed = feed.iter().find(|i| i.operation_id == "job-1").unwrap();
        let failure = failed.failure.as_ref().unwrap();
        assert_eq!(failure.category, "remote_unavailable");
        assert!(!failure.user_message.contains("unreachable after 3 attempts"));
        assert!(!failure.actionable_steps.is_empty());

        // Both kinds appear in one feed
        assert!(feed.iter().any(|i| i.operation_type == "replication"));
        assert!(feed.iter().any(|i| i.operation_type == "rollback"));
    }

    #[tokio::test]
    async fn test_stored_category_beats_text_sniffing() {
        let db = crate::db::Database::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let pool = db.pool();

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
                created_at: 0,
                updated_at: 0,
            },
        )
        .await
        .unwrap();

        // The raw text would sniff to not_found; the persisted category is
        // authoritative and wins
        crate::db::jobs::insert(
            pool,
            &crate::db::jobs::JobRecord {
                id: "job-1".to_string(),
                external_id: None,
                context_id: Some("ctx-1".to_string()),
                job_type: "failover".to_string(),
                operation: "test_failover".to_string(),
                owner: "api".to_string(),
                status: "failed".to_string(),
                cancel_requested: false,
                metadata: None,
                error_message: Some("volume snapshot not found on target".to_string()),
                error_category: Some("resource_exhausted".to_string()),
                started_at: 100,
                completed_at: Some(100),
            },
        )
        .await
        .unwrap();

        let projector = ActivityProjector::new(pool.clone());
        let feed = projector.recent_operations("ctx-1").await.unwrap();
        let failure = feed[0].failure.as_ref().unwrap();
        assert_eq!(failure.category, "resource_exhausted");
        assert_ne!(classify_failure("volume snapshot not found on target").category, failure.category);
    }

    #[tokio::test]
    async fn test_unknown_context_is_not_found() {
        let db = crate::db::Database::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let projector = ActivityProjector::new(db.pool().clone());

        match projector.recent_operations("ctx-ghost").await {
            Err(skybridge_common::Error::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
    }
}
