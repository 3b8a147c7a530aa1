//! Telemetry ingest
//!
//! Append-only push channel for remote-side progress. A Node posts progress
//! for the replication or backup job it is executing; writes land atomically
//! and out-of-order updates can never regress a terminal status.

use crate::db;
use skybridge_common::{JobStatus, Result, TelemetryUpdate};
use sqlx::SqlitePool;
use tracing::debug;

#[derive(Clone)]
pub struct TelemetryIngest {
    pool: SqlitePool,
}

impl TelemetryIngest {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ingest(
        &self,
        job_type: &str,
        job_id: &str,
        update: TelemetryUpdate,
    ) -> Result<()> {
        debug!(
            "Telemetry for {} {}: {:?}% phase {:?}",
            job_type, job_id, update.progress_percent, update.current_phase
        );

        match job_type {
            "replication" => {
                let updated =
                    db::replications::update_progress(&self.pool, job_id, &update).await?;
                if !updated {
                    return Err(skybridge_common::Error::NotFound(format!(
                        "replication job '{}' not found",
                        job_id
                    )));
                }

                // A session that just went terminal frees the VM's job slot
                if let Some(ref status) = update.status {
                    if JobStatus::parse(status).is_terminal() {
                        let job = db::replications::get(&self.pool, job_id).await?;
                        db::contexts::release_job_slot(&self.pool, &job.context_id, job_id)
                            .await?;
                    }
                }
                Ok(())
            }
            "backup" => {
                let parent_id = db::backups::parent_id_of(job_id);
                let updated = db::backups::update_progress(&self.pool, parent_id, &update).await?;
                if !updated {
                    return Err(skybridge_common::Error::NotFound(format!(
                        "backup job '{}' not found",
                        job_id
                    )));
                }
                Ok(())
            }
            other => Err(skybridge_common::Error::InvalidRequest(format!(
                "unknown telemetry job type '{}', expected replication or backup",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fixture() -> (crate::db::Database, TelemetryIngest) {
        let db = crate::db::Database::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let ingest = TelemetryIngest::new(db.pool().clone());
        (db, ingest)
    }

    async fn seed_replication(pool: &SqlitePool, status: &str) {
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
                current_job_id: Some("repl-1".to_string()),
                created_at: chrono::Utc::now().timestamp(),
                updated_at: chrono::Utc::now().timestamp(),
            },
        )
        .await
        .unwrap();

        crate::db::replications::insert(
            pool,
            &crate::db::replications::ReplicationJobRecord {
                id: "repl-1".to_string(),
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

    fn update(progress: f64, status: Option<&str>) -> TelemetryUpdate {
        TelemetryUpdate {
            bytes_transferred: Some((progress * 1_000_000.0) as i64),
            progress_percent: Some(progress),
            transfer_speed_bps: Some(125_000_000),
            current_phase: Some("transferring".to_string()),
            status: status.map(|s| s.to_string()),
        }
    }

    #[tokio::test]
    async fn test_progress_lands_atomically() {
        let (db, ingest) = fixture().await;
        seed_replication(db.pool(), "running").await;

        ingest
            .ingest("replication", "repl-1", update(42.5, None))
            .await
            .unwrap();

        let job = crate::db::replications::get(db.pool(), "repl-1").await.unwrap();
        assert_eq!(job.progress_percent, 42.5);
        assert_eq!(job.transfer_speed_bps, 125_000_000);
        assert_eq!(job.current_phase.as_deref(), Some("transferring"));
        assert_eq!(job.status, "running");
    }

    #[tokio::test]
    async fn test_terminal_status_never_regresses() {
        let (db, ingest) = fixture().await;
        seed_replication(db.pool(), "running").await;

        ingest
            .ingest("replication", "repl-1", update(100.0, Some("completed")))
            .await
            .unwrap();

        // A straggler update arrives out of order
        ingest
            .ingest("replication", "repl-1", update(97.0, Some("running")))
            .await
            .unwrap();

        let job = crate::db::replications::get(db.pool(), "repl-1").await.unwrap();
        assert_eq!(job.status, "completed");
        // Progress fields still merge; only the status is protected
        assert_eq!(job.progress_percent, 97.0);
    }

    #[tokio::test]
    async fn test_terminal_replication_releases_job_slot() {
        let (db, ingest) = fixture().await;
        seed_replication(db.pool(), "running").await;

        let ctx = crate::db::contexts::get(db.pool(), "ctx-1").await.unwrap();
        assert_eq!(ctx.current_job_id.as_deref(), Some("repl-1"));

        ingest
            .ingest("replication", "repl-1", update(100.0, Some("completed")))
            .await
            .unwrap();

        let ctx = crate::db::contexts::get(db.pool(), "ctx-1").await.unwrap();
        assert!(ctx.current_job_id.is_none());
    }

    #[tokio::test]
    async fn test_unknown_job_type_and_id() {
        let (db, ingest) = fixture().await;
        seed_replication(db.pool(), "running").await;

        match ingest.ingest("restore", "repl-1", update(1.0, None)).await {
            Err(skybridge_common::Error::InvalidRequest(_)) => {}
            other => panic!("expected InvalidRequest, got {:?}", other.map(|_| ())),
        }

        match ingest
            .ingest("replication", "repl-ghost", update(1.0, None))
            .await
        {
            Err(skybridge_common::Error::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
    }
}
