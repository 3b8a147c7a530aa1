///! Durable hierarchical job log
///!
///! Every long-running operation opens a Job, records its work through
///! RunStep, and closes the Job. Handlers stay thin; the tracker owns the
///! progress and cancellation semantics.

use crate::db;
use futures::FutureExt;
use serde::Serialize;
use skybridge_common::{JobStatus, Result};
use sqlx::SqlitePool;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::{error, info, warn};

/// Parameters for opening a new job
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub job_type: String,
    pub operation: String,
    pub owner: String,
    pub external_id: Option<String>,
    pub context_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Job view returned to handlers, with derived progress
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub record: db::jobs::JobRecord,
    pub steps: Vec<db::jobs::StepRecord>,
    pub progress_percent: f64,
}

/// Durable job/step tracker backed by the database
#[derive(Clone)]
pub struct JobTracker {
    pool: SqlitePool,
}

impl JobTracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a job in the running state and return its id. The id is stable
    /// across retries when the caller supplies an external id that already
    /// has a running job.
    pub async fn start_job(&self, new: NewJob) -> Result<String> {
        if let Some(ref ext) = new.external_id {
            if let Ok(existing) = db::jobs::get_by_external_id(&self.pool, ext).await {
                if existing.status == "running" {
                    return Ok(existing.id);
                }
            }
        }

        let job = db::jobs::JobRecord {
            id: format!("job-{}", uuid::Uuid::new_v4()),
            external_id: new.external_id,
            context_id: new.context_id,
            job_type: new.job_type,
            operation: new.operation,
            owner: new.owner,
            status: "running".to_string(),
            cancel_requested: false,
            metadata: new.metadata.map(|m| m.to_string()),
            error_message: None,
            error_category: None,
            started_at: chrono::Utc::now().timestamp(),
            completed_at: None,
        };

        db::jobs::insert(&self.pool, &job).await?;
        info!("Started job {} ({}/{})", job.id, job.job_type, job.operation);

        Ok(job.id)
    }

    /// Run one named step of a job. The step row is inserted in the running
    /// state, closed with the outcome of the future, and panics inside the
    /// future are captured as step failures rather than torn down the task.
    pub async fn run_step<F, T>(&self, job_id: &str, name: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        // Cooperative cancellation is observed between steps
        if db::jobs::cancel_requested(&self.pool, job_id).await? {
            return Err(skybridge_common::Error::Cancelled(format!(
                "job '{}' cancelled before step '{}'",
                job_id, name
            )));
        }

        let step_id = db::jobs::insert_step(&self.pool, job_id, name).await?;

        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(value)) => {
                db::jobs::close_step(&self.pool, step_id, "completed", None).await?;
                Ok(value)
            }
            Ok(Err(e)) => {
                let msg = e.to_string();
                db::jobs::close_step(&self.pool, step_id, "failed", Some(&msg)).await?;
                warn!("Step '{}' of job {} failed: {}", name, job_id, msg);
                Err(e)
            }
            Err(panic) => {
                let msg = panic_message(panic);
                db::jobs::close_step(&self.pool, step_id, "failed", Some(&msg)).await?;
                error!("Step '{}' of job {} panicked: {}", name, job_id, msg);
                Err(skybridge_common::Error::System(format!(
                    "step '{}' panicked: {}",
                    name, msg
                )))
            }
        }
    }

    /// Write-once terminal update. Ending a job twice with the same status
    /// is tolerated; a conflicting terminal rewrite is rejected. A job with
    /// failed steps can only terminate as failed or cancelled. The error's
    /// raw text and its canonical category are persisted together; the
    /// activity feed reads the category back instead of re-parsing text.
    pub async fn end_job(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<&skybridge_common::Error>,
    ) -> Result<()> {
        let mut status = status;
        if status == JobStatus::Completed {
            let (_, _, failed) = db::jobs::step_counts(&self.pool, job_id).await?;
            if failed > 0 {
                status = JobStatus::Failed;
            }
        }

        let error_message = error.map(|e| e.to_string());
        let updated = db::jobs::set_terminal(
            &self.pool,
            job_id,
            status.as_str(),
            error_message.as_deref(),
            error.map(|e| e.category()),
        )
        .await?;
        if updated {
            info!("Job {} finished as {}", job_id, status.as_str());
            return Ok(());
        }

        let existing = db::jobs::get(&self.pool, job_id).await?;
        if existing.status == status.as_str() {
            // Duplicate end call, same outcome
            return Ok(());
        }

        Err(skybridge_common::Error::Conflict(format!(
            "job '{}' already ended as {}",
            job_id, existing.status
        )))
    }

    /// Flag a running job for cooperative cancellation
    pub async fn cancel_job(&self, job_id: &str) -> Result<()> {
        db::jobs::request_cancel(&self.pool, job_id).await?;
        info!("Cancellation requested for job {}", job_id);
        Ok(())
    }

    pub async fn find_job_by_any_id(&self, any_id: &str) -> Result<JobView> {
        let record = db::jobs::find_by_any_id(&self.pool, any_id).await?;
        self.view(record).await
    }

    pub async fn get_job_by_external_id(&self, external_id: &str) -> Result<JobView> {
        let record = db::jobs::get_by_external_id(&self.pool, external_id).await?;
        self.view(record).await
    }

    /// Recent jobs for a VM context, newest first
    pub async fn get_jobs_by_context_id(
        &self,
        context_id: &str,
        limit: i64,
    ) -> Result<Vec<JobView>> {
        let records = db::jobs::list_by_context(&self.pool, context_id, limit).await?;
        let mut views = Vec::with_capacity(records.len());
        for record in records {
            views.push(self.view(record).await?);
        }
        Ok(views)
    }

    async fn view(&self, record: db::jobs::JobRecord) -> Result<JobView> {
        let steps = db::jobs::list_steps(&self.pool, &record.id).await?;
        let (total, completed, _failed) = db::jobs::step_counts(&self.pool, &record.id).await?;
        let progress_percent = 100.0 * completed as f64 / std::cmp::max(1, total) as f64;

        Ok(JobView {
            record,
            steps,
            progress_percent,
        })
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_tracker() -> (crate::db::Database, JobTracker) {
        let db = crate::db::Database::new("sqlite::memory:")
            .await
            .expect("Failed to create database");
        db.migrate().await.expect("Failed to run migrations");
        let tracker = JobTracker::new(db.pool().clone());
        (db, tracker)
    }

    fn backup_job() -> NewJob {
        NewJob {
            job_type: "backup".to_string(),
            operation: "start_vm_backup".to_string(),
            owner: "api".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_happy_path_progress() {
        let (_db, tracker) = test_tracker().await;

        let job_id = tracker.start_job(backup_job()).await.unwrap();

        tracker
            .run_step(&job_id, "resolve-context", async { Ok(()) })
            .await
            .unwrap();
        tracker
            .run_step(&job_id, "prepare-disks", async { Ok(()) })
            .await
            .unwrap();
        tracker.end_job(&job_id, JobStatus::Completed, None).await.unwrap();

        let view = tracker.find_job_by_any_id(&job_id).await.unwrap();
        assert_eq!(view.record.status, "completed");
        assert_eq!(view.steps.len(), 2);
        assert_eq!(view.progress_percent, 100.0);
        assert!(view.steps[0].started_at <= view.steps[1].started_at);
    }

    #[tokio::test]
    async fn test_step_failure_fails_job() {
        let (_db, tracker) = test_tracker().await;
        let job_id = tracker.start_job(backup_job()).await.unwrap();

        let result: Result<()> = tracker
            .run_step(&job_id, "allocate-port", async {
                Err(skybridge_common::Error::ResourceExhausted(
                    "no free NBD ports".to_string(),
                ))
            })
            .await;
        assert!(result.is_err());

        // A completed end is coerced to failed because a step failed
        tracker.end_job(&job_id, JobStatus::Completed, None).await.unwrap();
        let view = tracker.find_job_by_any_id(&job_id).await.unwrap();
        assert_eq!(view.record.status, "failed");
        assert_eq!(view.steps[0].status, "failed");
        assert!(view.steps[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("no free NBD ports"));
    }

    #[tokio::test]
    async fn test_panic_is_captured_as_failure() {
        let (_db, tracker) = test_tracker().await;
        let job_id = tracker.start_job(backup_job()).await.unwrap();

        let result: Result<()> = tracker
            .run_step(&job_id, "explode", async { panic!("disk index out of range") })
            .await;
        match result {
            Err(skybridge_common::Error::System(msg)) => {
                assert!(msg.contains("disk index out of range"));
            }
            other => panic!("expected System error, got {:?}", other.map(|_| ())),
        }

        let view = tracker.find_job_by_any_id(&job_id).await.unwrap();
        assert_eq!(view.steps[0].status, "failed");
    }

    #[tokio::test]
    async fn test_end_job_write_once() {
        let (_db, tracker) = test_tracker().await;
        let job_id = tracker.start_job(backup_job()).await.unwrap();

        tracker.end_job(&job_id, JobStatus::Completed, None).await.unwrap();
        // Duplicate identical end is tolerated
        tracker.end_job(&job_id, JobStatus::Completed, None).await.unwrap();
        // Conflicting terminal rewrite is rejected
        let late = skybridge_common::Error::System("late failure".to_string());
        match tracker.end_job(&job_id, JobStatus::Failed, Some(&late)).await {
            Err(skybridge_common::Error::Conflict(_)) => {}
            other => panic!("expected Conflict, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_end_job_persists_error_category() {
        let (_db, tracker) = test_tracker().await;
        let job_id = tracker.start_job(backup_job()).await.unwrap();

        let err = skybridge_common::Error::ResourceExhausted("no free NBD ports".to_string());
        tracker.end_job(&job_id, JobStatus::Failed, Some(&err)).await.unwrap();

        let view = tracker.find_job_by_any_id(&job_id).await.unwrap();
        assert_eq!(view.record.status, "failed");
        assert_eq!(
            view.record.error_category.as_deref(),
            Some("resource_exhausted")
        );
        assert!(view
            .record
            .error_message
            .as_deref()
            .unwrap()
            .contains("no free NBD ports"));
    }

    #[tokio::test]
    async fn test_cancellation_between_steps() {
        let (_db, tracker) = test_tracker().await;
        let job_id = tracker.start_job(backup_job()).await.unwrap();

        tracker
            .run_step(&job_id, "first", async { Ok(()) })
            .await
            .unwrap();

        tracker.cancel_job(&job_id).await.unwrap();

        let result: Result<()> = tracker.run_step(&job_id, "second", async { Ok(()) }).await;
        match result {
            Err(skybridge_common::Error::Cancelled(_)) => {}
            other => panic!("expected Cancelled, got {:?}", other.map(|_| ())),
        }

        tracker.end_job(&job_id, JobStatus::Cancelled, None).await.unwrap();
        let view = tracker.find_job_by_any_id(&job_id).await.unwrap();
        assert_eq!(view.record.status, "cancelled");
        // The second step never opened
        assert_eq!(view.steps.len(), 1);
    }

    #[tokio::test]
    async fn test_external_id_is_stable_across_retries() {
        let (_db, tracker) = test_tracker().await;

        let mut new = backup_job();
        new.external_id = Some("backup-pgtest1-001".to_string());
        let first = tracker.start_job(new.clone()).await.unwrap();
        // A retried start with the same external id reuses the running job
        let second = tracker.start_job(new).await.unwrap();
        assert_eq!(first, second);

        let view = tracker
            .get_job_by_external_id("backup-pgtest1-001")
            .await
            .unwrap();
        assert_eq!(view.record.id, first);
    }
}
