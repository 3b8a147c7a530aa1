///! Cron-driven protection scheduler
///!
///! Evaluates schedules once per tick against the configured timezone,
///! fires the protection flows bound to each due schedule, and applies the
///! per-schedule retry policy. Schedules are re-read from the database every
///! tick, so enable/disable and edits take effect without a restart; the
///! (schedule, wall-clock minute) uniqueness in schedule_executions makes
///! replayed evaluations idempotent.

use crate::db;
use crate::flows::ProtectionFlowService;
use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use croner::parser::{CronParser, Seconds};
use croner::Cron;
use serde::Deserialize;
use skybridge_common::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateScheduleRequest {
    pub name: String,
    pub cron_expression: String,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_concurrency")]
    pub max_concurrent_jobs: i64,
    #[serde(default)]
    pub retry_attempts: i64,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_minutes: i64,
    #[serde(default = "default_true")]
    pub skip_if_running: bool,
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> i64 {
    1
}

fn default_retry_delay() -> i64 {
    5
}

/// Parse a 5- or 6-field cron expression
pub fn parse_cron(expression: &str) -> Result<Cron> {
    CronParser::builder()
        .seconds(Seconds::Optional)
        .build()
        .parse(expression)
        .map_err(|e| {
            skybridge_common::Error::InvalidRequest(format!(
                "invalid cron expression '{}': {}",
                expression, e
            ))
        })
}

/// Whether a schedule fires at this instant in its timezone. Evaluation is
/// minute-grained: seconds are truncated first.
pub fn cron_matches(expression: &str, timezone: Tz, now: DateTime<Utc>) -> Result<bool> {
    let cron = parse_cron(expression)?;
    let local = now.with_timezone(&timezone);
    let minute = local.with_second(0).and_then(|t| t.with_nanosecond(0)).unwrap_or(local);

    cron.is_time_matching(&minute).map_err(|e| {
        skybridge_common::Error::System(format!(
            "cron evaluation failed for '{}': {}",
            expression, e
        ))
    })
}

/// Stable idempotency key for (schedule, wall-clock minute)
pub fn fire_minute_key(timezone: Tz, now: DateTime<Utc>) -> String {
    now.with_timezone(&timezone)
        .format("%Y-%m-%dT%H:%M")
        .to_string()
}

pub struct Scheduler {
    pool: SqlitePool,
    flows: ProtectionFlowService,
    default_timezone: Tz,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(
        pool: SqlitePool,
        flows: ProtectionFlowService,
        default_timezone: Tz,
        tick_interval: Duration,
    ) -> Self {
        Self {
            pool,
            flows,
            default_timezone,
            tick_interval,
        }
    }

    /// Background evaluation loop; runs until the process exits
    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick_interval);
            info!(
                "Scheduler started (tick {:?}, timezone {})",
                self.tick_interval, self.default_timezone
            );

            loop {
                interval.tick().await;
                if let Err(e) = self.evaluate(Utc::now()).await {
                    error!("Scheduler tick failed: {}", e);
                }
            }
        });
    }

    /// One evaluation pass over every enabled schedule
    pub async fn evaluate(&self, now: DateTime<Utc>) -> Result<usize> {
        let schedules = db::schedules::list(&self.pool, true).await?;
        let mut fired = 0;

        for schedule in schedules {
            let timezone = schedule
                .timezone
                .as_deref()
                .and_then(|tz| tz.parse::<Tz>().ok())
                .unwrap_or(self.default_timezone);

            let due = match cron_matches(&schedule.cron_expression, timezone, now) {
                Ok(due) => due,
                Err(e) => {
                    warn!("Schedule '{}' skipped: {}", schedule.name, e);
                    continue;
                }
            };
            if !due {
                continue;
            }

            if self.fire_schedule(&schedule, timezone, now).await? {
                fired += 1;
            }
        }

        Ok(fired)
    }

    /// Fire one due schedule. Returns false when this minute already fired
    /// or the previous run is still live and skip_if_running is set.
    async fn fire_schedule(
        &self,
        schedule: &db::schedules::ScheduleRecord,
        timezone: Tz,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let execution_id = format!("sexec-{}", uuid::Uuid::new_v4());
        let recorded = db::schedules::record_execution(
            &self.pool,
            &db::schedules::ScheduleExecutionRecord {
                id: execution_id.clone(),
                schedule_id: schedule.id.clone(),
                fire_minute: fire_minute_key(timezone, now),
                status: "running".to_string(),
                vms_selected: 0,
                details: None,
                created_at: now.timestamp(),
            },
        )
        .await?;

        if !recorded {
            // This minute already fired (replayed evaluation)
            return Ok(false);
        }

        let flows = self.flows.list_for_schedule(&schedule.id).await?;
        if flows.is_empty() {
            db::schedules::finish_execution(
                &self.pool,
                &execution_id,
                "completed",
                Some("no flows bound to schedule"),
            )
            .await?;
            return Ok(true);
        }

        for flow in flows {
            if schedule.skip_if_running && self.flows.has_live_execution(&flow.id).await? {
                warn!(
                    "Schedule '{}' skipped flow '{}': previous run still live",
                    schedule.name, flow.name
                );
                db::schedules::finish_execution(
                    &self.pool,
                    &execution_id,
                    "skipped",
                    Some(&format!("flow '{}' still running", flow.name)),
                )
                .await?;
                continue;
            }

            self.spawn_flow_with_retries(flow, schedule.clone(), execution_id.clone());
        }

        info!("Schedule '{}' fired", schedule.name);
        Ok(true)
    }

    /// Detached fan-out with linear retry backoff
    fn spawn_flow_with_retries(
        &self,
        flow: db::flows::ProtectionFlowRecord,
        schedule: db::schedules::ScheduleRecord,
        execution_id: String,
    ) {
        let flows = self.flows.clone();
        let pool = self.pool.clone();

        tokio::spawn(async move {
            let attempts = schedule.retry_attempts.max(0) as u64 + 1;
            let mut last_error = None;

            for attempt in 1..=attempts {
                match flows.execute_flow(&flow.id, schedule.max_concurrent_jobs).await {
                    Ok(summary) => {
                        let _ = db::schedules::finish_execution(
                            &pool,
                            &execution_id,
                            "completed",
                            Some(&format!(
                                "flow '{}': {} ok, {} failed",
                                flow.name, summary.vms_succeeded, summary.vms_failed
                            )),
                        )
                        .await;
                        return;
                    }
                    Err(e) => {
                        warn!(
                            "Flow '{}' attempt {}/{} failed: {}",
                            flow.name, attempt, attempts, e
                        );
                        last_error = Some(e.to_string());
                        if attempt < attempts {
                            // Linear backoff per the schedule's retry policy
                            let delay = Duration::from_secs(
                                60 * schedule.retry_delay_minutes.max(1) as u64 * attempt,
                            );
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }

            let _ = db::schedules::finish_execution(
                &pool,
                &execution_id,
                "failed",
                last_error.as_deref(),
            )
            .await;
        });
    }
}

/// CRUD-level helpers shared by the handlers
pub async fn create_schedule(
    pool: &SqlitePool,
    request: CreateScheduleRequest,
) -> Result<db::schedules::ScheduleRecord> {
    parse_cron(&request.cron_expression)?;
    if let Some(ref tz) = request.timezone {
        tz.parse::<Tz>().map_err(|_| {
            skybridge_common::Error::InvalidRequest(format!("unknown timezone '{}'", tz))
        })?;
    }

    let schedule = db::schedules::ScheduleRecord {
        id: format!("sched-{}", uuid::Uuid::new_v4()),
        name: request.name,
        cron_expression: request.cron_expression,
        timezone: request.timezone,
        enabled: request.enabled,
        max_concurrent_jobs: request.max_concurrent_jobs.max(1),
        retry_attempts: request.retry_attempts.max(0),
        retry_delay_minutes: request.retry_delay_minutes.max(1),
        skip_if_running: request.skip_if_running,
        created_at: chrono::Utc::now().timestamp(),
        updated_at: chrono::Utc::now().timestamp(),
    };

    db::schedules::create(pool, &schedule).await?;
    Ok(schedule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_five_field_cron_matching() {
        let tz = chrono_tz::UTC;
        let at_05 = Utc.with_ymd_and_hms(2026, 8, 1, 12, 5, 0).unwrap();
        let at_03 = Utc.with_ymd_and_hms(2026, 8, 1, 12, 3, 0).unwrap();

        assert!(cron_matches("*/5 * * * *", tz, at_05).unwrap());
        assert!(!cron_matches("*/5 * * * *", tz, at_03).unwrap());
        // Seconds are truncated before matching
        let at_05_30s = Utc.with_ymd_and_hms(2026, 8, 1, 12, 5, 30).unwrap();
        assert!(cron_matches("*/5 * * * *", tz, at_05_30s).unwrap());
    }

    #[test]
    fn test_six_field_cron_is_accepted() {
        let tz = chrono_tz::UTC;
        let at = Utc.with_ymd_and_hms(2026, 8, 1, 2, 0, 0).unwrap();
        assert!(cron_matches("0 0 2 * * *", tz, at).unwrap());
    }

    #[test]
    fn test_invalid_cron_is_rejected() {
        assert!(parse_cron("not a cron").is_err());
        assert!(parse_cron("* * * *").is_err());
    }

    #[test]
    fn test_timezone_shifts_matching() {
        // 02:00 Berlin in summer is 00:00 UTC
        let at = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap();
        assert!(cron_matches("0 2 * * *", chrono_tz::Europe::Berlin, at).unwrap());
        assert!(!cron_matches("0 2 * * *", chrono_tz::UTC, at).unwrap());
    }

    #[test]
    fn test_fire_minute_key_is_minute_stable() {
        let tz = chrono_tz::UTC;
        let a = Utc.with_ymd_and_hms(2026, 8, 1, 12, 5, 1).unwrap();
        let b = Utc.with_ymd_and_hms(2026, 8, 1, 12, 5, 59).unwrap();
        assert_eq!(fire_minute_key(tz, a), fire_minute_key(tz, b));
        assert_eq!(fire_minute_key(tz, a), "2026-08-01T12:05");
    }

    #[tokio::test]
    async fn test_create_schedule_validates_inputs() {
        let db = crate::db::Database::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let bad_cron = create_schedule(
            db.pool(),
            CreateScheduleRequest {
                name: "broken".to_string(),
                cron_expression: "whenever".to_string(),
                timezone: None,
                enabled: true,
                max_concurrent_jobs: 2,
                retry_attempts: 1,
                retry_delay_minutes: 5,
                skip_if_running: true,
            },
        )
        .await;
        assert!(bad_cron.is_err());

        let bad_tz = create_schedule(
            db.pool(),
            CreateScheduleRequest {
                name: "broken-tz".to_string(),
                cron_expression: "*/5 * * * *".to_string(),
                timezone: Some("Mars/Olympus".to_string()),
                enabled: true,
                max_concurrent_jobs: 2,
                retry_attempts: 1,
                retry_delay_minutes: 5,
                skip_if_running: true,
            },
        )
        .await;
        assert!(bad_tz.is_err());

        let ok = create_schedule(
            db.pool(),
            CreateScheduleRequest {
                name: "nightly".to_string(),
                cron_expression: "0 2 * * *".to_string(),
                timezone: Some("Europe/Berlin".to_string()),
                enabled: true,
                max_concurrent_jobs: 0,
                retry_attempts: -3,
                retry_delay_minutes: 0,
                skip_if_running: true,
            },
        )
        .await
        .unwrap();
        // Floors applied
        assert_eq!(ok.max_concurrent_jobs, 1);
        assert_eq!(ok.retry_attempts, 0);
        assert_eq!(ok.retry_delay_minutes, 1);
    }
}
