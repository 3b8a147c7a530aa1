//! Common types shared between the Skybridge hub and its tooling

use serde::{Deserialize, Serialize};

/// Backup type for a chain entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Incremental,
}

impl std::fmt::Display for BackupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Incremental => write!(f, "incremental"),
        }
    }
}

impl std::str::FromStr for BackupType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            other => Err(Error::InvalidRequest(format!(
                "unknown backup type '{}'",
                other
            ))),
        }
    }
}

/// Failover flavor
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailoverType {
    Test,
    Live,
}

impl std::fmt::Display for FailoverType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Test => write!(f, "test"),
            Self::Live => write!(f, "live"),
        }
    }
}

impl std::str::FromStr for FailoverType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "test" => Ok(Self::Test),
            "live" => Ok(Self::Live),
            other => Err(Error::InvalidRequest(format!(
                "unknown failover type '{}'",
                other
            ))),
        }
    }
}

/// Coarse status of a managed VM context
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VmContextStatus {
    Discovered,
    Replicating,
    ReadyForFailover,
    Failed,
}

impl VmContextStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Replicating => "replicating",
            Self::ReadyForFailover => "ready_for_failover",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "replicating" => Self::Replicating,
            "ready_for_failover" => Self::ReadyForFailover,
            "failed" => Self::Failed,
            _ => Self::Discovered,
        }
    }
}

/// Status shared by jobs, steps and flow executions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "queued" => Self::Queued,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Running,
        }
    }

    /// Terminal statuses are write-once
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Progress payload pushed by a Node for a running transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryUpdate {
    pub bytes_transferred: Option<i64>,
    pub progress_percent: Option<f64>,
    pub transfer_speed_bps: Option<i64>,
    pub current_phase: Option<String>,
    pub status: Option<String>,
}

/// Error taxonomy, independent of the HTTP transport
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("System error: {0}")]
    System(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable category name used by the job log and the activity feed
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::PreconditionFailed(_) => "precondition_failed",
            Self::RemoteUnavailable(_) => "remote_unavailable",
            Self::Cancelled(_) => "cancelled",
            Self::System(_) | Self::Io(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_type_round_trip() {
        let json = serde_json::to_string(&BackupType::Incremental).unwrap();
        assert_eq!(json, "\"incremental\"");
        let parsed: BackupType = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, BackupType::Incremental);
        assert_eq!("full".parse::<BackupType>().unwrap(), BackupType::Full);
        assert!("differential".parse::<BackupType>().is_err());
    }

    #[test]
    fn test_job_status_terminality() {
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_job_status_parse() {
        assert_eq!(JobStatus::parse("completed"), JobStatus::Completed);
        assert_eq!(JobStatus::parse("bogus"), JobStatus::Running);
        assert_eq!(JobStatus::Cancelled.as_str(), "cancelled");
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(Error::NotFound("x".into()).category(), "not_found");
        assert_eq!(
            Error::ResourceExhausted("ports".into()).category(),
            "resource_exhausted"
        );
        assert_eq!(Error::System("boom".into()).category(), "internal");
    }

    #[test]
    fn test_vm_context_status_parse() {
        assert_eq!(
            VmContextStatus::parse("ready_for_failover"),
            VmContextStatus::ReadyForFailover
        );
        assert_eq!(VmContextStatus::parse("unknown"), VmContextStatus::Discovered);
    }
}
