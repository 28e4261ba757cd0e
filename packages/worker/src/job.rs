//! Control-plane models: jobs and their execution history.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Per-attempt wall-clock budget when the job does not set one.
const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Declarative description of scheduled collection work.
///
/// Owned by the control store; survives worker restarts. An enabled job
/// with `next_run_time = NULL` is parked until an administrator triggers
/// it.
#[derive(Debug, Clone)]
pub struct CollectionJob {
    pub id: i64,
    pub name: String,
    /// Collector family: web-rpa, api, database.
    pub job_type: String,
    pub status: JobStatus,
    /// Used to synthesize a task config when `config` is absent.
    pub data_source_id: Option<i64>,
    /// 5- or 6-field cron expression; absent for one-shot jobs.
    pub cron: Option<String>,
    pub next_run_time: Option<DateTime<Utc>>,
    /// Maximum concurrent running attempts (0 means 1).
    pub replicas: i32,
    /// Per-attempt budget in seconds (0 means 300).
    pub execution_timeout: i32,
    /// Retry ceiling (0 means 3).
    pub max_retries: i32,
    /// Optional fully-specified task config, JSON.
    pub config: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CollectionJob {
    pub fn execution_timeout(&self) -> Duration {
        if self.execution_timeout > 0 {
            Duration::from_secs(self.execution_timeout as u64)
        } else {
            DEFAULT_EXECUTION_TIMEOUT
        }
    }

    pub fn replicas(&self) -> i32 {
        self.replicas.max(1)
    }

    /// The cron expression, if one is set and non-empty.
    pub fn cron_expression(&self) -> Option<&str> {
        self.cron.as_deref().filter(|c| !c.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Enabled,
    Disabled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Enabled => "enabled",
            JobStatus::Disabled => "disabled",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "enabled" => JobStatus::Enabled,
            _ => JobStatus::Disabled,
        }
    }
}

/// One history row per retry sequence (never one per retry).
#[derive(Debug, Clone)]
pub struct ExecutionAttempt {
    pub id: i64,
    pub job_id: i64,
    pub worker_identity: String,
    pub status: AttemptStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub records_collected: i64,
    pub error_message: String,
    /// Last attempt index reached within the sequence.
    pub retry_count: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Running,
    Success,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Running => "running",
            AttemptStatus::Success => "success",
            AttemptStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "running" => AttemptStatus::Running,
            "success" => AttemptStatus::Success,
            _ => AttemptStatus::Failed,
        }
    }
}
