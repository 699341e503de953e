//! The job record.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::JobId;

/// A job stored in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique, immutable identifier.
    pub id: JobId,
    /// Worker this job is pinned to. Empty means any worker.
    pub worker_name: String,
    /// True while the job is claimed and in progress.
    pub active: bool,
    /// Opaque producer payload.
    pub payload: serde_json::Value,
    /// Failure bookkeeping.
    pub meta_data: JobMeta,
    /// Maximum attempts requested by the producer.
    pub attempts: i32,
    /// Creation time, used as the ordering tie-break.
    pub created: DateTime<Utc>,
    /// Failure reason. Empty means not failed.
    pub failed: String,
    /// Execution timeout in milliseconds, 0 for none.
    pub timeout: i64,
    /// Higher priorities are claimed first.
    pub priority: i32,
    /// Soft-delete tombstone.
    pub is_deleted: bool,
    /// Descriptive status. Eligibility never looks at it.
    pub status: JobStatus,
}

impl Job {
    /// Start building a new job pinned to `worker_name` (empty for any worker).
    pub fn builder(worker_name: impl Into<String>) -> JobBuilder {
        JobBuilder::new(worker_name)
    }

    /// Whether the job may be claimed: not active, not failed, not deleted.
    pub fn is_eligible(&self) -> bool {
        !self.active && self.failed.is_empty() && !self.is_deleted
    }

    pub fn is_failed(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn is_pinned(&self) -> bool {
        !self.worker_name.is_empty()
    }

    /// Whether one more failure uses up the job's attempts.
    pub fn is_last_attempt(&self) -> bool {
        i64::from(self.meta_data.failed_attempts) + 1 >= i64::from(self.attempts)
    }
}

/// Failure bookkeeping carried alongside a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMeta {
    pub failed_attempts: u32,
    pub errors: Vec<String>,
}

impl JobMeta {
    pub fn record_failure(&mut self, reason: &str) {
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        self.errors.push(reason.to_string());
    }
}

/// Status of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Idle,
    Processing,
    Finished,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Processing => "processing",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "idle" => Ok(JobStatus::Idle),
            "processing" => Ok(JobStatus::Processing),
            "finished" => Ok(JobStatus::Finished),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Builder for new jobs.
#[derive(Debug, Clone)]
pub struct JobBuilder {
    id: Option<JobId>,
    worker_name: String,
    payload: serde_json::Value,
    attempts: i32,
    timeout: i64,
    priority: i32,
    created: Option<DateTime<Utc>>,
}

impl JobBuilder {
    pub fn new(worker_name: impl Into<String>) -> Self {
        Self {
            id: None,
            worker_name: worker_name.into(),
            payload: serde_json::json!({}),
            attempts: 0,
            timeout: 0,
            priority: 0,
            created: None,
        }
    }

    pub fn id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Runs allowed before a failure sticks. 0 and 1 both mean a single run.
    pub fn attempts(mut self, attempts: i32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Timeout in milliseconds.
    pub fn timeout(mut self, timeout_ms: i64) -> Self {
        self.timeout = timeout_ms;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Creation time. Stored at microsecond precision.
    pub fn created(mut self, created: DateTime<Utc>) -> Self {
        self.created = Some(created);
        self
    }

    pub fn build(self) -> Job {
        Job {
            id: self.id.unwrap_or_default(),
            worker_name: self.worker_name,
            active: false,
            payload: self.payload,
            meta_data: JobMeta::default(),
            attempts: self.attempts,
            created: self.created.unwrap_or_else(Utc::now).trunc_subsecs(6),
            failed: String::new(),
            timeout: self.timeout,
            priority: self.priority,
            is_deleted: false,
            status: JobStatus::Idle,
        }
    }
}
