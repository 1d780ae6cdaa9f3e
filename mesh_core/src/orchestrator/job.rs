//! Job records and their lifecycle.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use world_engine::Timestamp;

use super::job_type::{JobPayload, JobType};
use crate::error::Result;
use crate::policy::AccountId;
use crate::registry::NodeId;

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// `Pending → Running → {Completed, Failed}`. A failed attempt returns a job
/// to Pending while its retry budget lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a job ended in Failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobError {
    /// Every allowed attempt failed or timed out.
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("cancelled")]
    Cancelled,

    /// The node succeeded but its result could not be applied locally.
    #[error("result could not be applied: {message}")]
    Effect { message: String },
}

/// A unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub priority: i32,
    pub metadata: Value,
    /// Submitting account; `None` for system-scheduled jobs.
    pub account_id: Option<AccountId>,
    pub status: JobStatus,
    pub submitted_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub result: Option<Value>,
    pub error: Option<JobError>,
    pub retry_count: u32,
    /// Node running the current attempt.
    pub node_id: Option<NodeId>,
    /// Submission order; ties in priority dispatch in this order.
    pub(crate) sequence: u64,
}

impl Job {
    pub(crate) fn new(
        job_type: JobType,
        priority: i32,
        metadata: Value,
        account_id: Option<AccountId>,
        sequence: u64,
        now: Timestamp,
    ) -> Self {
        Self {
            id: JobId::new(),
            job_type,
            priority,
            metadata,
            account_id,
            status: JobStatus::Pending,
            submitted_at: now,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            retry_count: 0,
            node_id: None,
            sequence,
        }
    }

    /// Typed view of the metadata.
    pub fn payload(&self) -> Result<JobPayload> {
        self.job_type.parse_payload(&self.metadata)
    }

    /// Attempt number of the current or next dispatch, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    pub(crate) fn start(&mut self, node_id: NodeId, now: Timestamp) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        self.status = JobStatus::Running;
        self.node_id = Some(node_id);
        self.started_at = Some(now);
        true
    }

    pub(crate) fn complete(&mut self, result: Value, now: Timestamp) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(now);
        true
    }

    /// Record a failed attempt. Returns true if the job went back to Pending.
    pub(crate) fn fail_attempt(&mut self, error: String, retry_limit: u32, now: Timestamp) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        self.node_id = None;
        if self.retry_count < retry_limit {
            self.retry_count += 1;
            self.status = JobStatus::Pending;
            true
        } else {
            self.fail(
                JobError::Exhausted {
                    attempts: self.attempt(),
                    last_error: error,
                },
                now,
            );
            false
        }
    }

    pub(crate) fn fail(&mut self, error: JobError, now: Timestamp) {
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(now);
    }
}
