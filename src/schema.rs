//! Database schema definitions for SQLx.
//!
//! This module contains the row types of the `jobs` table and the input type
//! used by producers to insert new jobs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::FromRow;
use std::fmt;

/// Default number of retries a job gets when none is specified.
pub const DEFAULT_MAX_RETRIES: i32 = 5;

/// Reserved payload key under which [`complete`](crate::complete) stores a job's result.
pub const RESULT_KEY: &str = "result";

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be claimed once `scheduled_at` has passed
    Pending,
    /// Leased by a worker
    Processing,
    /// Finished successfully (terminal)
    Completed,
    /// Retries exhausted (terminal)
    Failed,
}

impl JobStatus {
    /// Returns the lowercase name used in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether no further transition can happen from this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a job record in the database
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    /// Unique identifier for the job
    pub id: i64,
    /// Logical queue the job belongs to
    pub queue_name: String,
    /// Type identifier for the job (used for dispatch)
    pub job_type: String,
    /// JSON object containing the job payload
    pub payload: Value,
    /// Current lifecycle state
    pub status: JobStatus,
    /// Priority of the job (higher = more important)
    pub priority: i32,
    /// Number of failed attempts so far
    pub retry_count: i32,
    /// Number of retries allowed before the job fails permanently
    pub max_retries: i32,
    /// The job is not claimable before this instant
    pub scheduled_at: DateTime<Utc>,
    /// Expiry of the current lease, if any
    pub locked_until: Option<DateTime<Utc>>,
    /// Worker holding the current lease, if any
    pub locked_by: Option<String>,
    /// Timestamp when the job was created
    pub created_at: DateTime<Utc>,
    /// Timestamp when the job completed
    pub completed_at: Option<DateTime<Utc>>,
    /// Timestamp when the job failed permanently
    pub failed_at: Option<DateTime<Utc>>,
    /// Reason of the last failed attempt
    pub error_message: Option<String>,
}

impl Job {
    /// The result stored by [`complete`](crate::complete), if any.
    pub fn result(&self) -> Option<&Value> {
        self.payload.get(RESULT_KEY)
    }
}

/// A job to be inserted by a producer
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) queue_name: String,
    pub(crate) job_type: String,
    pub(crate) payload: Value,
    pub(crate) priority: i32,
    pub(crate) max_retries: i32,
    pub(crate) scheduled_at: Option<DateTime<Utc>>,
}

impl NewJob {
    /// Create a job for `queue_name` carrying `payload`.
    pub fn new(queue_name: impl Into<String>, payload: Value) -> Self {
        Self {
            queue_name: queue_name.into(),
            job_type: String::new(),
            payload,
            priority: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            scheduled_at: None,
        }
    }

    /// Set the type used by the runner to dispatch the job.
    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = job_type.into();
        self
    }

    /// Set the priority. Higher values are claimed first.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set how many times the job may be retried after failing.
    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay eligibility until `scheduled_at` instead of the insertion time.
    pub fn scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.queue_name.is_empty() {
            return Err("queue_name must not be empty".into());
        }
        if !self.payload.is_object() {
            return Err("payload must be a JSON object".into());
        }
        if self.max_retries < 0 {
            return Err(format!(
                "max_retries must not be negative, got {}",
                self.max_retries
            ));
        }
        Ok(())
    }
}

impl Default for NewJob {
    fn default() -> Self {
        Self::new(crate::DEFAULT_QUEUE, Value::Object(Map::new()))
    }
}
