use crate::schema::JobStatus;
use thiserror::Error;

/// Errors returned by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The referenced job does not exist.
    #[error("job {0} not found")]
    NotFound(i64),

    /// The job is not `processing` under the caller's lease.
    ///
    /// Most commonly the lease expired and another worker claimed the job.
    /// Callers must discard their work instead of retrying.
    #[error("job {job_id} is {status} and not leased by this worker")]
    InvalidState {
        /// The job that was referenced
        job_id: i64,
        /// The state the job was found in
        status: JobStatus,
    },

    /// Malformed input, rejected before any state was touched.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Error serializing or deserializing a job payload.
    #[error("failed to serialize job payload: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl QueueError {
    /// Whether the caller lost ownership of the job it was working on.
    pub fn is_lost_lease(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }
}
