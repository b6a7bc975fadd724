#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod background_job;
mod errors;
mod job_registry;
mod retry;
mod runner;
/// Database schema definitions.
pub mod schema;
mod storage;
mod util;
mod worker;

/// The main trait for defining background jobs.
pub use self::background_job::{BackgroundJob, DEFAULT_QUEUE};
/// Error type for queue operations.
pub use self::errors::QueueError;
/// Backoff between failed attempts.
pub use self::retry::RetryPolicy;
/// The main runner that orchestrates job processing.
pub use self::runner::{
    Configured, DEFAULT_LEASE_DURATION, Queue, RunHandle, Runner, Unconfigured,
};
pub use self::schema::{Job, JobStatus, NewJob};
/// Queue store operations.
pub use self::storage::{
    FailOutcome, claim_next, complete, count_by_status, enqueue, enqueue_deduplicated,
    extend_lease, fail, get_job, setup_database,
};
