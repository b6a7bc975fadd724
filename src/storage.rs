use crate::errors::QueueError;
use crate::retry::RetryPolicy;
use crate::schema::{Job, JobStatus, NewJob, RESULT_KEY};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use std::time::Duration;
use tracing::{debug, instrument, warn};

const JOB_COLUMNS: &str = "id, queue_name, job_type, payload, status, priority, retry_count, \
     max_retries, scheduled_at, locked_until, locked_by, created_at, completed_at, failed_at, \
     error_message";

/// `error_message` of a job whose lease expired on its last attempt.
const LEASE_EXPIRED_ERROR: &str = "lease expired";

/// What happened to a job after [`fail`] recorded a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The job went back to `pending` and becomes eligible at `scheduled_at`.
    Retrying {
        /// Failed attempts so far, including this one
        retry_count: i32,
        /// When the job becomes claimable again
        scheduled_at: DateTime<Utc>,
    },
    /// Retries are exhausted; the job is permanently `failed`.
    Exhausted,
}

/// Run the embedded migrations, creating the `jobs` table if needed.
pub async fn setup_database(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Insert a new `pending` job and return its id.
#[instrument(name = "workqueue.enqueue", skip_all, fields(queue = %job.queue_name, job_type = %job.job_type))]
pub async fn enqueue(pool: &PgPool, job: &NewJob) -> Result<i64, QueueError> {
    job.validate().map_err(QueueError::Validation)?;
    let mut conn = pool.acquire().await?;
    insert_job(&mut conn, job).await
}

/// Insert a new `pending` job unless an identical one is already waiting.
///
/// Returns `None` if the job was deduplicated. Jobs that are currently being
/// processed do not count as duplicates. Concurrent producers of the same job
/// are serialized, so at most one of them inserts it.
#[instrument(name = "workqueue.enqueue", skip_all, fields(queue = %job.queue_name, job_type = %job.job_type))]
pub async fn enqueue_deduplicated(pool: &PgPool, job: &NewJob) -> Result<Option<i64>, QueueError> {
    job.validate().map_err(QueueError::Validation)?;
    let mut tx = pool.begin().await?;
    let id = insert_job_deduplicated(&mut tx, job).await?;
    tx.commit().await?;
    Ok(id)
}

pub(crate) async fn insert_job(conn: &mut PgConnection, job: &NewJob) -> Result<i64, QueueError> {
    let id = sqlx::query_scalar::<_, i64>(
        r"
        INSERT INTO jobs (queue_name, job_type, payload, priority, max_retries, scheduled_at)
        VALUES ($1, $2, $3, $4, $5, COALESCE($6, NOW()))
        RETURNING id
        ",
    )
    .bind(&job.queue_name)
    .bind(&job.job_type)
    .bind(&job.payload)
    .bind(job.priority)
    .bind(job.max_retries)
    .bind(job.scheduled_at)
    .fetch_one(conn)
    .await?;

    Ok(id)
}

/// Must run inside a transaction: the advisory lock is held until it ends.
pub(crate) async fn insert_job_deduplicated(
    conn: &mut PgConnection,
    job: &NewJob,
) -> Result<Option<i64>, QueueError> {
    sqlx::query(
        "SELECT pg_advisory_xact_lock(hashtextextended($1 || chr(31) || $2 || chr(31) || $3::text, 0))",
    )
    .bind(&job.queue_name)
    .bind(&job.job_type)
    .bind(&job.payload)
    .execute(&mut *conn)
    .await?;

    let id = sqlx::query_scalar::<_, i64>(
        r"
        INSERT INTO jobs (queue_name, job_type, payload, priority, max_retries, scheduled_at)
        SELECT $1, $2, $3, $4, $5, COALESCE($6, NOW())
        WHERE NOT EXISTS (
            SELECT 1 FROM jobs
            WHERE queue_name = $1 AND job_type = $2 AND payload = $3 AND status = 'pending'
        )
        RETURNING id
        ",
    )
    .bind(&job.queue_name)
    .bind(&job.job_type)
    .bind(&job.payload)
    .bind(job.priority)
    .bind(job.max_retries)
    .bind(job.scheduled_at)
    .fetch_optional(conn)
    .await?;

    Ok(id)
}

/// Atomically claim the next eligible job of `queue_name` for `worker_id`.
///
/// Eligible jobs are `pending` jobs whose `scheduled_at` has passed, and
/// `processing` jobs whose lease has expired. Rows locked by concurrent
/// claimers are skipped rather than waited on. Returns `None` if nothing is
/// eligible.
///
/// An expired lease counts as a failed attempt: reclaiming increments
/// `retry_count`, and an expired job without retries left is marked `failed`
/// instead of being handed out again.
#[instrument(name = "workqueue.claim_next", skip(pool, lease_duration))]
pub async fn claim_next(
    pool: &PgPool,
    queue_name: &str,
    worker_id: &str,
    lease_duration: Duration,
) -> Result<Option<Job>, QueueError> {
    validate_lease(worker_id, lease_duration)?;
    if queue_name.is_empty() {
        return Ok(None);
    }

    fail_exhausted_leases(pool, queue_name).await?;

    let query = format!(
        r"
        WITH next_job AS (
            SELECT id
            FROM jobs
            WHERE queue_name = $1
              AND (
                    (status = 'pending' AND scheduled_at <= NOW())
                 OR (status = 'processing' AND locked_until < NOW() AND retry_count < max_retries)
              )
            ORDER BY priority DESC, scheduled_at ASC, id ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
        )
        UPDATE jobs
        SET retry_count = CASE
                WHEN jobs.status = 'processing' THEN jobs.retry_count + 1
                ELSE jobs.retry_count
            END,
            status = 'processing',
            locked_by = $2,
            locked_until = NOW() + make_interval(secs => $3)
        FROM next_job
        WHERE jobs.id = next_job.id
        RETURNING {}
        ",
        qualified_columns("jobs")
    );

    let job = sqlx::query_as::<_, Job>(&query)
        .bind(queue_name)
        .bind(worker_id)
        .bind(lease_duration.as_secs_f64())
        .fetch_optional(pool)
        .await?;

    if let Some(job) = &job {
        debug!(job.id = job.id, job.retry_count = job.retry_count, "Claimed job");
    }

    Ok(job)
}

/// Fails expired jobs of `queue_name` that have no retries left.
async fn fail_exhausted_leases(pool: &PgPool, queue_name: &str) -> Result<(), QueueError> {
    let failed = sqlx::query_scalar::<_, i64>(
        r"
        UPDATE jobs
        SET status = 'failed',
            failed_at = NOW(),
            locked_by = NULL,
            locked_until = NULL,
            error_message = $2
        WHERE id IN (
            SELECT id
            FROM jobs
            WHERE queue_name = $1
              AND status = 'processing'
              AND locked_until < NOW()
              AND retry_count >= max_retries
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id
        ",
    )
    .bind(queue_name)
    .bind(LEASE_EXPIRED_ERROR)
    .fetch_all(pool)
    .await?;

    for job_id in failed {
        warn!(job.id = job_id, "Job lease expired with no retries left, giving up");
    }

    Ok(())
}

/// Mark a job leased by `worker_id` as completed.
///
/// A `Some` result is merged into the payload under [`RESULT_KEY`](crate::schema::RESULT_KEY).
/// Fails with [`QueueError::InvalidState`] if the job is not `processing` under
/// this worker's lease, in which case the caller must discard its work.
#[instrument(name = "workqueue.complete", skip(pool, result))]
pub async fn complete(
    pool: &PgPool,
    job_id: i64,
    worker_id: &str,
    result: Option<&Value>,
) -> Result<(), QueueError> {
    let mut tx = pool.begin().await?;
    lock_leased_job(&mut tx, job_id, worker_id).await?;

    sqlx::query(
        r"
        UPDATE jobs
        SET status = 'completed',
            completed_at = NOW(),
            locked_by = NULL,
            locked_until = NULL,
            payload = CASE
                WHEN $2::jsonb IS NULL THEN payload
                ELSE payload || jsonb_build_object($3::text, $2::jsonb)
            END
        WHERE id = $1
        ",
    )
    .bind(job_id)
    .bind(result)
    .bind(RESULT_KEY)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Record a failed attempt of a job leased by `worker_id`.
///
/// The job is rescheduled with exponential backoff while it has retries left,
/// and otherwise marked as permanently `failed`.
#[instrument(name = "workqueue.fail", skip(pool, retry_policy))]
pub async fn fail(
    pool: &PgPool,
    job_id: i64,
    worker_id: &str,
    error_message: &str,
    retry_policy: &RetryPolicy,
) -> Result<FailOutcome, QueueError> {
    let mut tx = pool.begin().await?;
    let (retry_count, max_retries) = lock_leased_job(&mut tx, job_id, worker_id).await?;

    let outcome = if retry_count < max_retries {
        let delay = retry_policy.delay_for(u32::try_from(retry_count).unwrap_or(0));
        let (retry_count, scheduled_at) = sqlx::query_as::<_, (i32, DateTime<Utc>)>(
            r"
            UPDATE jobs
            SET status = 'pending',
                retry_count = retry_count + 1,
                scheduled_at = NOW() + make_interval(secs => $2),
                locked_by = NULL,
                locked_until = NULL,
                error_message = $3
            WHERE id = $1
            RETURNING retry_count, scheduled_at
            ",
        )
        .bind(job_id)
        .bind(delay.as_secs_f64())
        .bind(error_message)
        .fetch_one(&mut *tx)
        .await?;

        FailOutcome::Retrying {
            retry_count,
            scheduled_at,
        }
    } else {
        sqlx::query(
            r"
            UPDATE jobs
            SET status = 'failed',
                failed_at = NOW(),
                locked_by = NULL,
                locked_until = NULL,
                error_message = $2
            WHERE id = $1
            ",
        )
        .bind(job_id)
        .bind(error_message)
        .execute(&mut *tx)
        .await?;

        FailOutcome::Exhausted
    };

    tx.commit().await?;
    Ok(outcome)
}

/// Push the lease of a job held by `worker_id` to `NOW() + lease_duration`.
///
/// Returns the new lease expiry.
#[instrument(name = "workqueue.extend_lease", skip(pool, lease_duration))]
pub async fn extend_lease(
    pool: &PgPool,
    job_id: i64,
    worker_id: &str,
    lease_duration: Duration,
) -> Result<DateTime<Utc>, QueueError> {
    validate_lease(worker_id, lease_duration)?;

    let mut tx = pool.begin().await?;
    lock_leased_job(&mut tx, job_id, worker_id).await?;

    let locked_until = sqlx::query_scalar::<_, DateTime<Utc>>(
        "UPDATE jobs SET locked_until = NOW() + make_interval(secs => $2) WHERE id = $1 RETURNING locked_until",
    )
    .bind(job_id)
    .bind(lease_duration.as_secs_f64())
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(locked_until)
}

/// Fetch a job by id.
pub async fn get_job(pool: &PgPool, job_id: i64) -> Result<Option<Job>, QueueError> {
    let query = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
    let job = sqlx::query_as::<_, Job>(&query)
        .bind(job_id)
        .fetch_optional(pool)
        .await?;
    Ok(job)
}

/// The number of jobs of `queue_name` currently in `status`
pub async fn count_by_status(
    pool: &PgPool,
    queue_name: &str,
    status: JobStatus,
) -> Result<i64, QueueError> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM jobs WHERE queue_name = $1 AND status = $2",
    )
    .bind(queue_name)
    .bind(status)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Locks the job row for the rest of the transaction and checks that it is
/// `processing` under `worker_id`'s lease.
///
/// Returns the job's `(retry_count, max_retries)`.
async fn lock_leased_job(
    conn: &mut PgConnection,
    job_id: i64,
    worker_id: &str,
) -> Result<(i32, i32), QueueError> {
    let row = sqlx::query_as::<_, (JobStatus, Option<String>, i32, i32)>(
        "SELECT status, locked_by, retry_count, max_retries FROM jobs WHERE id = $1 FOR UPDATE",
    )
    .bind(job_id)
    .fetch_optional(conn)
    .await?;

    let Some((status, locked_by, retry_count, max_retries)) = row else {
        return Err(QueueError::NotFound(job_id));
    };

    if status != JobStatus::Processing || locked_by.as_deref() != Some(worker_id) {
        return Err(QueueError::InvalidState { job_id, status });
    }

    Ok((retry_count, max_retries))
}

fn validate_lease(worker_id: &str, lease_duration: Duration) -> Result<(), QueueError> {
    if worker_id.is_empty() {
        return Err(QueueError::Validation("worker_id must not be empty".into()));
    }
    if lease_duration.is_zero() {
        return Err(QueueError::Validation(
            "lease_duration must be positive".into(),
        ));
    }
    Ok(())
}

fn qualified_columns(table: &str) -> String {
    JOB_COLUMNS
        .split(", ")
        .map(|column| format!("{table}.{column}"))
        .collect::<Vec<_>>()
        .join(", ")
}
