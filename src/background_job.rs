use crate::errors::QueueError;
use crate::schema::{DEFAULT_MAX_RETRIES, NewJob};
use crate::storage;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::PgPool;
use std::future::Future;
use tracing::instrument;

/// The default queue name used when no specific queue is specified.
pub const DEFAULT_QUEUE: &str = "default";

/// Trait for defining background jobs that can be enqueued and executed asynchronously.
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the task.
    ///
    /// This MUST be unique for the whole application.
    const JOB_TYPE: &'static str;

    /// Default priority of the task. Higher values are claimed first.
    const PRIORITY: i32 = 0;

    /// How many times a failed run is retried before the job fails permanently.
    const MAX_RETRIES: i32 = DEFAULT_MAX_RETRIES;

    /// Whether the job should be deduplicated.
    ///
    /// If true, the job will not be enqueued if there is already a pending
    /// job with the same data.
    const DEDUPLICATED: bool = false;

    /// Job queue where this job will be executed.
    const QUEUE: &'static str = DEFAULT_QUEUE;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + 'static;

    /// Value stored under the `result` key of the payload on success.
    ///
    /// Use `()` to store nothing.
    type Output: Serialize + Send + 'static;

    /// Execute the task. This method should define its logic.
    fn run(&self, ctx: Self::Context) -> impl Future<Output = anyhow::Result<Self::Output>> + Send;

    /// Enqueue this job for background execution.
    ///
    /// Returns the job ID if successfully enqueued, or None if deduplicated.
    #[instrument(name = "workqueue.enqueue_job", skip(self, pool), fields(job_type = Self::JOB_TYPE))]
    fn enqueue<'a>(&'a self, pool: &'a PgPool) -> BoxFuture<'a, Result<Option<i64>, QueueError>> {
        let job = match new_job(self) {
            Ok(job) => job,
            Err(err) => return async move { Err(err) }.boxed(),
        };

        if Self::DEDUPLICATED {
            async move { storage::enqueue_deduplicated(pool, &job).await }.boxed()
        } else {
            async move {
                let id = storage::enqueue(pool, &job).await?;
                Ok::<_, QueueError>(Some(id))
            }
            .boxed()
        }
    }

    /// Enqueue several jobs in a single transaction.
    ///
    /// The returned ids are in input order. When the job type is deduplicated,
    /// later duplicates within the batch yield `None`.
    #[instrument(name = "workqueue.enqueue_batch", skip(jobs, pool), fields(job_type = Self::JOB_TYPE, count = jobs.len()))]
    fn enqueue_batch<'a>(
        jobs: &'a [Self],
        pool: &'a PgPool,
    ) -> BoxFuture<'a, Result<Vec<Option<i64>>, QueueError>> {
        async move {
            let jobs = jobs.iter().map(new_job).collect::<Result<Vec<_>, _>>()?;
            if jobs.is_empty() {
                return Ok(Vec::new());
            }

            let mut tx = pool.begin().await?;
            let mut ids = Vec::with_capacity(jobs.len());
            for job in &jobs {
                let id = if Self::DEDUPLICATED {
                    storage::insert_job_deduplicated(&mut tx, job).await?
                } else {
                    Some(storage::insert_job(&mut tx, job).await?)
                };
                ids.push(id);
            }
            tx.commit().await?;

            Ok::<_, QueueError>(ids)
        }
        .boxed()
    }
}

fn new_job<J: BackgroundJob>(job: &J) -> Result<NewJob, QueueError> {
    let payload = serde_json::to_value(job)?;
    let job = NewJob::new(J::QUEUE, payload)
        .job_type(J::JOB_TYPE)
        .priority(J::PRIORITY)
        .max_retries(J::MAX_RETRIES);
    job.validate().map_err(QueueError::Validation)?;
    Ok(job)
}
