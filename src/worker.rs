use crate::errors::QueueError;
use crate::job_registry::JobRegistry;
use crate::retry::RetryPolicy;
use crate::schema::Job;
use crate::storage::{self, FailOutcome};
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use anyhow::anyhow;
use futures_util::FutureExt;
use rand::Rng;
use sentry_core::{Hub, SentryFutureExt};
use serde_json::Value;
use sqlx::PgPool;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{MissedTickBehavior, sleep};
use tracing::{Instrument, debug, error, info_span, trace, warn};

pub(crate) struct Worker<Context> {
    pub(crate) connection_pool: PgPool,
    pub(crate) context: Context,
    pub(crate) job_registry: Arc<JobRegistry<Context>>,
    pub(crate) queue_name: String,
    pub(crate) worker_id: String,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) max_poll_interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) lease_duration: Duration,
    pub(crate) retry_policy: RetryPolicy,
}

impl<Context: Clone + Send + Sync + 'static> Worker<Context> {
    /// Add random jitter to a sleep duration.
    fn with_jitter(&self, duration: Duration) -> Duration {
        if self.jitter.is_zero() {
            return duration;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        duration + Duration::from_millis(random_jitter)
    }

    /// Run background jobs forever, or until the queue is empty if `shutdown_when_queue_empty` is set.
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn run(&self) {
        let mut idle_interval = self.poll_interval;
        loop {
            match self.run_next_job().await {
                Ok(Some(_)) => idle_interval = self.poll_interval,
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("No pending background worker jobs found. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    let sleep_duration = self.with_jitter(idle_interval);
                    trace!(
                        "No pending background worker jobs found. Polling again in {sleep_duration:?}…",
                    );
                    sleep(sleep_duration).await;
                    idle_interval = next_poll_interval(idle_interval, self.max_poll_interval);
                }
                Err(error) => {
                    error!("Failed to run job: {error}");
                    sleep(self.with_jitter(self.poll_interval)).await;
                }
            }
        }
    }

    /// Run the next job in the queue, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(job_id))` if a job was run
    /// - `Ok(None)` if no jobs were waiting
    /// - `Err(...)` if there was an error claiming or acknowledging the job
    #[allow(clippy::cognitive_complexity)]
    async fn run_next_job(&self) -> anyhow::Result<Option<i64>> {
        let pool = &self.connection_pool;

        trace!("Looking for next background worker job…");

        let Some(job) =
            storage::claim_next(pool, &self.queue_name, &self.worker_id, self.lease_duration)
                .await?
        else {
            return Ok(None);
        };

        let span = info_span!(
            "job",
            job.id = %job.id,
            job.type = %job.job_type,
            job.retry_count = job.retry_count
        );

        let job_id = job.id;
        debug!(parent: &span, "Running job…");

        let future = with_sentry_transaction(&job.job_type, || self.perform(&job));
        let result = self
            .with_heartbeat(job_id, future)
            .instrument(span.clone())
            .bind_hub(Hub::current())
            .await;

        self.acknowledge(job_id, result).instrument(span).await?;

        Ok(Some(job_id))
    }

    /// Record the outcome of a run with `complete` or `fail`.
    async fn acknowledge(&self, job_id: i64, result: anyhow::Result<Value>) -> anyhow::Result<()> {
        let pool = &self.connection_pool;
        match result {
            Ok(output) => {
                debug!("Completing successful job…");
                let output = Some(output).filter(|value| !value.is_null());
                let ack = storage::complete(pool, job_id, &self.worker_id, output.as_ref()).await;
                self.check_ack(ack)?;
            }
            Err(error) => {
                warn!("Failed to run job: {error}");
                let ack = storage::fail(
                    pool,
                    job_id,
                    &self.worker_id,
                    &format!("{error:#}"),
                    &self.retry_policy,
                )
                .await;
                match self.check_ack(ack)? {
                    Some(FailOutcome::Retrying {
                        retry_count,
                        scheduled_at,
                    }) => debug!(retry_count, %scheduled_at, "Job rescheduled"),
                    Some(FailOutcome::Exhausted) => warn!("Job retries exhausted, giving up"),
                    None => {}
                }
            }
        }
        Ok(())
    }

    /// Look up the job's handler and run it, turning panics into errors.
    async fn perform(&self, job: &Job) -> anyhow::Result<Value> {
        let run_task_fn = self
            .job_registry
            .get(&job.job_type)
            .ok_or_else(|| anyhow!("Unknown job type {}", job.job_type))?;

        AssertUnwindSafe(run_task_fn(self.context.clone(), job.payload.clone()))
            .catch_unwind()
            .await
            .map_err(|e| try_to_extract_panic_info(&*e))
            .and_then(std::convert::identity)
    }

    /// Drive `future` to completion while renewing the job's lease every half lease.
    async fn with_heartbeat<F: Future>(&self, job_id: i64, future: F) -> F::Output {
        let period = (self.lease_duration / 2).max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the lease was just acquired.
        ticker.tick().await;

        let mut future = std::pin::pin!(future);
        loop {
            tokio::select! {
                output = &mut future => return output,
                _ = ticker.tick() => {
                    let renewed = storage::extend_lease(
                        &self.connection_pool,
                        job_id,
                        &self.worker_id,
                        self.lease_duration,
                    )
                    .await;
                    match renewed {
                        Ok(locked_until) => trace!(%locked_until, "Extended job lease"),
                        Err(error) => warn!(%error, "Failed to extend job lease"),
                    }
                }
            }
        }
    }

    /// Lost leases are expected under contention: the work is discarded and
    /// the worker moves on. Other errors are returned.
    fn check_ack<T>(&self, ack: Result<T, QueueError>) -> anyhow::Result<Option<T>> {
        match ack {
            Ok(value) => Ok(Some(value)),
            Err(error) if error.is_lost_lease() => {
                warn!(%error, "Lost the job lease, discarding result");
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }
}

/// Doubles the idle polling interval, capped at `max`.
fn next_poll_interval(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}
