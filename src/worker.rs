use crate::job_registry::JobRegistry;
use crate::metrics;
use crate::retry::RetryDecision;
use crate::schema::{Job, JobStatus};
use crate::storage;
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use rand::Rng;
use sqlx::SqlitePool;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, trace, warn};

/// Result of one poll-claim-execute iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    /// A job was claimed and executed.
    Ran(i64),
    /// Eligible jobs existed but other workers claimed all of them first.
    Contended,
    /// Nothing was eligible.
    Empty,
}

pub(crate) struct Worker<Context> {
    pub(crate) connection_pool: SqlitePool,
    pub(crate) context: Context,
    pub(crate) queue_name: String,
    pub(crate) job_registry: Arc<JobRegistry<Context>>,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) batch_size: i64,
    pub(crate) shutdown: CancellationToken,
}

impl<Context: Clone + Send + Sync + 'static> Worker<Context> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Sleeps for one poll interval. Returns `false` if shutdown was
    /// requested in the meantime.
    async fn idle(&self) -> bool {
        let sleep_duration = self.sleep_duration_with_jitter();
        trace!("Polling again in {sleep_duration:?}…");
        tokio::select! {
            () = sleep(sleep_duration) => true,
            () = self.shutdown.cancelled() => false,
        }
    }

    /// Run background jobs until shutdown is requested, or until the queue
    /// is empty if `shutdown_when_queue_empty` is set.
    ///
    /// A job that is already executing is always allowed to finish.
    pub(crate) async fn run(&self) {
        loop {
            if self.shutdown.is_cancelled() {
                debug!("Shutdown requested. Stopping the worker…");
                break;
            }

            match self.run_next_job().await {
                Ok(PollOutcome::Ran(job_id)) => trace!(job.id = job_id, "Finished job"),
                Ok(PollOutcome::Contended) => {}
                Ok(PollOutcome::Empty) if self.shutdown_when_queue_empty => {
                    debug!("No pending background worker jobs found. Shutting down the worker…");
                    break;
                }
                Ok(PollOutcome::Empty) => {
                    if !self.idle().await {
                        debug!("Shutdown requested. Stopping the worker…");
                        break;
                    }
                }
                Err(error) => {
                    error!("Failed to run job: {error}");
                    if !self.idle().await {
                        break;
                    }
                }
            }
        }
    }

    /// Poll the queue, claim the best eligible job and run it.
    ///
    /// Candidates are tried in poll order; losing a claim to another worker
    /// just moves on to the next candidate.
    pub(crate) async fn run_next_job(&self) -> anyhow::Result<PollOutcome> {
        let pool = &self.connection_pool;
        let job_types = self.job_registry.job_types();

        trace!("Looking for next background worker job…");
        let candidates = storage::find_pending_jobs(
            pool,
            &self.queue_name,
            &job_types,
            Utc::now(),
            self.batch_size,
        )
        .await?;

        if candidates.is_empty() {
            return Ok(PollOutcome::Empty);
        }

        for job in candidates {
            if storage::claim_job(pool, job.id, job.version).await? {
                let job_id = job.id;
                self.execute(job).await?;
                return Ok(PollOutcome::Ran(job_id));
            }
            trace!(job.id = job.id, "Lost claim to another worker");
        }

        Ok(PollOutcome::Contended)
    }

    /// Run the handler of a freshly claimed job and record the outcome.
    async fn execute(&self, job: Job) -> anyhow::Result<()> {
        let span = info_span!("job", job.id = %job.id, job.type = %job.job_type, job.queue = %job.queue);
        let context = self.context.clone();
        let job_registry = self.job_registry.clone();
        // The claim bumped the version by one.
        let version = job.version + 1;

        debug!(parent: &span, "Running job…");
        let started = Instant::now();
        let payload = job.payload.clone();
        let result = with_sentry_transaction(&job.job_type, || async {
            let run_task_fn = job_registry
                .get(&job.job_type)
                .ok_or_else(|| anyhow!("Unknown job type {}", job.job_type))?;

            AssertUnwindSafe(run_task_fn(context, payload))
                .catch_unwind()
                .await
                .map_err(|e| try_to_extract_panic_info(&*e))
                .and_then(std::convert::identity)
        })
        .instrument(span.clone())
        .await;
        let duration = started.elapsed();

        self.finish(job, version, result, duration)
            .instrument(span)
            .await
    }

    /// Persist the outcome of a run and append its metric.
    ///
    /// The job row and the metric share one timestamp. The metric is
    /// recorded even when the state transition fails.
    async fn finish(
        &self,
        job: Job,
        version: i64,
        result: anyhow::Result<()>,
        duration: Duration,
    ) -> anyhow::Result<()> {
        let pool = &self.connection_pool;
        let finished_at = Utc::now();
        let (transition, status) = match result {
            Ok(()) => {
                debug!("Marking job completed…");
                let transition =
                    storage::complete_job_at(pool, job.id, version, finished_at).await;
                (transition, JobStatus::Completed)
            }
            Err(error) => {
                warn!("Failed to run job: {error:#}");
                let transition = self
                    .handle_failure(&job, version, &error, finished_at)
                    .await;
                (transition, JobStatus::Failed)
            }
        };

        let recorded = metrics::record_metric(
            pool,
            &job.queue,
            &job.job_type,
            status,
            duration,
            finished_at,
        )
        .await;

        if !transition? {
            warn!("Job changed while running; outcome was not recorded on the job");
        }
        recorded?;
        Ok(())
    }

    /// Apply the retry policy to a job whose handler returned `error`.
    async fn handle_failure(
        &self,
        job: &Job,
        version: i64,
        error: &anyhow::Error,
        now: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let pool = &self.connection_pool;
        let message = format!("{error:#}");
        let retry_count = u32::try_from(job.retry_count).unwrap_or_default();
        let delay = self
            .job_registry
            .retry_delay(&job.job_type, retry_count)
            .unwrap_or(self.poll_interval);

        match RetryDecision::for_attempt(job.retry_count, job.max_retries, now, delay) {
            RetryDecision::Retry {
                retry_count,
                run_at,
            } => {
                debug!(retry_count, %run_at, "Scheduling retry…");
                storage::retry_job_at(pool, job.id, version, run_at, &message, now).await
            }
            RetryDecision::Fail => {
                warn!(
                    retries = job.retry_count,
                    "Job exhausted its retries; marking failed"
                );
                storage::fail_job_at(pool, job.id, version, &message, now).await
            }
        }
    }
}
