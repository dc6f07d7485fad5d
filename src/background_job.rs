use crate::errors::EnqueueError;
use crate::storage;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::SqlitePool;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, instrument};

/// The default queue name used when no specific queue is specified.
pub const DEFAULT_QUEUE: &str = "default";

/// The default number of retries granted to a job.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Trait for defining background jobs that can be enqueued and executed asynchronously.
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the task.
    ///
    /// This MUST be unique for the whole application.
    const JOB_TYPE: &'static str;

    /// Default priority of the task.
    ///
    /// [`EnqueueOptions::priority`] can be used to override the priority value.
    const PRIORITY: i32 = 0;

    /// How many times a failed run is retried before the job is marked failed.
    const MAX_RETRIES: i32 = DEFAULT_MAX_RETRIES;

    /// Job queue where this job will be executed.
    const QUEUE: &'static str = DEFAULT_QUEUE;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + 'static;

    /// Execute the task. This method should define its logic.
    fn run(&self, ctx: Self::Context) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Delay before retry number `retry_count + 1` becomes eligible.
    ///
    /// Defaults to one minute, doubling with every retry.
    fn retry_delay(retry_count: u32) -> Duration {
        Duration::from_secs(60).saturating_mul(2u32.saturating_pow(retry_count))
    }

    /// Enqueue this job for background execution.
    ///
    /// Returns the job ID.
    fn enqueue<'a>(&'a self, pool: &'a SqlitePool) -> BoxFuture<'a, Result<i64, EnqueueError>> {
        self.enqueue_with(pool, EnqueueOptions::default())
    }

    /// Enqueue this job with per-call overrides.
    ///
    /// If `options` carries an idempotency key that is already taken, the
    /// existing job's ID is returned and nothing is inserted.
    #[instrument(name = "jobs.enqueue", skip(self, pool, options), fields(message = Self::JOB_TYPE))]
    fn enqueue_with<'a>(
        &'a self,
        pool: &'a SqlitePool,
        options: EnqueueOptions,
    ) -> BoxFuture<'a, Result<i64, EnqueueError>> {
        let payload = match serde_json::to_value(self) {
            Ok(payload) => payload,
            Err(err) => return async move { Err(EnqueueError::SerializationError(err)) }.boxed(),
        };

        let mut job = NewJob::new(
            options.queue.as_deref().unwrap_or(Self::QUEUE),
            Self::JOB_TYPE,
            payload,
        )
        .priority(options.priority.unwrap_or(Self::PRIORITY))
        .max_retries(options.max_retries.unwrap_or(Self::MAX_RETRIES));
        if let Some(run_at) = options.run_at {
            job = job.run_at(run_at);
        }
        if let Some(key) = options.idempotency_key {
            job = job.idempotency_key(key);
        }

        async move { job.enqueue(pool).await }.boxed()
    }
}

/// Per-call overrides for [`BackgroundJob::enqueue_with`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    queue: Option<String>,
    priority: Option<i32>,
    max_retries: Option<i32>,
    run_at: Option<DateTime<Utc>>,
    idempotency_key: Option<String>,
}

impl EnqueueOptions {
    /// Enqueue on a different queue than [`BackgroundJob::QUEUE`].
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Override [`BackgroundJob::PRIORITY`].
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Override [`BackgroundJob::MAX_RETRIES`].
    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Do not run the job before `run_at`.
    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    /// Deduplicate on `key`.
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// An untyped job ready to be inserted.
///
/// This is the raw enqueue entry point for callers that only have a job type
/// string and a JSON payload, such as the scheduler.
#[derive(Debug, Clone)]
pub struct NewJob {
    queue: String,
    job_type: String,
    payload: Value,
    priority: i32,
    max_retries: i32,
    run_at: Option<DateTime<Utc>>,
    idempotency_key: Option<String>,
}

impl NewJob {
    /// A job with default priority and retry budget that may run immediately.
    pub fn new(queue: impl Into<String>, job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            queue: queue.into(),
            job_type: job_type.into(),
            payload,
            priority: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            run_at: None,
            idempotency_key: None,
        }
    }

    /// Higher priorities are claimed first.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Negative values are treated as zero.
    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries.max(0);
        self
    }

    /// Earliest time the job may be claimed. Defaults to the time of enqueue.
    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    /// Deduplicate on `key`: enqueueing a second job with the same key
    /// returns the first job's ID.
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Insert the job as `pending` and return its ID.
    #[instrument(
        name = "jobs.enqueue_raw",
        skip(self, pool),
        fields(job.queue = %self.queue, job.type = %self.job_type)
    )]
    pub async fn enqueue(self, pool: &SqlitePool) -> Result<i64, EnqueueError> {
        let now = Utc::now();
        let run_at = self.run_at.unwrap_or(now);

        let inserted = sqlx::query_scalar::<_, i64>(
            r"
            INSERT INTO background_jobs
                (queue, job_type, payload, status, priority, max_retries, retry_count,
                 run_at, idempotency_key, version, created_at, updated_at)
            VALUES (?1, ?2, ?3, 'pending', ?4, ?5, 0, ?6, ?7, 0, ?8, ?8)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING id
            ",
        )
        .bind(&self.queue)
        .bind(&self.job_type)
        .bind(&self.payload)
        .bind(self.priority)
        .bind(self.max_retries)
        .bind(run_at)
        .bind(self.idempotency_key.as_deref())
        .bind(now)
        .fetch_optional(pool)
        .await?;

        if let Some(id) = inserted {
            debug!(job.id = id, "Enqueued job");
            return Ok(id);
        }

        // Only a conflicting idempotency key suppresses the insert.
        let key = self.idempotency_key.as_deref().unwrap_or_default();
        let existing = storage::find_job_id_by_idempotency_key(pool, key)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;
        debug!(job.id = existing, idempotency_key = key, "Job already enqueued");
        Ok(existing)
    }
}
