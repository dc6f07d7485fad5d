//! Recurring job definitions and bulk pre-generation of future jobs.
//!
//! Two mechanisms feed the queue ahead of time:
//!
//! - [`ScheduledJob`] rows are materialized into jobs by a ticker that the
//!   [`Runner`](crate::Runner) starts next to its workers.
//! - [`pregenerate`] lets a caller enqueue a bounded horizon of dated jobs up
//!   front. Every occurrence carries a deterministic idempotency key, so
//!   submitting the same plan again is a no-op.

use crate::background_job::NewJob;
use crate::errors::EnqueueError;
use crate::schema::ScheduledJob;
use chrono::{DateTime, Months, SecondsFormat, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Upper bound on the number of occurrences a single [`PregenerationPlan`]
/// produces.
pub const MAX_PREGENERATED_OCCURRENCES: u32 = 366;

/// How a [`ScheduledJob`] advances its `next_run_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recurrence {
    /// A fixed number of seconds; values below one second count as one.
    Interval {
        /// Seconds between runs.
        seconds: u64,
    },
    /// Same time every day.
    Daily,
    /// Same weekday and time every week.
    Weekly,
    /// Same day of month and time every month, clamped to the month's end.
    Monthly,
}

impl Recurrence {
    /// The occurrence following `after`.
    pub fn next_after(self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval { seconds } => {
                let seconds = i64::try_from(seconds.max(1)).ok()?;
                after.checked_add_signed(TimeDelta::try_seconds(seconds)?)
            }
            Self::Daily => after.checked_add_signed(TimeDelta::days(1)),
            Self::Weekly => after.checked_add_signed(TimeDelta::weeks(1)),
            Self::Monthly => after.checked_add_months(Months::new(1)),
        }
    }

    /// The first occurrence strictly after `now`, stepping from `from`.
    fn next_after_now(self, from: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Self::Interval { seconds } = self {
            // Skip whole missed intervals in one step.
            let step = i64::try_from(seconds.max(1)).ok()?;
            let behind = (now - from).num_seconds().max(0);
            let skipped = behind / step + 1;
            return from.checked_add_signed(TimeDelta::try_seconds(skipped.checked_mul(step)?)?);
        }

        let mut next = self.next_after(from)?;
        while next <= now {
            next = self.next_after(next)?;
        }
        Some(next)
    }
}

/// Operator-supplied definition of a recurring job.
#[derive(Debug, Clone)]
pub struct ScheduledJobDefinition {
    /// Unique name; registering the same name again replaces the definition.
    pub name: String,
    /// Target queue.
    pub queue: String,
    /// Job type of the materialized jobs.
    pub job_type: String,
    /// Payload copied into every materialized job.
    pub payload: Value,
    /// Priority of the materialized jobs.
    pub priority: i32,
    /// Retry budget of the materialized jobs.
    pub max_retries: i32,
    /// Cadence.
    pub recurrence: Recurrence,
    /// First time a job is due.
    pub first_run_at: DateTime<Utc>,
}

impl ScheduledJobDefinition {
    /// A definition with default priority and retry budget.
    pub fn new(
        name: impl Into<String>,
        queue: impl Into<String>,
        job_type: impl Into<String>,
        payload: Value,
        recurrence: Recurrence,
        first_run_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            queue: queue.into(),
            job_type: job_type.into(),
            payload,
            priority: 0,
            max_retries: crate::background_job::DEFAULT_MAX_RETRIES,
            recurrence,
            first_run_at,
        }
    }
}

const SCHEDULED_JOB_COLUMNS: &str = "name, queue, job_type, payload, priority, max_retries, \
     recurrence, enabled, next_run_at, created_at, updated_at";

/// Creates or replaces a recurring definition. The definition is enabled.
pub async fn register_scheduled_job(
    pool: &SqlitePool,
    definition: &ScheduledJobDefinition,
) -> Result<(), sqlx::Error> {
    let now = Utc::now();
    sqlx::query(
        r"
        INSERT INTO scheduled_jobs
            (name, queue, job_type, payload, priority, max_retries, recurrence, enabled,
             next_run_at, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9, ?9)
        ON CONFLICT (name) DO UPDATE SET
            queue = excluded.queue,
            job_type = excluded.job_type,
            payload = excluded.payload,
            priority = excluded.priority,
            max_retries = excluded.max_retries,
            recurrence = excluded.recurrence,
            enabled = 1,
            next_run_at = excluded.next_run_at,
            updated_at = excluded.updated_at
        ",
    )
    .bind(&definition.name)
    .bind(&definition.queue)
    .bind(&definition.job_type)
    .bind(&definition.payload)
    .bind(definition.priority)
    .bind(definition.max_retries.max(0))
    .bind(sqlx::types::Json(definition.recurrence))
    .bind(definition.first_run_at)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Enables or disables a definition. Returns `false` if it does not exist.
pub async fn set_scheduled_job_enabled(
    pool: &SqlitePool,
    name: &str,
    enabled: bool,
) -> Result<bool, sqlx::Error> {
    let result =
        sqlx::query("UPDATE scheduled_jobs SET enabled = ?1, updated_at = ?2 WHERE name = ?3")
            .bind(enabled)
            .bind(Utc::now())
            .bind(name)
            .execute(pool)
            .await?;
    Ok(result.rows_affected() == 1)
}

/// All definitions, ordered by name.
pub async fn list_scheduled_jobs(pool: &SqlitePool) -> Result<Vec<ScheduledJob>, sqlx::Error> {
    sqlx::query_as::<_, ScheduledJob>(&format!(
        "SELECT {SCHEDULED_JOB_COLUMNS} FROM scheduled_jobs ORDER BY name"
    ))
    .fetch_all(pool)
    .await
}

/// Materializes one job for every enabled definition that is due at `now`.
///
/// Each job is keyed by the definition name and the occurrence it stands
/// for, so a crash between enqueue and advancing `next_run_at`, or two
/// tickers racing, never produce a second job. `next_run_at` moves with a
/// compare-and-swap on its previous value. Returns the IDs of the jobs.
pub async fn materialize_due_jobs(
    pool: &SqlitePool,
    now: DateTime<Utc>,
) -> Result<Vec<i64>, EnqueueError> {
    let due = sqlx::query_as::<_, ScheduledJob>(&format!(
        "SELECT {SCHEDULED_JOB_COLUMNS} FROM scheduled_jobs \
         WHERE enabled = 1 AND next_run_at <= ?1 ORDER BY next_run_at, name"
    ))
    .bind(now)
    .fetch_all(pool)
    .await?;

    let mut job_ids = Vec::with_capacity(due.len());
    for scheduled in due {
        let occurrence = scheduled.next_run_at;
        let key = format!(
            "schedule:{}:{}",
            scheduled.name,
            occurrence.to_rfc3339_opts(SecondsFormat::Secs, true)
        );

        let job_id = NewJob::new(&scheduled.queue, &scheduled.job_type, scheduled.payload)
            .priority(scheduled.priority)
            .max_retries(scheduled.max_retries)
            .idempotency_key(key)
            .enqueue(pool)
            .await?;

        let Some(next_run_at) = scheduled.recurrence.next_after_now(occurrence, now) else {
            warn!(schedule.name = %scheduled.name, "Recurrence overflowed; disabling schedule");
            set_scheduled_job_enabled(pool, &scheduled.name, false).await?;
            job_ids.push(job_id);
            continue;
        };

        let advanced = sqlx::query(
            r"
            UPDATE scheduled_jobs SET next_run_at = ?1, updated_at = ?2
            WHERE name = ?3 AND next_run_at = ?4
            ",
        )
        .bind(next_run_at)
        .bind(now)
        .bind(&scheduled.name)
        .bind(occurrence)
        .execute(pool)
        .await?;

        if advanced.rows_affected() == 1 {
            debug!(schedule.name = %scheduled.name, job.id = job_id, %next_run_at, "Materialized scheduled job");
        } else {
            debug!(schedule.name = %scheduled.name, "Schedule advanced concurrently");
        }
        job_ids.push(job_id);
    }

    Ok(job_ids)
}

/// Ticker that materializes due [`ScheduledJob`]s until cancelled.
pub(crate) struct Scheduler {
    pub(crate) connection_pool: SqlitePool,
    pub(crate) interval: Duration,
    pub(crate) shutdown: CancellationToken,
}

impl Scheduler {
    pub(crate) fn start(self) -> JoinHandle<()> {
        let span = info_span!("scheduler");
        tokio::spawn(
            async move {
                info!(interval = ?self.interval, "Starting scheduler…");
                let mut ticker = tokio::time::interval(self.interval);
                loop {
                    tokio::select! {
                        () = self.shutdown.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    match materialize_due_jobs(&self.connection_pool, Utc::now()).await {
                        Ok(job_ids) if !job_ids.is_empty() => {
                            info!(count = job_ids.len(), "Materialized scheduled jobs");
                        }
                        Ok(_) => {}
                        Err(error) => error!("Failed to materialize scheduled jobs: {error}"),
                    }
                }
                debug!("Scheduler stopped");
            }
            .instrument(span),
        )
    }
}

/// Period granularity of a [`PregenerationPlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// One job per day.
    Daily,
    /// One job per calendar month.
    Monthly,
}

/// A bounded series of future jobs derived from one logical schedule.
#[derive(Debug, Clone)]
pub struct PregenerationPlan {
    key: String,
    start: DateTime<Utc>,
    cadence: Cadence,
    count: u32,
}

/// One dated slot of a [`PregenerationPlan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occurrence {
    /// When the job becomes eligible.
    pub run_at: DateTime<Utc>,
    /// `YYYY-MM-DD` for daily plans, `YYYY-MM` for monthly plans.
    pub period: String,
    /// Deterministic idempotency key for this slot.
    pub idempotency_key: String,
}

impl PregenerationPlan {
    /// One occurrence per day for `days` days, starting at `start`.
    pub fn daily(key: impl Into<String>, start: DateTime<Utc>, days: u32) -> Self {
        Self::new(key.into(), start, Cadence::Daily, days)
    }

    /// One occurrence per month for `months` months, starting at `start`.
    pub fn monthly(key: impl Into<String>, start: DateTime<Utc>, months: u32) -> Self {
        Self::new(key.into(), start, Cadence::Monthly, months)
    }

    fn new(key: String, start: DateTime<Utc>, cadence: Cadence, count: u32) -> Self {
        if count > MAX_PREGENERATED_OCCURRENCES {
            warn!(
                plan.key = %key,
                requested = count,
                max = MAX_PREGENERATED_OCCURRENCES,
                "Clamping pre-generation horizon"
            );
        }
        Self {
            key,
            start,
            cadence,
            count: count.min(MAX_PREGENERATED_OCCURRENCES),
        }
    }

    /// The slots of this plan in chronological order.
    pub fn occurrences(&self) -> Vec<Occurrence> {
        (0..self.count)
            .map_while(|offset| {
                let run_at = match self.cadence {
                    Cadence::Daily => self
                        .start
                        .checked_add_signed(TimeDelta::days(i64::from(offset)))?,
                    Cadence::Monthly => self.start.checked_add_months(Months::new(offset))?,
                };
                let period = match self.cadence {
                    Cadence::Daily => run_at.format("%Y-%m-%d").to_string(),
                    Cadence::Monthly => run_at.format("%Y-%m").to_string(),
                };
                Some(Occurrence {
                    idempotency_key: format!("{}:{period}", self.key),
                    run_at,
                    period,
                })
            })
            .collect()
    }
}

/// Enqueues every occurrence of `plan`.
///
/// `build` turns each occurrence into a job; its `run_at` and idempotency
/// key are then overwritten from the occurrence. Returns one job ID per
/// occurrence, existing IDs included.
pub async fn pregenerate<F>(
    pool: &SqlitePool,
    plan: &PregenerationPlan,
    mut build: F,
) -> Result<Vec<i64>, EnqueueError>
where
    F: FnMut(&Occurrence) -> NewJob,
{
    let occurrences = plan.occurrences();
    let mut job_ids = Vec::with_capacity(occurrences.len());
    for occurrence in &occurrences {
        let job_id = build(occurrence)
            .run_at(occurrence.run_at)
            .idempotency_key(occurrence.idempotency_key.clone())
            .enqueue(pool)
            .await?;
        job_ids.push(job_id);
    }

    info!(plan.key = %plan.key, count = job_ids.len(), "Pre-generated jobs");
    Ok(job_ids)
}
