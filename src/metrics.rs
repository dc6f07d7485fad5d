//! Append-only execution log and its read-side aggregation.

use crate::schema::{JobMetric, JobStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::time::Duration;

/// Appends one metric row for an execution attempt that finished at
/// `recorded_at`.
///
/// Workers pass the same instant they store on the job, so a window that
/// contains a job's `completed_at` also contains its metric.
pub(crate) async fn record_metric(
    pool: &SqlitePool,
    queue: &str,
    job_type: &str,
    status: JobStatus,
    duration: Duration,
    recorded_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    let duration_ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
    sqlx::query(
        r"
        INSERT INTO job_metrics (queue, job_type, status, duration_ms, recorded_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ",
    )
    .bind(queue)
    .bind(job_type)
    .bind(status.as_str())
    .bind(duration_ms)
    .bind(recorded_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Filter for [`job_stats`] and [`recent_metrics`].
///
/// The window is inclusive on both ends.
#[derive(Debug, Clone)]
pub struct MetricsQuery {
    /// Start of the window.
    pub since: DateTime<Utc>,
    /// End of the window.
    pub until: DateTime<Utc>,
    /// Only count attempts on this queue.
    pub queue: Option<String>,
    /// Only count attempts of this job type.
    pub job_type: Option<String>,
}

impl MetricsQuery {
    /// All queues and job types between `since` and `until`.
    pub fn between(since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            since,
            until,
            queue: None,
            job_type: None,
        }
    }

    /// The window ending now and reaching `window` into the past.
    pub fn last(window: Duration) -> Self {
        let until = Utc::now();
        let since = chrono::TimeDelta::from_std(window)
            .ok()
            .and_then(|window| until.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        Self::between(since, until)
    }

    /// Restrict to one queue.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Restrict to one job type.
    pub fn job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    fn window_secs(&self) -> f64 {
        let millis = (self.until - self.since).num_milliseconds();
        millis as f64 / 1000.0
    }
}

/// Aggregate execution statistics over a [`MetricsQuery`] window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStats {
    /// Execution attempts in the window.
    pub total: i64,
    /// Attempts whose handler returned an error.
    pub failed: i64,
    /// `failed / total` as a percentage, `0.0` for an empty window.
    pub error_rate: f64,
    /// Mean handler duration in milliseconds.
    pub avg_duration_ms: f64,
    /// Attempts per second over the window.
    pub throughput: f64,
}

impl JobStats {
    fn from_counts(total: i64, failed: i64, avg_duration_ms: Option<f64>, window_secs: f64) -> Self {
        let error_rate = if total > 0 {
            failed as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        let throughput = if window_secs > 0.0 {
            total as f64 / window_secs
        } else {
            0.0
        };

        Self {
            total,
            failed,
            error_rate,
            avg_duration_ms: avg_duration_ms.unwrap_or(0.0),
            throughput,
        }
    }
}

/// Aggregates the metric rows matching `query`.
///
/// Read-only; never touches job rows.
pub async fn job_stats(pool: &SqlitePool, query: &MetricsQuery) -> Result<JobStats, sqlx::Error> {
    let (total, failed, avg_duration_ms) = sqlx::query_as::<_, (i64, i64, Option<f64>)>(
        r"
        SELECT
            COUNT(*),
            COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
            AVG(duration_ms)
        FROM job_metrics
        WHERE recorded_at >= ?1 AND recorded_at <= ?2
          AND (?3 IS NULL OR queue = ?3)
          AND (?4 IS NULL OR job_type = ?4)
        ",
    )
    .bind(query.since)
    .bind(query.until)
    .bind(query.queue.as_deref())
    .bind(query.job_type.as_deref())
    .fetch_one(pool)
    .await?;

    Ok(JobStats::from_counts(
        total,
        failed,
        avg_duration_ms,
        query.window_secs(),
    ))
}

/// The raw metric rows matching `query`, newest first.
pub async fn recent_metrics(
    pool: &SqlitePool,
    query: &MetricsQuery,
    limit: i64,
) -> Result<Vec<JobMetric>, sqlx::Error> {
    sqlx::query_as::<_, JobMetric>(
        r"
        SELECT id, queue, job_type, status, duration_ms, recorded_at
        FROM job_metrics
        WHERE recorded_at >= ?1 AND recorded_at <= ?2
          AND (?3 IS NULL OR queue = ?3)
          AND (?4 IS NULL OR job_type = ?4)
        ORDER BY recorded_at DESC, id DESC
        LIMIT ?5
        ",
    )
    .bind(query.since)
    .bind(query.until)
    .bind(query.queue.as_deref())
    .bind(query.job_type.as_deref())
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Number of `pending` jobs per queue, regardless of `run_at`.
pub async fn queue_depths(pool: &SqlitePool) -> Result<Vec<(String, i64)>, sqlx::Error> {
    sqlx::query_as::<_, (String, i64)>(
        r"
        SELECT queue, COUNT(*) FROM background_jobs
        WHERE status = 'pending'
        GROUP BY queue
        ORDER BY queue
        ",
    )
    .fetch_all(pool)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_has_zero_rates() {
        let stats = JobStats::from_counts(0, 0, None, 60.0);
        assert_eq!(stats, JobStats::default());
    }

    #[test]
    fn rates_are_derived_from_counts() {
        let stats = JobStats::from_counts(20, 5, Some(12.5), 10.0);
        assert_eq!(stats.error_rate, 25.0);
        assert_eq!(stats.throughput, 2.0);
        assert_eq!(stats.avg_duration_ms, 12.5);
    }

    #[test]
    fn zero_length_window_has_no_throughput() {
        let stats = JobStats::from_counts(3, 0, Some(1.0), 0.0);
        assert_eq!(stats.throughput, 0.0);
        assert_eq!(stats.total, 3);
    }
}
