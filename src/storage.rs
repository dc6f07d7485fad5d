use crate::schema::{Job, JobStatus};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::str::FromStr;
use std::time::Duration;

const JOB_COLUMNS: &str = "id, queue, job_type, payload, status, priority, max_retries, \
     retry_count, run_at, started_at, completed_at, error, idempotency_key, version, \
     created_at, updated_at";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a connection pool for the given SQLite URL.
///
/// The database file is created if it is missing. In-memory databases only
/// live as long as their connection, so they are pinned to a single
/// connection that is never recycled.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(max_connections.max(1))
    };

    pool_options.connect_with(options).await
}

/// Look up a single job by id.
pub async fn get_job(pool: &SqlitePool, job_id: i64) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        "SELECT {JOB_COLUMNS} FROM background_jobs WHERE id = ?1"
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn find_job_id_by_idempotency_key(
    pool: &SqlitePool,
    idempotency_key: &str,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT id FROM background_jobs WHERE idempotency_key = ?1")
        .bind(idempotency_key)
        .fetch_optional(pool)
        .await
}

/// Finds up to `limit` jobs in `queue` that are eligible to run at `now`.
///
/// Only job types in `job_types` are considered, so a worker never claims
/// work it has no handler for. Jobs come back highest priority first, then
/// earliest `run_at`.
pub async fn find_pending_jobs(
    pool: &SqlitePool,
    queue: &str,
    job_types: &[String],
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Job>, sqlx::Error> {
    if job_types.is_empty() {
        return Ok(Vec::new());
    }

    let mut query = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {JOB_COLUMNS} FROM background_jobs WHERE status = 'pending' AND queue = "
    ));
    query.push_bind(queue);
    query.push(" AND run_at <= ");
    query.push_bind(now);
    query.push(" AND job_type IN (");
    let mut types = query.separated(", ");
    for job_type in job_types {
        types.push_bind(job_type.as_str());
    }
    types.push_unseparated(") ORDER BY priority DESC, run_at ASC, id ASC LIMIT ");
    query.push_bind(limit);

    query.build_query_as::<Job>().fetch_all(pool).await
}

/// Attempts to move a pending job to `running`.
///
/// The update only applies if the row still carries `expected_version`, so
/// of any number of concurrent claimants exactly one sees `true`.
pub async fn claim_job(
    pool: &SqlitePool,
    job_id: i64,
    expected_version: i64,
) -> Result<bool, sqlx::Error> {
    let now = Utc::now();
    let result = sqlx::query(
        r"
        UPDATE background_jobs
        SET status = 'running', started_at = ?1, updated_at = ?1, version = version + 1
        WHERE id = ?2 AND version = ?3 AND status = 'pending'
        ",
    )
    .bind(now)
    .bind(job_id)
    .bind(expected_version)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Marks a running job as completed.
///
/// `version` is the version the worker observed after its claim. Returns
/// `false` if the row moved on in the meantime, e.g. through [`reset_job`].
pub async fn complete_job(
    pool: &SqlitePool,
    job_id: i64,
    version: i64,
) -> Result<bool, sqlx::Error> {
    complete_job_at(pool, job_id, version, Utc::now()).await
}

/// [`complete_job`] with `completed_at` set to `now`.
pub(crate) async fn complete_job_at(
    pool: &SqlitePool,
    job_id: i64,
    version: i64,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r"
        UPDATE background_jobs
        SET status = 'completed', completed_at = ?1, updated_at = ?1, error = NULL,
            version = version + 1
        WHERE id = ?2 AND version = ?3 AND status = 'running'
        ",
    )
    .bind(now)
    .bind(job_id)
    .bind(version)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Puts a running job back into `pending` for another attempt at `run_at`.
///
/// Refuses to push `retry_count` past `max_retries`; callers must use
/// [`fail_job`] once the budget is spent.
pub async fn retry_job(
    pool: &SqlitePool,
    job_id: i64,
    version: i64,
    run_at: DateTime<Utc>,
    error: &str,
) -> Result<bool, sqlx::Error> {
    retry_job_at(pool, job_id, version, run_at, error, Utc::now()).await
}

pub(crate) async fn retry_job_at(
    pool: &SqlitePool,
    job_id: i64,
    version: i64,
    run_at: DateTime<Utc>,
    error: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r"
        UPDATE background_jobs
        SET status = 'pending', retry_count = retry_count + 1, run_at = ?1, error = ?2,
            started_at = NULL, updated_at = ?3, version = version + 1
        WHERE id = ?4 AND version = ?5 AND status = 'running' AND retry_count < max_retries
        ",
    )
    .bind(run_at)
    .bind(error)
    .bind(now)
    .bind(job_id)
    .bind(version)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Moves a running job to the terminal `failed` state.
pub async fn fail_job(
    pool: &SqlitePool,
    job_id: i64,
    version: i64,
    error: &str,
) -> Result<bool, sqlx::Error> {
    fail_job_at(pool, job_id, version, error, Utc::now()).await
}

/// [`fail_job`] with `completed_at` set to `now`.
pub(crate) async fn fail_job_at(
    pool: &SqlitePool,
    job_id: i64,
    version: i64,
    error: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r"
        UPDATE background_jobs
        SET status = 'failed', error = ?1, completed_at = ?2, updated_at = ?2,
            version = version + 1
        WHERE id = ?3 AND version = ?4 AND status = 'running'
        ",
    )
    .bind(error)
    .bind(now)
    .bind(job_id)
    .bind(version)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Forces a job back to `pending`, regardless of its state or retry budget.
///
/// This is the administrative escape hatch for jobs stuck in `running`
/// after a worker died, and for re-running `failed` jobs. The retry budget
/// starts over. Returns `false` if the job does not exist or is already
/// pending.
pub async fn reset_job(pool: &SqlitePool, job_id: i64) -> Result<bool, sqlx::Error> {
    let now = Utc::now();
    let result = sqlx::query(
        r"
        UPDATE background_jobs
        SET status = 'pending', retry_count = 0, run_at = ?1, started_at = NULL,
            completed_at = NULL, error = NULL, updated_at = ?1, version = version + 1
        WHERE id = ?2 AND status != 'pending'
        ",
    )
    .bind(now)
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Jobs that have been `running` since before `started_before`.
///
/// Nothing reclaims these automatically; an operator decides whether to
/// [`reset_job`] them.
pub async fn stale_running_jobs(
    pool: &SqlitePool,
    started_before: DateTime<Utc>,
) -> Result<Vec<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        "SELECT {JOB_COLUMNS} FROM background_jobs \
         WHERE status = 'running' AND started_at < ?1 ORDER BY started_at ASC"
    ))
    .bind(started_before)
    .fetch_all(pool)
    .await
}

/// Jobs in the terminal `failed` state, most recent first.
pub async fn failed_jobs(
    pool: &SqlitePool,
    queue: Option<&str>,
    limit: i64,
) -> Result<Vec<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        "SELECT {JOB_COLUMNS} FROM background_jobs \
         WHERE status = 'failed' AND (?1 IS NULL OR queue = ?1) \
         ORDER BY completed_at DESC, id DESC LIMIT ?2"
    ))
    .bind(queue)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Number of jobs per status, optionally restricted to one queue.
pub async fn job_counts(
    pool: &SqlitePool,
    queue: Option<&str>,
) -> Result<Vec<(JobStatus, i64)>, sqlx::Error> {
    sqlx::query_as::<_, (JobStatus, i64)>(
        r"
        SELECT status, COUNT(*) FROM background_jobs
        WHERE (?1 IS NULL OR queue = ?1)
        GROUP BY status
        ORDER BY status
        ",
    )
    .bind(queue)
    .fetch_all(pool)
    .await
}

/// Deletes `completed` and `failed` jobs that finished before `finished_before`.
///
/// Returns the number of deleted rows. Deleting a keyed job frees its
/// idempotency key.
pub async fn delete_finished_jobs(
    pool: &SqlitePool,
    finished_before: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r"
        DELETE FROM background_jobs
        WHERE status IN ('completed', 'failed') AND completed_at < ?1
        ",
    )
    .bind(finished_before)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
