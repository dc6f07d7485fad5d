//! Database schema definitions for SQLx.
//!
//! This module contains the row types of the job store and the DDL that
//! creates them. Every mutation of these rows happens through the guarded
//! statements in the storage layer.

use crate::scheduler::Recurrence;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool};

/// Lifecycle state of a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for `run_at` to pass and a worker to claim it.
    Pending,
    /// Claimed by a worker.
    Running,
    /// The handler returned successfully.
    Completed,
    /// The handler failed and no retries are left.
    Failed,
}

impl JobStatus {
    /// The status as stored in the `status` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal jobs are never picked up again without an explicit reset.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents a background job record in the database
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Unique identifier for the job
    pub id: i64,
    /// Queue the job is polled from
    pub queue: String,
    /// Type identifier for the job (used for dispatch)
    pub job_type: String,
    /// JSON data containing the job payload
    pub payload: Value,
    /// Current lifecycle state
    pub status: JobStatus,
    /// Priority of the job (higher = more important)
    pub priority: i32,
    /// How many times a failed run may be retried
    pub max_retries: i32,
    /// Number of retries scheduled so far
    pub retry_count: i32,
    /// Earliest time the job may be claimed
    pub run_at: DateTime<Utc>,
    /// When the current (or last) run was claimed
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
    /// Message of the last handler error
    pub error: Option<String>,
    /// Caller-supplied deduplication token
    pub idempotency_key: Option<String>,
    /// Optimistic concurrency counter, bumped on every transition
    pub version: i64,
    /// Timestamp when the job was created
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last transition
    pub updated_at: DateTime<Utc>,
}

/// A recurring definition that materializes into [`Job`] rows.
#[derive(Debug, Clone, FromRow)]
pub struct ScheduledJob {
    /// Unique name of the definition
    pub name: String,
    /// Queue the materialized jobs are enqueued on
    pub queue: String,
    /// Job type of the materialized jobs
    pub job_type: String,
    /// Payload copied into every materialized job
    pub payload: Value,
    /// Priority of the materialized jobs
    pub priority: i32,
    /// Retry budget of the materialized jobs
    pub max_retries: i32,
    /// How `next_run_at` advances
    #[sqlx(json)]
    pub recurrence: Recurrence,
    /// Disabled definitions are skipped by the scheduler
    pub enabled: bool,
    /// When the next job is due
    pub next_run_at: DateTime<Utc>,
    /// Timestamp when the definition was created
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last change
    pub updated_at: DateTime<Utc>,
}

/// One execution attempt, as appended by a worker.
#[derive(Debug, Clone, FromRow)]
pub struct JobMetric {
    /// Row identifier
    pub id: i64,
    /// Queue the job ran on
    pub queue: String,
    /// Job type that ran
    pub job_type: String,
    /// `completed` or `failed`
    pub status: JobStatus,
    /// Wall-clock handler duration in milliseconds
    pub duration_ms: i64,
    /// When the attempt finished
    pub recorded_at: DateTime<Utc>,
}

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS background_jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        queue TEXT NOT NULL,
        job_type TEXT NOT NULL,
        payload TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'running', 'completed', 'failed')),
        priority INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3 CHECK (max_retries >= 0),
        retry_count INTEGER NOT NULL DEFAULT 0,
        run_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        error TEXT,
        idempotency_key TEXT,
        version INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        CHECK (retry_count >= 0 AND retry_count <= max_retries)
    )
    ",
    // SQLite treats NULLs as distinct, so unkeyed jobs never collide.
    r"
    CREATE UNIQUE INDEX IF NOT EXISTS background_jobs_idempotency_key
        ON background_jobs (idempotency_key)
    ",
    r"
    CREATE INDEX IF NOT EXISTS background_jobs_poll
        ON background_jobs (queue, status, priority DESC, run_at)
    ",
    r"
    CREATE TABLE IF NOT EXISTS scheduled_jobs (
        name TEXT PRIMARY KEY,
        queue TEXT NOT NULL,
        job_type TEXT NOT NULL,
        payload TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 3,
        recurrence TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        next_run_at TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS job_metrics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        queue TEXT NOT NULL,
        job_type TEXT NOT NULL,
        status TEXT NOT NULL,
        duration_ms INTEGER NOT NULL,
        recorded_at TEXT NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS job_metrics_recorded_at
        ON job_metrics (recorded_at, queue, job_type)
    ",
];

/// Create the job tables and indexes if they do not exist yet.
///
/// Safe to run on every startup.
pub async fn setup_database(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for statement in SCHEMA {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    tx.commit().await
}
