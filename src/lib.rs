#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod background_job;
mod config;
mod errors;
mod job_registry;
/// Execution metrics and their aggregation.
pub mod metrics;
mod retry;
mod runner;
/// Recurring definitions and bulk pre-generation.
pub mod scheduler;
/// Database schema definitions.
pub mod schema;
mod storage;
mod util;
mod worker;

/// The main trait for defining background jobs.
pub use self::background_job::{
    BackgroundJob, DEFAULT_MAX_RETRIES, DEFAULT_QUEUE, EnqueueOptions, NewJob,
};
/// Job system configuration.
pub use self::config::JobsConfig;
/// Error types for enqueueing and configuration.
pub use self::errors::{ConfigError, EnqueueError};
/// The retry policy applied to failed runs.
pub use self::retry::{MAX_RETRY_DELAY, RetryDecision};
/// The main runner that orchestrates job processing.
pub use self::runner::{Configured, Queue, RunHandle, Runner, Unconfigured};
/// Schema setup and the most commonly used row types.
pub use self::schema::{Job, JobStatus, setup_database};
/// Store operations: the claim protocol, state transitions and
/// administrative queries.
pub use self::storage::{
    claim_job, complete_job, connect, delete_finished_jobs, fail_job, failed_jobs,
    find_pending_jobs, get_job, job_counts, reset_job, retry_job, stale_running_jobs,
};
