use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

/// Longest delay a retry can be pushed out by. Keeps `run_at` within the
/// range where stored timestamps still sort chronologically.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// What happens to a job whose handler just returned an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `pending`, eligible again at `run_at`.
    Retry {
        /// The job's `retry_count` after the transition.
        retry_count: i32,
        /// When the next attempt becomes eligible.
        run_at: DateTime<Utc>,
    },
    /// The retry budget is spent; the job becomes `failed`.
    Fail,
}

impl RetryDecision {
    /// Decide the next state of a job that has been retried `retry_count`
    /// times out of `max_retries`, given the caller-computed `delay`.
    pub fn for_attempt(
        retry_count: i32,
        max_retries: i32,
        now: DateTime<Utc>,
        delay: Duration,
    ) -> Self {
        if retry_count >= max_retries {
            return Self::Fail;
        }

        let delay = TimeDelta::from_std(delay.min(MAX_RETRY_DELAY)).unwrap_or(TimeDelta::zero());
        let run_at = now.checked_add_signed(delay).unwrap_or(now);

        Self::Retry {
            retry_count: retry_count + 1,
            run_at,
        }
    }
}
