//! Configuration management.

use crate::errors::ConfigError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Job system configuration.
///
/// Every field has a default, so an empty document is valid:
///
/// ```toml
/// database_url = "sqlite://data/jobs.db"
/// default_concurrency = 2
///
/// [queues]
/// task_generation = 4
/// calendar_sync = 1
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct JobsConfig {
    /// SQLite connection URL of the job store.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Maximum number of pooled store connections shared by all workers.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Worker count for queues not listed in `queues`.
    #[serde(default = "default_concurrency")]
    pub default_concurrency: usize,

    /// Worker count per queue name.
    #[serde(default)]
    pub queues: HashMap<String, usize>,

    /// Delay between polls of an idle worker (milliseconds).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum random delay added to each poll (milliseconds).
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    /// How many eligible jobs a worker fetches per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// How often recurring definitions are checked (milliseconds).
    #[serde(default = "default_scheduler_interval_ms")]
    pub scheduler_interval_ms: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            max_connections: default_max_connections(),
            default_concurrency: default_concurrency(),
            queues: HashMap::new(),
            poll_interval_ms: default_poll_interval_ms(),
            jitter_ms: default_jitter_ms(),
            batch_size: default_batch_size(),
            scheduler_interval_ms: default_scheduler_interval_ms(),
        }
    }
}

impl JobsConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid {
                field: "max_connections",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.scheduler_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "scheduler_interval_ms",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Worker count for `queue`.
    pub fn concurrency_for(&self, queue: &str) -> usize {
        self.queues
            .get(queue)
            .copied()
            .unwrap_or(self.default_concurrency)
    }

    /// Delay between polls of an idle worker.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Maximum random delay added to each poll.
    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }

    /// How often recurring definitions are checked.
    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_interval_ms)
    }
}

fn default_database_url() -> String {
    "sqlite://jobs.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_concurrency() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_jitter_ms() -> u64 {
    100
}

fn default_batch_size() -> u32 {
    10
}

fn default_scheduler_interval_ms() -> u64 {
    60_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = JobsConfig::from_toml_str("").unwrap();
        assert_eq!(config, JobsConfig::default());
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn per_queue_concurrency_falls_back_to_default() {
        let config = JobsConfig::from_toml_str(
            r#"
            database_url = "sqlite::memory:"
            default_concurrency = 2

            [queues]
            task_generation = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.concurrency_for("task_generation"), 4);
        assert_eq!(config.concurrency_for("calendar_sync"), 2);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let error = JobsConfig::from_toml_str("batch_size = 0").unwrap_err();
        assert!(matches!(
            error,
            ConfigError::Invalid {
                field: "batch_size",
                ..
            }
        ));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let error = JobsConfig::from_toml_str("workers = 3").unwrap_err();
        assert!(matches!(error, ConfigError::Parse(_)));
    }
}
