use crate::BackgroundJob;
use anyhow::Context as _;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub(crate) type RunTaskFn<Context> =
    dyn Fn(Context, Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

struct RegisteredJob<Context> {
    run: Arc<RunTaskFn<Context>>,
    retry_delay: fn(u32) -> Duration,
}

impl<Context> Clone for RegisteredJob<Context> {
    fn clone(&self) -> Self {
        Self {
            run: self.run.clone(),
            retry_delay: self.retry_delay,
        }
    }
}

/// Dispatch table from job type string to typed decode + handler.
pub(crate) struct JobRegistry<Context> {
    entries: HashMap<String, RegisteredJob<Context>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<Context> std::fmt::Debug for JobRegistry<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> JobRegistry<Context> {
    pub(crate) fn register<J: BackgroundJob<Context = Context>>(&mut self) {
        let run: Arc<RunTaskFn<Context>> = Arc::new(|ctx: Context, payload: Value| {
            async move {
                // A payload that no longer matches the job struct is a job
                // failure like any other.
                let job: J = serde_json::from_value(payload)
                    .with_context(|| format!("failed to decode payload for {}", J::JOB_TYPE))?;
                job.run(ctx).await
            }
            .boxed()
        });

        self.entries.insert(
            J::JOB_TYPE.to_string(),
            RegisteredJob {
                run,
                retry_delay: J::retry_delay,
            },
        );
    }

    pub(crate) fn get(&self, job_type: &str) -> Option<&Arc<RunTaskFn<Context>>> {
        self.entries.get(job_type).map(|entry| &entry.run)
    }

    pub(crate) fn retry_delay(&self, job_type: &str, retry_count: u32) -> Option<Duration> {
        self.entries
            .get(job_type)
            .map(|entry| (entry.retry_delay)(retry_count))
    }

    pub(crate) fn job_types(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}
