use crate::BackgroundJob;
use crate::config::JobsConfig;
use crate::job_registry::JobRegistry;
use crate::scheduler::Scheduler;
use crate::worker::Worker;
use futures_util::future::join_all;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);
const DEFAULT_BATCH_SIZE: u32 = 10;
const DEFAULT_SCHEDULER_INTERVAL: Duration = Duration::from_secs(60);

/// Marker type for a configured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;
/// Marker type for an unconfigured runner
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

/// The core runner responsible for claiming and running jobs
pub struct Runner<Context: Clone + Send + Sync + 'static, State = Unconfigured> {
    connection_pool: SqlitePool,
    job_registry: JobRegistry<Context>,
    queues: HashMap<String, Queue>,
    context: Context,
    default_concurrency: usize,
    poll_interval: Duration,
    jitter: Duration,
    batch_size: u32,
    scheduler_interval: Option<Duration>,
    shutdown_when_queue_empty: bool,
    shutdown: CancellationToken,
    started: AtomicBool,
    _state: PhantomData<State>,
}

impl<Context: std::fmt::Debug + Clone + Sync + Send, State: std::fmt::Debug> std::fmt::Debug
    for Runner<Context, State>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("job_registry", &self.job_registry)
            .field("queues", &self.queues)
            .field("context", &self.context)
            .field("default_concurrency", &self.default_concurrency)
            .field("poll_interval", &self.poll_interval)
            .field("batch_size", &self.batch_size)
            .field("scheduler_interval", &self.scheduler_interval)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context> {
    /// Create a new runner with the given connection pool and context.
    pub fn new(connection_pool: SqlitePool, context: Context) -> Self {
        Self {
            connection_pool,
            job_registry: JobRegistry::default(),
            queues: HashMap::new(),
            context,
            default_concurrency: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            batch_size: DEFAULT_BATCH_SIZE,
            scheduler_interval: Some(DEFAULT_SCHEDULER_INTERVAL),
            shutdown_when_queue_empty: false,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            _state: PhantomData,
        }
    }

    /// Create a runner with concurrency and polling taken from `config`.
    pub fn from_config(connection_pool: SqlitePool, context: Context, config: &JobsConfig) -> Self {
        let mut runner = Self::new(connection_pool, context)
            .default_concurrency(config.default_concurrency)
            .poll_interval(config.poll_interval())
            .jitter(config.jitter())
            .batch_size(config.batch_size)
            .scheduler_interval(config.scheduler_interval());

        for (queue_name, &num_workers) in &config.queues {
            runner = runner.configure_queue(queue_name, |queue| queue.num_workers(num_workers));
        }
        runner
    }
}

impl<Context: Clone + Send + Sync + 'static, State> Runner<Context, State> {
    fn into_state<NewState>(self) -> Runner<Context, NewState> {
        Runner {
            connection_pool: self.connection_pool,
            job_registry: self.job_registry,
            queues: self.queues,
            context: self.context,
            default_concurrency: self.default_concurrency,
            poll_interval: self.poll_interval,
            jitter: self.jitter,
            batch_size: self.batch_size,
            scheduler_interval: self.scheduler_interval,
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            shutdown: self.shutdown,
            started: self.started,
            _state: PhantomData,
        }
    }

    /// Configure a queue
    ///
    /// Every configured queue gets workers, and those workers run jobs of
    /// any registered type that were enqueued on it.
    pub fn configure_queue(
        mut self,
        queue_name: &str,
        config_fn: impl FnOnce(Queue) -> Queue,
    ) -> Self {
        let queue = self.queues.remove(queue_name).unwrap_or_default();
        self.queues.insert(queue_name.into(), config_fn(queue));
        self
    }

    /// Set the number of workers for queues without an explicit
    /// [`Queue::num_workers`].
    pub fn default_concurrency(mut self, num_workers: usize) -> Self {
        self.default_concurrency = num_workers;
        self
    }

    /// Set how often idle workers poll for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously. The actual jitter applied will
    /// be a random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set how many eligible jobs a worker fetches per poll.
    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set how often recurring definitions are materialized.
    pub fn scheduler_interval(mut self, interval: Duration) -> Self {
        self.scheduler_interval = Some(interval);
        self
    }

    /// Do not run the recurring job scheduler in this process.
    pub fn without_scheduler(mut self) -> Self {
        self.scheduler_interval = None;
        self
    }

    /// Set the runner to shut down when the background job queue is empty.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Use `token` as the shutdown signal.
    ///
    /// Handlers that want to react to shutdown can keep a clone of the same
    /// token in their context. Cancelling it is equivalent to
    /// [`Runner::stop`].
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// The token that stops this runner when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Register a job type.
    ///
    /// The handler is available to the workers of every queue. The queue
    /// named by [`BackgroundJob::QUEUE`] gets workers even if it was never
    /// configured explicitly.
    pub fn register<J: BackgroundJob<Context = Context>>(mut self) -> Runner<Context, Configured> {
        self.job_registry.register::<J>();
        self.queues.entry(J::QUEUE.to_string()).or_default();
        self.into_state()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context, Configured> {
    /// Start the background workers and the scheduler.
    ///
    /// This returns a [`RunHandle`] which can be used to stop the workers and
    /// wait for them to shut down. Starting an already started runner does
    /// nothing and returns a handle without workers.
    pub fn start(&self) -> RunHandle {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Runner already started");
            return RunHandle {
                workers: Vec::new(),
                scheduler: None,
                shutdown: self.shutdown.clone(),
            };
        }

        let job_registry = Arc::new(self.job_registry.clone());
        let mut workers = Vec::new();
        for (queue_name, queue) in &self.queues {
            let num_workers = queue.num_workers.unwrap_or(self.default_concurrency);
            for i in 1..=num_workers {
                let name = format!("background-worker-{queue_name}-{i}");
                info!(worker.name = %name, "Starting worker…");

                let worker = Worker {
                    connection_pool: self.connection_pool.clone(),
                    context: self.context.clone(),
                    queue_name: queue_name.clone(),
                    job_registry: job_registry.clone(),
                    shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                    poll_interval: queue.poll_interval.unwrap_or(self.poll_interval),
                    jitter: queue.jitter.unwrap_or(self.jitter),
                    batch_size: i64::from(self.batch_size),
                    shutdown: self.shutdown.clone(),
                };

                let span = info_span!("worker", worker.name = %name);
                let handle = tokio::spawn(async move { worker.run().instrument(span).await });

                workers.push(handle);
            }
        }

        let scheduler = self.scheduler_interval.map(|interval| {
            Scheduler {
                connection_pool: self.connection_pool.clone(),
                interval,
                shutdown: self.shutdown.clone(),
            }
            .start()
        });

        RunHandle {
            workers,
            scheduler,
            shutdown: self.shutdown.clone(),
        }
    }

    /// Ask all workers and the scheduler to stop.
    ///
    /// Workers finish the job they are executing, then exit. Calling this
    /// more than once has no further effect.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Stopping background workers…");
        }
        self.shutdown.cancel();
    }
}

/// Handle to a running background job processing system
#[derive(Debug)]
pub struct RunHandle {
    workers: Vec<JoinHandle<()>>,
    scheduler: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl RunHandle {
    /// Ask all workers and the scheduler to stop. Idempotent.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Wait for all background workers to shut down, then stop the scheduler.
    pub async fn wait_for_shutdown(self) {
        join_all(self.workers).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Background worker task panicked");
            }
        });

        self.shutdown.cancel();
        if let Some(scheduler) = self.scheduler {
            if let Err(error) = scheduler.await {
                warn!(%error, "Scheduler task panicked");
            }
        }
    }

    /// Stop and wait for shutdown.
    pub async fn shutdown(self) {
        self.stop();
        self.wait_for_shutdown().await;
    }
}

/// Worker settings for a job queue
#[derive(Debug, Clone, Default)]
pub struct Queue {
    num_workers: Option<usize>,
    poll_interval: Option<Duration>,
    jitter: Option<Duration>,
}

impl Queue {
    /// Set the number of workers for this queue.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = Some(num_workers);
        self
    }

    /// Override the runner's poll interval for this queue.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = Some(poll_interval);
        self
    }

    /// Override the runner's jitter for this queue.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter);
        self
    }
}
