use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use sqlx::PgPool;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{Instrument, info, info_span, warn};

use crate::cleaner::Cleaner;
use crate::job_registry::JobRegistry;
use crate::policy::RetryPolicy;
use crate::queue_job::{DEFAULT_QUEUE, QueueJob};
use crate::scheduler::Scheduler;
use crate::worker::Worker;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);
const DEFAULT_FAILED_ROW_RETENTION_DAYS: i64 = 14;

/// The core runner responsible for locking and running queue jobs.
///
/// Constructed from an explicit pool and context; there is no process-wide
/// instance. Each named queue carries its own worker count, poll interval
/// and retry policy.
pub struct Runner<Context: Clone + Send + Sync + 'static> {
    connection_pool: PgPool,
    queues: HashMap<String, Queue<Context>>,
    context: Context,
    shutdown_when_queue_empty: bool,
    failed_row_retention_days: i64,
}

impl<Context: std::fmt::Debug + Clone + Sync + Send> std::fmt::Debug for Runner<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .field("context", &self.context)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context> {
    /// Create a new runner with the given connection pool and context.
    pub fn new(connection_pool: PgPool, context: Context) -> Self {
        Self {
            connection_pool,
            queues: HashMap::new(),
            context,
            shutdown_when_queue_empty: false,
            failed_row_retention_days: DEFAULT_FAILED_ROW_RETENTION_DAYS,
        }
    }

    /// Register a job type on the queue named by its `QUEUE` const.
    pub fn register<J: QueueJob<Context = Context>>(mut self) -> Self {
        self.queues
            .entry(J::QUEUE.into())
            .or_default()
            .job_registry
            .register::<J>();
        self
    }

    /// Configure a named queue.
    pub fn configure_queue(
        mut self,
        queue_name: &str,
        config_fn: impl FnOnce(Queue<Context>) -> Queue<Context>,
    ) -> Self {
        let queue = self.queues.remove(queue_name).unwrap_or_default();
        self.queues.insert(queue_name.into(), config_fn(queue));
        self
    }

    /// Configure the default queue.
    pub fn configure_default_queue(
        self,
        config_fn: impl FnOnce(Queue<Context>) -> Queue<Context>,
    ) -> Self {
        self.configure_queue(DEFAULT_QUEUE, config_fn)
    }

    /// Set the runner to shut down when every queue is empty.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Set how long failed queue rows are kept for diagnosis before the
    /// cleaner prunes them (see
    /// [`PruningConfig::failed_queue_row_retention_days`](crate::config::PruningConfig)).
    pub fn failed_row_retention_days(mut self, days: i64) -> Self {
        self.failed_row_retention_days = days;
        self
    }

    /// Start the workers, the repeatable-job scheduler and the queue cleaner.
    ///
    /// This returns a [`RunHandle`] which can be used to wait for the
    /// workers to shut down.
    pub fn start(&self) -> RunHandle {
        let mut handles = Vec::new();
        for (queue_name, queue) in &self.queues {
            for i in 1..=queue.num_workers {
                let name = format!("worker-{queue_name}-{i}");
                info!(worker.name = %name, "Starting worker…");

                let worker = Worker {
                    connection_pool: self.connection_pool.clone(),
                    context: self.context.clone(),
                    queue_name: queue_name.clone(),
                    job_registry: Arc::new(queue.job_registry.clone()),
                    retry_policy: queue.retry_policy,
                    shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                    poll_interval: queue.poll_interval,
                    jitter: queue.jitter,
                };

                let span = info_span!("worker", worker.name = %name);
                let handle = tokio::spawn(async move { worker.run().instrument(span).await });

                handles.push(handle);
            }
        }

        let scheduler = Scheduler::new(self.connection_pool.clone()).start();
        let cleaner =
            Cleaner::new(self.connection_pool.clone(), self.failed_row_retention_days).start();

        RunHandle {
            handles,
            background: vec![scheduler, cleaner],
        }
    }
}

/// Handle to a running queue processing system.
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
    background: Vec<AbortHandle>,
}

impl RunHandle {
    /// Wait for all workers to shut down, then stop the scheduler and
    /// cleaner tasks.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Worker task panicked");
            }
        });

        for handle in self.background {
            handle.abort();
        }
    }
}

/// Configuration and state for one named job queue.
pub struct Queue<Context: Clone + Send + Sync + 'static> {
    pub(crate) job_registry: JobRegistry<Context>,
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
    retry_policy: RetryPolicy,
}

impl<Context: Clone + Send + Sync + 'static> std::fmt::Debug for Queue<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("num_workers", &self.num_workers)
            .field("poll_interval", &self.poll_interval)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

impl<Context: Clone + Send + Sync + 'static> Default for Queue<Context> {
    fn default() -> Self {
        Self {
            job_registry: JobRegistry::default(),
            num_workers: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl<Context: Clone + Send + Sync + 'static> Queue<Context> {
    /// Set the number of worker tasks for this queue.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set how often workers poll for new jobs.
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

    /// Set the retry policy applied to failed jobs on this queue.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Apply environment-level tunables from a
    /// [`QueueConfig`](crate::config::QueueConfig) section.
    pub fn apply(mut self, config: &crate::config::QueueConfig) -> Self {
        self.num_workers = config.num_workers;
        self.poll_interval = Duration::from_secs(config.poll_interval_secs);
        self.jitter = Duration::from_millis(config.jitter_ms);
        self
    }
}
