use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::PgPool;
use tracing::instrument;

use crate::errors::EnqueueError;
use crate::policy::Schedule;

/// The default queue name used when no specific queue is specified.
pub const DEFAULT_QUEUE: &str = "default";

/// Trait for defining durable queue jobs that can be enqueued and executed
/// asynchronously by the worker pool.
pub trait QueueJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the job type.
    ///
    /// This MUST be unique for the whole application.
    const JOB_TYPE: &'static str;

    /// Default priority of the job.
    const PRIORITY: i16 = 0;

    /// Whether the job should be deduplicated.
    ///
    /// If true, the job will not be enqueued if there is already an
    /// unstarted job with the same data on the same queue.
    const DEDUPLICATED: bool = false;

    /// Named queue this job is executed on.
    const QUEUE: &'static str = DEFAULT_QUEUE;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + 'static;

    /// Execute the job. This method should define its logic.
    fn run(&self, ctx: Self::Context) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Enqueue this job for immediate background execution.
    ///
    /// Returns the queue row id if successfully enqueued, or `None` if
    /// deduplicated away.
    #[instrument(name = "queue.enqueue", skip(self, pool), fields(message = Self::JOB_TYPE))]
    fn enqueue<'a>(&'a self, pool: &'a PgPool) -> BoxFuture<'a, Result<Option<i64>, EnqueueError>> {
        let data = match serde_json::to_value(self) {
            Ok(data) => data,
            Err(err) => return async move { Err(EnqueueError::Serialization(err)) }.boxed(),
        };

        if Self::DEDUPLICATED {
            enqueue_deduplicated(pool, Self::QUEUE, Self::JOB_TYPE, data, Self::PRIORITY)
        } else {
            let future = enqueue_simple(
                pool,
                Self::QUEUE,
                Self::JOB_TYPE,
                data,
                Self::PRIORITY,
                Duration::ZERO,
            );
            async move { Ok(Some(future.await?)) }.boxed()
        }
    }

    /// Enqueue this job to become claimable only after `delay`.
    #[instrument(name = "queue.enqueue_delayed", skip(self, pool), fields(message = Self::JOB_TYPE))]
    fn enqueue_delayed<'a>(
        &'a self,
        pool: &'a PgPool,
        delay: Duration,
    ) -> BoxFuture<'a, Result<i64, EnqueueError>> {
        let data = match serde_json::to_value(self) {
            Ok(data) => data,
            Err(err) => return async move { Err(EnqueueError::Serialization(err)) }.boxed(),
        };

        enqueue_simple(pool, Self::QUEUE, Self::JOB_TYPE, data, Self::PRIORITY, delay)
    }

    /// Register (or replace) a repeatable schedule for this job under a
    /// stable key. Every due occurrence enqueues a copy of `self`.
    ///
    /// Registration is an upsert: re-registering under the same key first
    /// removes the prior registration, so a rescheduled config never has
    /// two live schedules.
    #[instrument(name = "queue.register_repeatable", skip(self, pool, schedule), fields(message = Self::JOB_TYPE, key = %key))]
    fn register_repeatable<'a>(
        &'a self,
        pool: &'a PgPool,
        key: &'a str,
        schedule: Schedule,
    ) -> BoxFuture<'a, Result<(), EnqueueError>> {
        let data = match serde_json::to_value(self) {
            Ok(data) => data,
            Err(err) => return async move { Err(EnqueueError::Serialization(err)) }.boxed(),
        };
        let schedule_json = match serde_json::to_string(&schedule) {
            Ok(json) => json,
            Err(err) => return async move { Err(EnqueueError::Serialization(err)) }.boxed(),
        };

        async move {
            let next_run_at = schedule
                .next_occurrence(chrono::Utc::now())
                .unwrap_or_else(chrono::Utc::now);

            sqlx::query(
                r"
                INSERT INTO repeatable_jobs (key, queue, job_type, data, schedule, next_run_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (key) DO UPDATE
                SET queue = EXCLUDED.queue,
                    job_type = EXCLUDED.job_type,
                    data = EXCLUDED.data,
                    schedule = EXCLUDED.schedule,
                    next_run_at = EXCLUDED.next_run_at
                ",
            )
            .bind(key)
            .bind(Self::QUEUE)
            .bind(Self::JOB_TYPE)
            .bind(data)
            .bind(schedule_json)
            .bind(next_run_at)
            .execute(pool)
            .await?;

            Ok(())
        }
        .boxed()
    }
}

/// Remove a repeatable registration by key. Removing an unknown key is a
/// no-op.
pub async fn remove_repeatable(pool: &PgPool, key: &str) -> Result<(), EnqueueError> {
    sqlx::query("DELETE FROM repeatable_jobs WHERE key = $1")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}

fn enqueue_deduplicated<'a>(
    pool: &'a PgPool,
    queue: &'a str,
    job_type: &'a str,
    data: Value,
    priority: i16,
) -> BoxFuture<'a, Result<Option<i64>, EnqueueError>> {
    async move {
        // Insert only if no identical unstarted job exists (not locked).
        // Rows that have failed at least once no longer count: an exhausted
        // row kept around for diagnosis must not suppress fresh occurrences.
        let result = sqlx::query_scalar::<_, Option<i64>>(
            r"
            INSERT INTO queue_jobs (queue, job_type, data, priority)
            SELECT $1, $2, $3, $4
            WHERE NOT EXISTS (
                SELECT 1 FROM queue_jobs
                WHERE queue = $1 AND job_type = $2 AND data = $3 AND retries = 0
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            ",
        )
        .bind(queue)
        .bind(job_type)
        .bind(data)
        .bind(priority)
        .fetch_optional(pool)
        .await?;

        Ok(result.flatten())
    }
    .boxed()
}

fn enqueue_simple<'a>(
    pool: &'a PgPool,
    queue: &'a str,
    job_type: &'a str,
    data: Value,
    priority: i16,
    delay: Duration,
) -> BoxFuture<'a, Result<i64, EnqueueError>> {
    async move {
        let id = sqlx::query_scalar::<_, i64>(
            r"
            INSERT INTO queue_jobs (queue, job_type, data, priority, next_attempt_at)
            VALUES ($1, $2, $3, $4, NOW() + $5::interval)
            RETURNING id
            ",
        )
        .bind(queue)
        .bind(job_type)
        .bind(data)
        .bind(priority)
        .bind(format!("{} milliseconds", delay.as_millis()))
        .fetch_one(pool)
        .await?;

        Ok(id)
    }
    .boxed()
}
