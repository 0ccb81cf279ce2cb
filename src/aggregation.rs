//! The aggregation worker: claims queued runs, drives the Pipeline Runner
//! and reconciles the Job Store.
//!
//! One-time runs complete their job row when the pipeline returns.
//! Continuous jobs stay `running` between ticks; each tick is a queue
//! occurrence materialized from the config's repeatable registration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::{OrchestratorContext, PipelineOutcome, PipelineRunOptions};
use crate::errors::StartJobError;
use crate::job_store::JobStore;
use crate::policy::Schedule;
use crate::queue_job::{QueueJob, remove_repeatable};
use crate::quota::QuotaGate;
use crate::retention::{RetentionStore, RetryRetention};
use crate::schema::{AggregationJob, AggregationJobStatus, JobLogEntry};

/// Queue name for aggregation runs.
pub const AGGREGATION_QUEUE: &str = "aggregation";

const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Create a one-time job and enqueue its run.
///
/// One-time jobs never hold the config's `active_job_id` pointer, so they
/// may run concurrently with each other and with a continuous job.
pub async fn start_one_time(
    pool: &PgPool,
    config_id: Uuid,
    tenant_id: Uuid,
) -> Result<AggregationJob, StartJobError> {
    let store = JobStore::new(pool.clone());
    let job = store.create_one_time_job(config_id, tenant_id).await?;

    let run = RunAggregation {
        job_id: job.id,
        config_id,
        tick: false,
    };
    if let Err(error) = run.enqueue(pool).await {
        // Broker down: don't leave a running row with no execution behind it.
        let _ = store.cancel_job(job.id).await;
        return Err(error.into());
    }

    Ok(job)
}

/// Create a continuous job and register its repeatable tick schedule,
/// keyed by config id so rescheduling replaces any prior registration.
pub async fn start_continuous(
    pool: &PgPool,
    config_id: Uuid,
    tenant_id: Uuid,
    interval_secs: i64,
) -> Result<AggregationJob, StartJobError> {
    let store = JobStore::new(pool.clone());
    let job = store
        .create_continuous_job(config_id, tenant_id, interval_secs)
        .await?;

    let tick = RunAggregation {
        job_id: job.id,
        config_id,
        tick: true,
    };
    let schedule = Schedule::every(Duration::from_secs(interval_secs.max(1) as u64));
    if let Err(error) = tick
        .register_repeatable(pool, &repeatable_key(config_id), schedule)
        .await
    {
        let _ = store.cancel_job(job.id).await;
        return Err(error.into());
    }

    // The first tick runs immediately; the registration covers the rest.
    if let Err(error) = tick.enqueue(pool).await {
        let _ = remove_repeatable(pool, &repeatable_key(config_id)).await;
        let _ = store.cancel_job(job.id).await;
        return Err(error.into());
    }

    Ok(job)
}

/// Cancel a job. For continuous jobs this also removes the tick schedule.
pub async fn stop_job(pool: &PgPool, job_id: Uuid) -> Result<(), StartJobError> {
    let store = JobStore::new(pool.clone());
    if let Some(job) = store.get_job(job_id).await? {
        if job.is_continuous() {
            remove_repeatable(pool, &repeatable_key(job.config_id)).await?;
        }
        store.cancel_job(job_id).await?;
    }
    Ok(())
}

/// Repeatable-registration key for a config's continuous schedule.
pub fn repeatable_key(config_id: Uuid) -> String {
    format!("aggregation:{config_id}")
}

/// One queued execution of an aggregation pipeline: either a one-time run
/// or a single tick of a continuous job.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunAggregation {
    /// The aggregation job this run reconciles into.
    pub job_id: Uuid,
    /// The pipeline config to run.
    pub config_id: Uuid,
    /// Whether this is a continuous tick.
    pub tick: bool,
}

impl QueueJob for RunAggregation {
    const JOB_TYPE: &'static str = "run_aggregation";
    const QUEUE: &'static str = AGGREGATION_QUEUE;

    type Context = OrchestratorContext;

    async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
        let store = JobStore::new(ctx.pool.clone());

        let Some(job) = store.get_job(self.job_id).await? else {
            warn!(job.id = %self.job_id, "Aggregation job row is gone, skipping run");
            return Ok(());
        };
        if job.status.is_terminal() {
            debug!(job.id = %self.job_id, status = ?job.status, "Job already terminal, skipping run");
            return Ok(());
        }

        let started_at = chrono::Utc::now();
        self.milestone(&store, 10, "config loaded").await;

        let resolved = match ctx.resolver.resolve(self.config_id).await {
            Ok(resolved) => resolved,
            Err(error) => return self.fail(&store, error).await,
        };
        self.milestone(&store, 20, "secrets and storage resolved")
            .await;

        // Cooperative cancellation: a cancel request lands in the Job Store,
        // and this watcher trips the token the pipeline polls at its I/O
        // boundaries. There is no forcible interruption.
        let cancel = CancellationToken::new();
        let watcher = spawn_cancel_watcher(store.clone(), self.job_id, cancel.clone());

        self.milestone(&store, 30, "pipeline started").await;
        let options = PipelineRunOptions {
            job_id: self.job_id,
            tick: self.tick,
            cancel: cancel.clone(),
        };
        let result = ctx
            .pipeline
            .run(self.config_id, &resolved.secrets, resolved.storage.clone(), &options)
            .await;
        watcher.abort();

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(error) => return self.fail(&store, error).await,
        };
        self.milestone(&store, 80, "pipeline finished, reconciling")
            .await;

        self.defer_unstored(&ctx, &outcome).await?;

        // Cancellation checkpoint: if the job went terminal mid-run the
        // cancel path already settled the row and the config pointer.
        if matches!(
            store.job_status(self.job_id).await?,
            Some(status) if status.is_terminal()
        ) {
            info!(job.id = %self.job_id, "Job was stopped mid-run, discarding completion");
            return Ok(());
        }

        if self.tick {
            store.record_continuous_tick(self.job_id, &outcome).await?;
        } else {
            store.update_job_progress(self.job_id, &outcome).await?;
            store.complete_job(self.job_id).await?;
        }

        let gate = QuotaGate::new(ctx.pool.clone(), ctx.config.quotas.clone());
        gate.record_ai_usage(job.tenant_id, &outcome.token_usage)
            .await?;

        store.finish_config_run(self.config_id, started_at).await?;
        self.milestone(&store, 100, "run complete").await;

        Ok(())
    }
}

impl RunAggregation {
    /// Coarse progress signal for external observers, without per-item
    /// chatter.
    async fn milestone(&self, store: &JobStore, pct: u8, message: &str) {
        let entry = JobLogEntry::info(format!("progress {pct}%: {message}"));
        if let Err(error) = store.append_job_log(self.job_id, &entry).await {
            warn!(job.id = %self.job_id, %error, "Failed to append progress log");
        }
    }

    /// Persist failed external writes as retention items and hand them to
    /// the Retention Retry Manager.
    async fn defer_unstored(
        &self,
        ctx: &OrchestratorContext,
        outcome: &PipelineOutcome,
    ) -> anyhow::Result<()> {
        if outcome.unstored.is_empty() {
            return Ok(());
        }

        let retention = RetentionStore::new(ctx.pool.clone());
        for payload in &outcome.unstored {
            let item_id = retention
                .create(self.config_id, payload.data_type, payload.data.clone())
                .await?;
            RetryRetention { item_id }.enqueue(&ctx.pool).await?;
        }
        info!(
            job.id = %self.job_id,
            count = outcome.unstored.len(),
            "Deferred unstored payload(s) for retention replay"
        );
        Ok(())
    }

    /// Record the failure verbatim and rethrow so the broker's retry
    /// policy decides whether to reattempt.
    async fn fail(&self, store: &JobStore, error: anyhow::Error) -> anyhow::Result<()> {
        let message = error.to_string();
        let entry = JobLogEntry::error(message.clone());
        let _ = store.append_job_log(self.job_id, &entry).await;
        match store.fail_job(self.job_id, &message).await {
            // Already terminal (e.g. cancelled mid-run): nothing to record.
            Ok(()) | Err(crate::errors::JobStoreError::NotFound(_)) => {}
            Err(store_error) => return Err(store_error.into()),
        }
        Err(error)
    }
}

fn spawn_cancel_watcher(
    store: JobStore,
    job_id: Uuid,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CANCEL_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match store.job_status(job_id).await {
                Ok(Some(AggregationJobStatus::Cancelled)) => {
                    cancel.cancel();
                    break;
                }
                Ok(Some(status)) if status.is_terminal() => break,
                Ok(_) => {}
                Err(error) => {
                    warn!(job.id = %job_id, %error, "Cancellation watcher poll failed");
                }
            }
        }
    })
}
