//! The Job Store: durable record of every aggregation attempt and the
//! state machine that owns it.
//!
//! States: `pending → running → {completed | failed | cancelled}`. Terminal
//! states are final; every terminal transition carries a status guard so a
//! replayed or racing update can never resurrect a finished job. Counter
//! updates are purely additive SQL, which makes the monotonicity invariant
//! hold by construction.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::context::PipelineOutcome;
use crate::errors::JobStoreError;
use crate::schema::{
    AggregationConfig, AggregationJob, AggregationJobStatus, AggregationJobType, JobLogEntry,
};

/// Terminal reason recorded when the license sweep stops a job. Distinct
/// from a plain cancellation (which records no message) so tenant-facing
/// UIs can explain why the job stopped.
pub const LICENSE_EXPIRED_MESSAGE: &str = "subscription license expired";

const JOB_COLUMNS: &str = r"
    id, config_id, tenant_id, job_type, global_interval_secs, status,
    started_at, completed_at, items_fetched, items_processed, run_count,
    last_fetch_at, error_message, logs, total_prompt_tokens,
    total_completion_tokens, total_ai_calls, estimated_cost_usd, created_at
";

/// Handle to the aggregation job tables. Cheap to clone.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: PgPool,
}

impl JobStore {
    /// Create a store over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a one-time job, directly in the `running` state.
    ///
    /// One-time jobs never hold the config's `active_job_id` pointer, so
    /// several may run concurrently for the same config.
    #[instrument(skip(self))]
    pub async fn create_one_time_job(
        &self,
        config_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<AggregationJob, JobStoreError> {
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, AggregationJob>(&format!(
            r"
            INSERT INTO aggregation_jobs (id, config_id, tenant_id, job_type, status, started_at)
            VALUES ($1, $2, $3, 'one_time', 'running', NOW())
            RETURNING {JOB_COLUMNS}
            "
        ))
        .bind(Uuid::now_v7())
        .bind(config_id)
        .bind(tenant_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE aggregation_configs SET status = 'running' WHERE id = $1")
            .bind(config_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(job)
    }

    /// Create a continuous job, taking the config's `active_job_id` pointer.
    ///
    /// The pointer is taken with a conditional update, so at most one
    /// continuous job per config can ever be running: a second creation
    /// fails with [`JobStoreError::AlreadyRunning`].
    #[instrument(skip(self))]
    pub async fn create_continuous_job(
        &self,
        config_id: Uuid,
        tenant_id: Uuid,
        interval_secs: i64,
    ) -> Result<AggregationJob, JobStoreError> {
        let mut tx = self.pool.begin().await?;

        let job_id = Uuid::now_v7();
        let claimed = sqlx::query_scalar::<_, Uuid>(
            r"
            UPDATE aggregation_configs
            SET active_job_id = $2, status = 'running'
            WHERE id = $1 AND active_job_id IS NULL
            RETURNING id
            ",
        )
        .bind(config_id)
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?;

        if claimed.is_none() {
            tx.rollback().await?;
            return Err(JobStoreError::AlreadyRunning(config_id));
        }

        let job = sqlx::query_as::<_, AggregationJob>(&format!(
            r"
            INSERT INTO aggregation_jobs
                (id, config_id, tenant_id, job_type, global_interval_secs, status, started_at)
            VALUES ($1, $2, $3, 'continuous', $4, 'running', NOW())
            RETURNING {JOB_COLUMNS}
            "
        ))
        .bind(job_id)
        .bind(config_id)
        .bind(tenant_id)
        .bind(interval_secs)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(job)
    }

    /// Mark a job completed and, if it holds the config's active-job
    /// pointer, release the pointer and return the config to `idle`.
    #[instrument(skip(self))]
    pub async fn complete_job(&self, job_id: Uuid) -> Result<(), JobStoreError> {
        let mut tx = self.pool.begin().await?;

        let config_id = sqlx::query_scalar::<_, Uuid>(
            r"
            UPDATE aggregation_jobs
            SET status = 'completed', completed_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'running')
            RETURNING config_id
            ",
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(JobStoreError::NotFound(job_id))?;

        sqlx::query(
            r"
            UPDATE aggregation_configs
            SET active_job_id = NULL, status = 'idle'
            WHERE id = $1 AND active_job_id = $2
            ",
        )
        .bind(config_id)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Mark a job failed, record the error verbatim, and propagate it onto
    /// the owning config (`status = error`, `last_error`).
    #[instrument(skip(self, error))]
    pub async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<(), JobStoreError> {
        let mut tx = self.pool.begin().await?;

        let config_id = sqlx::query_scalar::<_, Uuid>(
            r"
            UPDATE aggregation_jobs
            SET status = 'failed', completed_at = NOW(), error_message = $2
            WHERE id = $1 AND status IN ('pending', 'running')
            RETURNING config_id
            ",
        )
        .bind(job_id)
        .bind(error)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(JobStoreError::NotFound(job_id))?;

        sqlx::query(
            r"
            UPDATE aggregation_configs
            SET active_job_id = CASE WHEN active_job_id = $2 THEN NULL ELSE active_job_id END,
                status = 'error',
                last_error = $3
            WHERE id = $1
            ",
        )
        .bind(config_id)
        .bind(job_id)
        .bind(error)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Cancel a job. No error is recorded.
    #[instrument(skip(self))]
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<(), JobStoreError> {
        self.stop_job(job_id, None).await
    }

    /// Stop a job because its backing subscription lapsed. Behaves like
    /// [`Self::cancel_job`] but records [`LICENSE_EXPIRED_MESSAGE`] as the
    /// terminal reason.
    #[instrument(skip(self))]
    pub async fn stop_job_for_expired_license(&self, job_id: Uuid) -> Result<(), JobStoreError> {
        info!(job.id = %job_id, "Stopping job for expired license");
        self.stop_job(job_id, Some(LICENSE_EXPIRED_MESSAGE)).await
    }

    async fn stop_job(&self, job_id: Uuid, reason: Option<&str>) -> Result<(), JobStoreError> {
        let mut tx = self.pool.begin().await?;

        let config_id = sqlx::query_scalar::<_, Uuid>(
            r"
            UPDATE aggregation_jobs
            SET status = 'cancelled', completed_at = NOW(), error_message = $2
            WHERE id = $1 AND status IN ('pending', 'running')
            RETURNING config_id
            ",
        )
        .bind(job_id)
        .bind(reason)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(JobStoreError::NotFound(job_id))?;

        sqlx::query(
            r"
            UPDATE aggregation_configs
            SET active_job_id = NULL, status = 'idle'
            WHERE id = $1 AND active_job_id = $2
            ",
        )
        .bind(config_id)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Fold one successful continuous tick into the job: counters and cost
    /// totals go up, `run_count` increments, `last_fetch_at` refreshes.
    /// The status stays `running` until the job is explicitly stopped.
    #[instrument(skip(self, outcome))]
    pub async fn record_continuous_tick(
        &self,
        job_id: Uuid,
        outcome: &PipelineOutcome,
    ) -> Result<(), JobStoreError> {
        self.fold_outcome(job_id, outcome, true).await
    }

    /// Fold run progress into the job without counting a tick.
    #[instrument(skip(self, outcome))]
    pub async fn update_job_progress(
        &self,
        job_id: Uuid,
        outcome: &PipelineOutcome,
    ) -> Result<(), JobStoreError> {
        self.fold_outcome(job_id, outcome, false).await
    }

    async fn fold_outcome(
        &self,
        job_id: Uuid,
        outcome: &PipelineOutcome,
        count_tick: bool,
    ) -> Result<(), JobStoreError> {
        let usage = outcome.token_usage;
        let updated = sqlx::query(
            r"
            UPDATE aggregation_jobs
            SET items_fetched = items_fetched + $2,
                items_processed = items_processed + $3,
                run_count = run_count + $4,
                last_fetch_at = NOW(),
                total_prompt_tokens = total_prompt_tokens + $5,
                total_completion_tokens = total_completion_tokens + $6,
                total_ai_calls = total_ai_calls + $7,
                estimated_cost_usd = estimated_cost_usd + $8
            WHERE id = $1
            ",
        )
        .bind(job_id)
        .bind(outcome.items_fetched)
        .bind(outcome.items_processed)
        .bind(if count_tick { 1i64 } else { 0i64 })
        .bind(usage.prompt_tokens)
        .bind(usage.completion_tokens)
        .bind(usage.ai_calls)
        .bind(usage.estimated_cost_usd)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job_id));
        }
        Ok(())
    }

    /// Append one entry to the job's diagnostic log. The log is append-only;
    /// history is never rewritten.
    pub async fn append_job_log(
        &self,
        job_id: Uuid,
        entry: &JobLogEntry,
    ) -> Result<(), JobStoreError> {
        let entry = serde_json::to_value(entry).unwrap_or_default();
        sqlx::query("UPDATE aggregation_jobs SET logs = logs || jsonb_build_array($2::jsonb) WHERE id = $1")
            .bind(job_id)
            .bind(entry)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fetch a job by id.
    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<AggregationJob>, JobStoreError> {
        let job = sqlx::query_as::<_, AggregationJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM aggregation_jobs WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    /// Current status of a job, if it exists. Used by workers as a
    /// cooperative cancellation checkpoint.
    pub async fn job_status(
        &self,
        job_id: Uuid,
    ) -> Result<Option<AggregationJobStatus>, JobStoreError> {
        let status = sqlx::query_scalar::<_, AggregationJobStatus>(
            "SELECT status FROM aggregation_jobs WHERE id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(status)
    }

    /// Every continuous job currently in the `running` state. Input to the
    /// license sweep.
    pub async fn running_continuous_jobs(&self) -> Result<Vec<AggregationJob>, JobStoreError> {
        let jobs = sqlx::query_as::<_, AggregationJob>(&format!(
            r"
            SELECT {JOB_COLUMNS} FROM aggregation_jobs
            WHERE job_type = 'continuous' AND status = 'running'
            ORDER BY created_at ASC
            "
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// Fetch the subset of a config this core works with.
    pub async fn get_config(
        &self,
        config_id: Uuid,
    ) -> Result<Option<AggregationConfig>, JobStoreError> {
        let config = sqlx::query_as::<_, AggregationConfig>(
            r"
            SELECT id, tenant_id, name, status, active_job_id, uses_external_storage,
                   global_interval_secs, last_run_at, last_run_duration_ms, last_error,
                   runs_today, runs_today_reset_at, created_at
            FROM aggregation_configs
            WHERE id = $1
            ",
        )
        .bind(config_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(config)
    }

    /// Stamp a finished run on the config and clear its transient `running`
    /// status. Paused and errored configs are left alone.
    pub async fn finish_config_run(
        &self,
        config_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let duration_ms = (Utc::now() - started_at).num_milliseconds().max(0);
        sqlx::query(
            r"
            UPDATE aggregation_configs
            SET last_run_at = NOW(),
                last_run_duration_ms = $2,
                status = CASE WHEN status = 'running' AND active_job_id IS NULL
                              THEN 'idle'::config_status ELSE status END
            WHERE id = $1
            ",
        )
        .bind(config_id)
        .bind(duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete terminal jobs older than the retention window. Running jobs
    /// are never pruned, regardless of age.
    #[instrument(skip(self))]
    pub async fn prune_terminal_jobs(&self, retention_days: i64) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r"
            DELETE FROM aggregation_jobs
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND created_at < NOW() - make_interval(days => $1::int)
            ",
        )
        .bind(retention_days as i32)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

impl AggregationJob {
    /// Whether this job is a continuous ticker.
    pub fn is_continuous(&self) -> bool {
        self.job_type == AggregationJobType::Continuous
    }
}
