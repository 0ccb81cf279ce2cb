//! The Retention Retry Manager: replays writes that failed against
//! tenant-owned external storage.
//!
//! Items are created by the aggregation worker when a commit fails, retried
//! here at concurrency 1, and either deleted on the first successful replay
//! or left in place once they exhaust the retry ceiling. Exhausted items
//! stay visible to operators and are only garbage-collected by age.

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::context::OrchestratorContext;
use crate::errors::JobStoreError;
use crate::queue_job::QueueJob;
use crate::schema::{RetentionDataType, RetentionItem};

/// Queue name for retention replays. Runs at concurrency 1.
pub const RETENTION_QUEUE: &str = "retention-retry";

/// Store for deferred external writes.
#[derive(Debug, Clone)]
pub struct RetentionStore {
    pool: PgPool,
}

impl RetentionStore {
    /// Create a store over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Persist a payload that could not be committed to external storage.
    #[instrument(skip(self, data))]
    pub async fn create(
        &self,
        config_id: Uuid,
        data_type: RetentionDataType,
        data: Value,
    ) -> Result<Uuid, JobStoreError> {
        let id = Uuid::now_v7();
        sqlx::query(
            "INSERT INTO retention_items (id, config_id, data_type, data) VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(config_id)
        .bind(data_type)
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Fetch an item by id. `None` once it has been replayed or discarded.
    pub async fn get(&self, item_id: Uuid) -> Result<Option<RetentionItem>, JobStoreError> {
        let item = sqlx::query_as::<_, RetentionItem>(
            r"
            SELECT id, config_id, data_type, data, retry_count, last_retry_at, created_at
            FROM retention_items
            WHERE id = $1
            ",
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(item)
    }

    /// Delete an item after a successful replay (or because it no longer
    /// applies). Deleting a missing item is a no-op.
    pub async fn delete(&self, item_id: Uuid) -> Result<(), JobStoreError> {
        sqlx::query("DELETE FROM retention_items WHERE id = $1")
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record one failed replay attempt.
    pub async fn record_attempt(&self, item_id: Uuid) -> Result<(), JobStoreError> {
        sqlx::query(
            "UPDATE retention_items SET retry_count = retry_count + 1, last_retry_at = NOW() WHERE id = $1",
        )
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Items eligible for another sweep pass: under the retry ceiling and
    /// either never tried or last tried more than `resweep_after_secs` ago.
    /// Exhausted items are deliberately excluded.
    pub async fn sweep_candidates(
        &self,
        retry_ceiling: i32,
        resweep_after_secs: i64,
    ) -> Result<Vec<Uuid>, JobStoreError> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r"
            SELECT id FROM retention_items
            WHERE retry_count < $1
              AND (last_retry_at IS NULL
                   OR last_retry_at < NOW() - make_interval(secs => $2::double precision))
            ORDER BY created_at ASC
            ",
        )
        .bind(retry_ceiling)
        .bind(resweep_after_secs as f64)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Garbage-collect abandoned items: at or past the retry ceiling and
    /// older than the abandon window.
    pub async fn gc_abandoned(
        &self,
        retry_ceiling: i32,
        abandon_window_days: i64,
    ) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r"
            DELETE FROM retention_items
            WHERE retry_count >= $1
              AND created_at < NOW() - make_interval(days => $2::int)
            ",
        )
        .bind(retry_ceiling)
        .bind(abandon_window_days as i32)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Replay one retention item against the owning config's external storage.
#[derive(Debug, Serialize, Deserialize)]
pub struct RetryRetention {
    /// The item to replay.
    pub item_id: Uuid,
}

impl QueueJob for RetryRetention {
    const JOB_TYPE: &'static str = "retry_retention";
    const QUEUE: &'static str = RETENTION_QUEUE;
    // The hourly sweep re-enqueues candidates blindly; deduplication keeps
    // a slow replay from stacking up behind itself.
    const DEDUPLICATED: bool = true;

    type Context = OrchestratorContext;

    async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
        let store = RetentionStore::new(ctx.pool.clone());

        // Already replayed or discarded: a no-op, not an error.
        let Some(item) = store.get(self.item_id).await? else {
            debug!(item.id = %self.item_id, "Retention item already gone, nothing to replay");
            return Ok(());
        };

        let uses_external_storage = sqlx::query_scalar::<_, bool>(
            "SELECT uses_external_storage FROM aggregation_configs WHERE id = $1",
        )
        .bind(item.config_id)
        .fetch_optional(&ctx.pool)
        .await?
        .unwrap_or(false);

        if !uses_external_storage {
            info!(item.id = %item.id, "Config no longer uses external storage, discarding item");
            store.delete(item.id).await?;
            return Ok(());
        }

        let resolved = ctx
            .resolver
            .resolve(item.config_id)
            .await
            .context("failed to resolve storage for retention replay")?;

        let replay = replay_item(&item, resolved.storage.as_ref()).await;
        match replay {
            Ok(()) => {
                info!(item.id = %item.id, "Retention item replayed successfully");
                store.delete(item.id).await?;
                Ok(())
            }
            Err(error) => {
                warn!(item.id = %item.id, %error, "Retention replay failed");
                store.record_attempt(item.id).await?;
                // Rethrow so the broker reschedules with backoff.
                Err(error)
            }
        }
    }
}

async fn replay_item(
    item: &RetentionItem,
    storage: &dyn crate::context::ExternalStore,
) -> anyhow::Result<()> {
    match item.data_type {
        RetentionDataType::Items => {
            let items = item
                .data
                .as_array()
                .context("retention item of type 'items' does not hold an array")?;
            for value in items {
                storage.store_item(item.config_id, value).await?;
            }
            Ok(())
        }
        RetentionDataType::Summary => storage.store_summary(item.config_id, &item.data).await,
    }
}

/// Periodic sweep: re-enqueue every eligible retention item and
/// garbage-collect abandoned ones.
#[derive(Debug, Serialize, Deserialize)]
pub struct RetentionSweep;

impl QueueJob for RetentionSweep {
    const JOB_TYPE: &'static str = "retention_sweep";
    const QUEUE: &'static str = RETENTION_QUEUE;
    const DEDUPLICATED: bool = true;

    type Context = OrchestratorContext;

    async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
        let store = RetentionStore::new(ctx.pool.clone());
        let retention = &ctx.config.retention;

        let candidates = store
            .sweep_candidates(retention.retry_ceiling, retention.resweep_after_secs)
            .await?;
        let count = candidates.len();
        for item_id in candidates {
            RetryRetention { item_id }.enqueue(&ctx.pool).await?;
        }
        if count > 0 {
            info!("Re-enqueued {count} retention item(s) for replay");
        }

        let collected = store
            .gc_abandoned(retention.retry_ceiling, retention.abandon_window_days)
            .await?;
        if collected > 0 {
            info!("Garbage-collected {collected} abandoned retention item(s)");
        }

        Ok(())
    }
}
