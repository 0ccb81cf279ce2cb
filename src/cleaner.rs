use std::time::Duration;

use sqlx::PgPool;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::storage;

const CLEANER_TICK: Duration = Duration::from_secs(3600);

/// Prunes failed queue rows once they are older than the diagnostic
/// window. Successful rows are deleted at completion time by the worker,
/// so this only ever touches failures.
///
/// Claim and dedup queries already exclude rows with failures, so the
/// window only bounds how long they stay visible to operators.
pub(crate) struct Cleaner {
    pool: PgPool,
    retention_days: i64,
}

impl Cleaner {
    pub(crate) fn new(pool: PgPool, retention_days: i64) -> Self {
        Self {
            pool,
            retention_days,
        }
    }

    pub(crate) fn start(self) -> AbortHandle {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANER_TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match storage::prune_failed_jobs(&self.pool, self.retention_days).await {
                    Ok(0) => {}
                    Ok(count) => debug!("Pruned {count} failed queue row(s)"),
                    Err(error) => warn!("Failed to prune failed queue rows: {error}"),
                }
            }
        });
        task.abort_handle()
    }
}
