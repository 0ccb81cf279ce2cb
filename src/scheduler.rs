use std::time::Duration;

use sqlx::PgPool;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::storage;

const SCHEDULER_TICK: Duration = Duration::from_secs(1);

/// Moves due repeatable registrations onto the live queue.
///
/// One scheduler task runs per [`Runner`](crate::Runner); the materialize
/// query uses `FOR UPDATE SKIP LOCKED` so concurrent runner processes never
/// enqueue the same occurrence twice.
pub(crate) struct Scheduler {
    pool: PgPool,
}

impl Scheduler {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub(crate) fn start(self) -> AbortHandle {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SCHEDULER_TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match storage::materialize_due_repeatables(&self.pool).await {
                    Ok(0) => {}
                    Ok(count) => debug!("Enqueued {count} repeatable job occurrence(s)"),
                    Err(error) => warn!("Failed to materialize repeatable jobs: {error}"),
                }
            }
        });
        task.abort_handle()
    }
}
