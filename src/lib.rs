#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod cleaner;
mod errors;
mod job_registry;
mod queue_job;
mod runner;
mod scheduler;
/// Database schema definitions.
pub mod schema;
mod storage;
mod util;
mod worker;

/// The aggregation worker and job start/stop entry points.
pub mod aggregation;
/// Environment-level configuration.
pub mod config;
/// Collaborator seams and the dependency-injection context.
pub mod context;
/// The Job Store state machine.
pub mod job_store;
/// The License Gate sweep and terminal-job pruning.
pub mod license;
/// Broker-neutral retry and schedule types.
pub mod policy;
/// The Quota Gate.
pub mod quota;
/// The Retention Retry Manager.
pub mod retention;

/// The main trait for defining durable queue jobs.
pub use self::queue_job::{DEFAULT_QUEUE, QueueJob, remove_repeatable};
/// Error types for the crate's public seams.
pub use self::errors::{EnqueueError, JobStoreError, QuotaError, StartJobError};
/// Retry/backoff and schedule vocabulary.
pub use self::policy::{BackoffKind, RetryPolicy, Schedule};
/// The main runner that orchestrates queue processing.
pub use self::runner::{Queue, RunHandle, Runner};

pub use self::aggregation::AGGREGATION_QUEUE;
pub use self::config::OrchestratorConfig;
pub use self::context::OrchestratorContext;
pub use self::job_store::{JobStore, LICENSE_EXPIRED_MESSAGE};
pub use self::license::install_maintenance_schedules;
pub use self::quota::{Decision, QuotaGate};
pub use self::retention::{RETENTION_QUEUE, RetentionStore};

/// Run the crate's database migrations on the given pool.
pub async fn setup_database(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
