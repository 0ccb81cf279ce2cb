//! Database schema definitions for SQLx.
//!
//! Row types and enums for the queue broker, the aggregation job store,
//! retention items and the tenant/config records the core mutates.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// Represents a durable queue job record in the database.
#[derive(Debug, Clone, FromRow)]
pub struct QueueJobRow {
    /// Unique identifier for the queue entry.
    pub id: i64,
    /// Named queue the job belongs to.
    pub queue: String,
    /// Type identifier for the job (used for dispatch).
    pub job_type: String,
    /// JSON data containing the job payload.
    pub data: Value,
    /// Priority of the job (higher = more important).
    pub priority: i16,
    /// Number of retry attempts made.
    pub retries: i32,
    /// Timestamp of the last retry attempt.
    pub last_retry: DateTime<Utc>,
    /// Earliest time the job may be claimed (backoff / delayed enqueue).
    pub next_attempt_at: DateTime<Utc>,
    /// Timestamp when the job was created.
    pub created_at: DateTime<Utc>,
}

/// A repeatable (cron-like) job registration.
///
/// Registrations are keyed so re-registering under the same key replaces
/// the prior schedule instead of stacking a second one.
#[derive(Debug, Clone, FromRow)]
pub struct RepeatableJobRow {
    /// Stable registration key (e.g. a config id).
    pub key: String,
    /// Named queue the materialized jobs go to.
    pub queue: String,
    /// Type identifier of the materialized jobs.
    pub job_type: String,
    /// Payload enqueued on every occurrence.
    pub data: Value,
    /// Serialized [`Schedule`](crate::Schedule).
    pub schedule: String,
    /// Next time the registration is due.
    pub next_run_at: DateTime<Utc>,
    /// Timestamp when the registration was created.
    pub created_at: DateTime<Utc>,
}

/// Subscription tier of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "tenant_tier", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TenantTier {
    /// Capped configs and daily runs, no summary generation.
    Free,
    /// Unlimited runs, daily AI token and cost budgets.
    Paid,
    /// Exempt from all gates, including the license sweep.
    Admin,
}

/// Whether a job runs once or ticks on an interval until stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "aggregation_job_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AggregationJobType {
    /// A single run that terminates on completion or failure.
    OneTime,
    /// A long-lived run that ticks on an interval until explicitly stopped.
    Continuous,
}

/// Lifecycle state of an aggregation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "aggregation_job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AggregationJobStatus {
    /// Created but not yet picked up. Transient in practice.
    Pending,
    /// Owned by a worker, or between ticks for continuous jobs.
    Running,
    /// Terminal: finished successfully.
    Completed,
    /// Terminal: the pipeline failed.
    Failed,
    /// Terminal: stopped by a user or the license sweep.
    Cancelled,
}

impl AggregationJobStatus {
    /// Whether this state admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Tenant-facing status of an aggregation config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "config_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConfigStatus {
    /// No job in flight.
    Idle,
    /// A job is currently executing or ticking.
    Running,
    /// The last run failed; see `last_error`.
    Error,
    /// Paused by the tenant.
    Paused,
}

/// One attempt to run a tenant's aggregation pipeline.
#[derive(Debug, Clone, FromRow)]
pub struct AggregationJob {
    /// Unique job identifier.
    pub id: Uuid,
    /// Owning pipeline config.
    pub config_id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// One-time or continuous.
    pub job_type: AggregationJobType,
    /// Seconds between ticks (continuous jobs only).
    pub global_interval_secs: Option<i64>,
    /// Current lifecycle state.
    pub status: AggregationJobStatus,
    /// When the job started executing.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Total items fetched across all ticks. Monotone.
    pub items_fetched: i64,
    /// Total items processed across all ticks. Monotone.
    pub items_processed: i64,
    /// Ticks completed (continuous jobs only). Monotone.
    pub run_count: i64,
    /// Timestamp of the most recent fetch.
    pub last_fetch_at: Option<DateTime<Utc>>,
    /// Failure or compliance-stop reason, if any.
    pub error_message: Option<String>,
    /// Append-only diagnostic log (JSON array of [`JobLogEntry`]).
    pub logs: Value,
    /// Prompt tokens consumed. Monotone.
    pub total_prompt_tokens: i64,
    /// Completion tokens consumed. Monotone.
    pub total_completion_tokens: i64,
    /// AI calls made. Monotone.
    pub total_ai_calls: i64,
    /// Estimated spend in USD. Monotone.
    pub estimated_cost_usd: f64,
    /// Timestamp when the job row was created.
    pub created_at: DateTime<Utc>,
}

/// A single append-only entry in an aggregation job's log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogEntry {
    /// When the entry was recorded.
    pub ts: DateTime<Utc>,
    /// Log level ("info", "warn", "error").
    pub level: String,
    /// Human-readable message.
    pub message: String,
    /// Optional originating component.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl JobLogEntry {
    /// Construct an info-level entry stamped with the current time.
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            level: "info".into(),
            message: message.into(),
            source: None,
        }
    }

    /// Construct an error-level entry stamped with the current time.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            level: "error".into(),
            message: message.into(),
            source: None,
        }
    }
}

/// Payload kind of a deferred external write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "retention_data_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RetentionDataType {
    /// An array of aggregated items, replayed one store call per item.
    Items,
    /// A single summary document, replayed as one store call.
    Summary,
}

/// A unit of data that could not be committed to a tenant's external
/// storage during a run, awaiting replay.
#[derive(Debug, Clone, FromRow)]
pub struct RetentionItem {
    /// Unique item identifier.
    pub id: Uuid,
    /// Owning pipeline config.
    pub config_id: Uuid,
    /// Payload kind.
    pub data_type: RetentionDataType,
    /// Opaque payload matching `data_type`.
    pub data: Value,
    /// Replay attempts made so far. Monotone.
    pub retry_count: i32,
    /// When the last replay was attempted.
    pub last_retry_at: Option<DateTime<Utc>>,
    /// Timestamp when the item was created.
    pub created_at: DateTime<Utc>,
}

/// The subset of an aggregation config this core consumes and mutates.
#[derive(Debug, Clone, FromRow)]
pub struct AggregationConfig {
    /// Unique config identifier.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Display name.
    pub name: String,
    /// Tenant-facing status, polled by UIs.
    pub status: ConfigStatus,
    /// The currently running continuous job, if any.
    pub active_job_id: Option<Uuid>,
    /// Whether results are committed to tenant-owned external storage.
    pub uses_external_storage: bool,
    /// Tick interval for continuous runs.
    pub global_interval_secs: Option<i64>,
    /// When the last run finished.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Duration of the last run.
    pub last_run_duration_ms: Option<i64>,
    /// Error message from the last failed run.
    pub last_error: Option<String>,
    /// Runs started today (UTC), lazily reset.
    pub runs_today: i32,
    /// UTC date `runs_today` was last reset for.
    pub runs_today_reset_at: NaiveDate,
    /// Timestamp when the config was created.
    pub created_at: DateTime<Utc>,
}

/// The subset of a tenant record consumed by the Quota Gate and the
/// license sweep.
#[derive(Debug, Clone, FromRow)]
pub struct Tenant {
    /// Unique tenant identifier.
    pub id: Uuid,
    /// Subscription tier.
    pub tier: TenantTier,
    /// Wallet address backing the subscription license.
    pub wallet_address: Option<String>,
    /// Number of configs the tenant owns.
    pub config_count: i32,
    /// When the free tier's daily free run was last used.
    pub free_run_used_at: Option<DateTime<Utc>>,
    /// AI calls made today (UTC), lazily reset.
    pub ai_calls_today: i64,
    /// UTC date `ai_calls_today` was last reset for.
    pub ai_calls_reset_at: NaiveDate,
    /// Tokens consumed today (UTC), lazily reset.
    pub tokens_used_today: i64,
    /// UTC date `tokens_used_today` was last reset for.
    pub tokens_reset_at: NaiveDate,
    /// Estimated spend today in cents (UTC), lazily reset.
    pub cost_today_cents: i64,
    /// UTC date `cost_today_cents` was last reset for.
    pub cost_reset_at: NaiveDate,
    /// Timestamp when the tenant was created.
    pub created_at: DateTime<Utc>,
}
