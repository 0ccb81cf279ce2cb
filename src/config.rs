//! Environment-level configuration for the orchestration core.

use serde::Deserialize;

/// Per-tier ceilings consulted by the Quota Gate.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TierQuotas {
    /// Maximum configs a free-tier tenant may own.
    pub free_max_configs: i32,
    /// Maximum runs per UTC day for free-tier tenants.
    pub free_max_runs_per_day: i32,
    /// Daily token budget for paid-tier AI usage.
    pub paid_daily_token_budget: i64,
    /// Daily cost budget in cents for paid-tier AI usage.
    pub paid_daily_cost_cents_budget: i64,
}

impl Default for TierQuotas {
    fn default() -> Self {
        Self {
            free_max_configs: 3,
            free_max_runs_per_day: 1,
            paid_daily_token_budget: 1_000_000,
            paid_daily_cost_cents_budget: 500,
        }
    }
}

/// Tunables for one worker queue.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Concurrent workers pulling from the queue.
    pub num_workers: usize,
    /// Seconds between polls when the queue is empty.
    pub poll_interval_secs: u64,
    /// Maximum random jitter added to the poll interval, in milliseconds.
    pub jitter_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            poll_interval_secs: 1,
            jitter_ms: 100,
        }
    }
}

/// Top-level configuration, deserializable from any serde source with every
/// field defaulted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Aggregation queue tunables. This queue is I/O- and cost-bound, so
    /// concurrency stays small.
    pub aggregation_queue: QueueConfig,
    /// Per-tier quota ceilings.
    pub quotas: TierQuotas,
    /// Retention/replay tunables.
    pub retention: RetentionConfig,
    /// License sweep tunables.
    pub license: LicenseConfig,
    /// Terminal-job pruning tunables.
    pub pruning: PruningConfig,
}

/// Tunables for the Retention Retry Manager.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetentionConfig {
    /// Replay attempts before an item is abandoned.
    pub retry_ceiling: i32,
    /// Minimum age, in seconds, before the sweep re-enqueues an item.
    pub resweep_after_secs: i64,
    /// Days an abandoned item is kept for operator inspection before GC.
    pub abandon_window_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: 5,
            resweep_after_secs: 3600,
            abandon_window_days: 7,
        }
    }
}

/// Tunables for the License Gate sweep.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LicenseConfig {
    /// Cron expression for the compliance sweep.
    pub sweep_schedule: String,
    /// Seconds a license verification result stays cached.
    pub verification_ttl_secs: u64,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            sweep_schedule: "0 0 * * * *".into(),
            verification_ttl_secs: 300,
        }
    }
}

/// Tunables for terminal-job pruning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PruningConfig {
    /// Cron expression for the daily pruning job.
    pub schedule: String,
    /// Days a terminal aggregation job is kept before deletion.
    pub job_retention_days: i64,
    /// Days an exhausted queue row is kept for diagnosis before deletion.
    pub failed_queue_row_retention_days: i64,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            schedule: "0 30 3 * * *".into(),
            job_retention_days: 90,
            failed_queue_row_retention_days: 14,
        }
    }
}
