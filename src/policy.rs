//! Broker-neutral retry and scheduling vocabulary.
//!
//! Queues are configured with a [`RetryPolicy`] and repeatable registrations
//! with a [`Schedule`], so callers never depend on any one backend's job
//! option blobs.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the delay between retry attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// The seed delay on every attempt.
    Fixed,
    /// `seed * 2^(attempt - 1)`.
    Exponential,
}

/// Retry behaviour of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts before the job is considered exhausted.
    pub max_attempts: u32,
    /// How the delay grows between attempts.
    pub backoff: BackoffKind,
    /// Delay before the first retry.
    pub seed_delay: Duration,
}

impl RetryPolicy {
    /// Aggregation jobs: 3 attempts, exponential backoff seeded at 5s.
    pub fn aggregation() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::Exponential,
            seed_delay: Duration::from_secs(5),
        }
    }

    /// Retention replays: 5 attempts with a large exponential seed, since
    /// the target is an external and possibly-down database.
    pub fn retention_retry() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffKind::Exponential,
            seed_delay: Duration::from_secs(60),
        }
    }

    /// Embedding backfill: 3 attempts, fixed backoff.
    pub fn embedding_backfill() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::Fixed,
            seed_delay: Duration::from_secs(30),
        }
    }

    /// Delay to wait before the given retry attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self.backoff {
            BackoffKind::Fixed => self.seed_delay,
            BackoffKind::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.seed_delay.saturating_mul(factor)
            }
        }
    }

    /// Whether another attempt is allowed after `attempts` tries.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::Exponential,
            seed_delay: Duration::from_secs(5),
        }
    }
}

/// When a repeatable or delayed job should run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Run once after the given number of seconds.
    Delay {
        /// Seconds to wait.
        secs: u64,
    },
    /// Run repeatedly, every given number of seconds.
    Every {
        /// Seconds between occurrences.
        secs: u64,
    },
    /// Run repeatedly on a cron expression (with seconds field).
    Cron {
        /// Cron expression, e.g. `"0 0 3 * * *"`.
        expr: String,
    },
}

impl Schedule {
    /// Convenience constructor for an interval schedule.
    pub fn every(interval: Duration) -> Self {
        Self::Every {
            secs: interval.as_secs(),
        }
    }

    /// Convenience constructor for a cron schedule. The expression is
    /// validated at registration time, not here.
    pub fn cron(expr: impl Into<String>) -> Self {
        Self::Cron { expr: expr.into() }
    }

    /// The next occurrence strictly after `after`.
    ///
    /// Returns `None` for one-shot delays that already elapsed and for
    /// unparseable cron expressions.
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Delay { secs } => Some(after + chrono::Duration::seconds(*secs as i64)),
            Self::Every { secs } => Some(after + chrono::Duration::seconds((*secs).max(1) as i64)),
            Self::Cron { expr } => {
                let schedule = cron::Schedule::from_str(expr).ok()?;
                schedule.after(&after).next()
            }
        }
    }

    /// Whether the schedule recurs (interval or cron) or fires once.
    pub fn is_repeating(&self) -> bool {
        !matches!(self, Self::Delay { .. })
    }
}
