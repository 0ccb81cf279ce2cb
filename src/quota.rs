//! The Quota Gate: tier-based admission control for config creation, runs,
//! AI calls and token spend.
//!
//! Decisions are pure functions over counters; the daily counters use a
//! lazy UTC-midnight reset applied both in the pure decision (on read) and
//! in a single conditional UPDATE (on increment), so there is no separate
//! reset timer and no lost-update window under concurrent ticks.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

use crate::config::TierQuotas;
use crate::context::TokenUsage;
use crate::errors::QuotaError;
use crate::schema::{Tenant, TenantTier};

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The action is permitted.
    Allowed,
    /// The action is denied, with a tenant-facing reason.
    Denied {
        /// Why the action was denied.
        reason: String,
    },
}

impl Decision {
    fn denied(reason: impl Into<String>) -> Self {
        Self::Denied {
            reason: reason.into(),
        }
    }

    /// Whether the action is permitted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Convert into a `Result`, mapping denial to [`QuotaError::Denied`].
    pub fn into_result(self) -> Result<(), QuotaError> {
        match self {
            Self::Allowed => Ok(()),
            Self::Denied { reason } => Err(QuotaError::Denied { reason }),
        }
    }
}

/// A daily counter with its lazy-reset date.
#[derive(Debug, Clone, Copy)]
pub struct DailyCounter {
    /// The stored counter value.
    pub value: i64,
    /// The UTC date the counter was last reset for.
    pub reset_at: NaiveDate,
}

impl DailyCounter {
    /// The counter's value as of `today`: zero if the stored reset date
    /// predates today, the stored value otherwise.
    pub fn effective(&self, today: NaiveDate) -> i64 {
        if self.reset_at < today { 0 } else { self.value }
    }
}

/// Daily AI usage counters for one tenant.
#[derive(Debug, Clone, Copy)]
pub struct AiUsage {
    /// AI calls made today.
    pub ai_calls: DailyCounter,
    /// Tokens consumed today.
    pub tokens: DailyCounter,
    /// Estimated spend today, in cents.
    pub cost_cents: DailyCounter,
}

impl AiUsage {
    fn from_tenant(tenant: &Tenant) -> Self {
        Self {
            ai_calls: DailyCounter {
                value: tenant.ai_calls_today,
                reset_at: tenant.ai_calls_reset_at,
            },
            tokens: DailyCounter {
                value: tenant.tokens_used_today,
                reset_at: tenant.tokens_reset_at,
            },
            cost_cents: DailyCounter {
                value: tenant.cost_today_cents,
                reset_at: tenant.cost_reset_at,
            },
        }
    }
}

/// Can the tenant create another config?
pub fn can_create_config(tier: TenantTier, config_count: i32, quotas: &TierQuotas) -> Decision {
    match tier {
        TenantTier::Admin | TenantTier::Paid => Decision::Allowed,
        TenantTier::Free if config_count < quotas.free_max_configs => Decision::Allowed,
        TenantTier::Free => Decision::denied(format!(
            "free tier is limited to {} configs; upgrade to create more",
            quotas.free_max_configs
        )),
    }
}

/// Can the tenant start another aggregation run today?
///
/// Free tier is gated twice: per config by the `runs_today` counter, and
/// per tenant by the `free_run_used_at` stamp, so owning several configs
/// does not multiply the daily allowance.
pub fn can_run_aggregation(
    tier: TenantTier,
    runs_today: DailyCounter,
    free_run_used_at: Option<DateTime<Utc>>,
    today: NaiveDate,
    quotas: &TierQuotas,
) -> Decision {
    match tier {
        TenantTier::Admin | TenantTier::Paid => Decision::Allowed,
        TenantTier::Free => {
            if free_run_used_at.is_some_and(|used_at| used_at.date_naive() >= today) {
                return Decision::denied(
                    "daily free run already used; upgrade for unlimited runs",
                );
            }
            if runs_today.effective(today) < i64::from(quotas.free_max_runs_per_day) {
                Decision::Allowed
            } else {
                Decision::denied(format!(
                    "daily run limit of {} reached; upgrade for unlimited runs",
                    quotas.free_max_runs_per_day
                ))
            }
        }
    }
}

/// Can the tenant make platform AI calls right now?
///
/// Paid tier needs headroom in BOTH the daily token budget and the daily
/// cost budget. Free tier is unlimited here since its constraint is the run
/// ceiling instead.
pub fn can_use_platform_ai(
    tier: TenantTier,
    usage: &AiUsage,
    today: NaiveDate,
    quotas: &TierQuotas,
) -> Decision {
    match tier {
        TenantTier::Admin | TenantTier::Free => Decision::Allowed,
        TenantTier::Paid => {
            if usage.tokens.effective(today) >= quotas.paid_daily_token_budget {
                Decision::denied("daily token budget exhausted")
            } else if usage.cost_cents.effective(today) >= quotas.paid_daily_cost_cents_budget {
                Decision::denied("daily AI cost budget exhausted")
            } else {
                Decision::Allowed
            }
        }
    }
}

/// Can the tenant generate summaries? Free tier cannot at all; paid tier
/// follows the same dual-budget rule as [`can_use_platform_ai`].
pub fn can_generate(
    tier: TenantTier,
    usage: &AiUsage,
    today: NaiveDate,
    quotas: &TierQuotas,
) -> Decision {
    match tier {
        TenantTier::Admin => Decision::Allowed,
        TenantTier::Free => {
            Decision::denied("summary generation requires a paid subscription")
        }
        TenantTier::Paid => can_use_platform_ai(tier, usage, today, quotas),
    }
}

/// Database-backed gate combining counter reads with the pure decisions.
#[derive(Debug, Clone)]
pub struct QuotaGate {
    pool: PgPool,
    quotas: TierQuotas,
}

impl QuotaGate {
    /// Create a gate over the given pool with the configured ceilings.
    pub fn new(pool: PgPool, quotas: TierQuotas) -> Self {
        Self { pool, quotas }
    }

    async fn tenant(&self, tenant_id: Uuid) -> Result<Tenant, QuotaError> {
        sqlx::query_as::<_, Tenant>(
            r"
            SELECT id, tier, wallet_address, config_count, free_run_used_at,
                   ai_calls_today, ai_calls_reset_at, tokens_used_today, tokens_reset_at,
                   cost_today_cents, cost_reset_at, created_at
            FROM tenants
            WHERE id = $1
            ",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(QuotaError::NotFound(tenant_id))
    }

    /// Check whether the tenant may create another config.
    pub async fn can_create_config(&self, tenant_id: Uuid) -> Result<Decision, QuotaError> {
        let tenant = self.tenant(tenant_id).await?;
        Ok(can_create_config(
            tenant.tier,
            tenant.config_count,
            &self.quotas,
        ))
    }

    /// Check whether the tenant may run the given config today.
    pub async fn can_run_aggregation(
        &self,
        tenant_id: Uuid,
        config_id: Uuid,
    ) -> Result<Decision, QuotaError> {
        let tenant = self.tenant(tenant_id).await?;

        let counters = sqlx::query_as::<_, (i32, NaiveDate)>(
            "SELECT runs_today, runs_today_reset_at FROM aggregation_configs WHERE id = $1",
        )
        .bind(config_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(QuotaError::NotFound(config_id))?;

        let runs_today = DailyCounter {
            value: i64::from(counters.0),
            reset_at: counters.1,
        };
        Ok(can_run_aggregation(
            tenant.tier,
            runs_today,
            tenant.free_run_used_at,
            Utc::now().date_naive(),
            &self.quotas,
        ))
    }

    /// Check whether the tenant may make platform AI calls.
    pub async fn can_use_platform_ai(&self, tenant_id: Uuid) -> Result<Decision, QuotaError> {
        let tenant = self.tenant(tenant_id).await?;
        Ok(can_use_platform_ai(
            tenant.tier,
            &AiUsage::from_tenant(&tenant),
            Utc::now().date_naive(),
            &self.quotas,
        ))
    }

    /// Check whether the tenant may generate summaries.
    pub async fn can_generate(&self, tenant_id: Uuid) -> Result<Decision, QuotaError> {
        let tenant = self.tenant(tenant_id).await?;
        Ok(can_generate(
            tenant.tier,
            &AiUsage::from_tenant(&tenant),
            Utc::now().date_naive(),
            &self.quotas,
        ))
    }

    /// Count one run against the config's daily counter.
    ///
    /// Reset-if-stale and increment happen in one conditional UPDATE, so a
    /// racing reader can never observe the reset without the increment.
    /// Returns the post-increment count.
    #[instrument(skip(self))]
    pub async fn record_run(&self, config_id: Uuid) -> Result<i32, QuotaError> {
        sqlx::query_scalar::<_, i32>(
            r"
            UPDATE aggregation_configs
            SET runs_today = CASE WHEN runs_today_reset_at < CURRENT_DATE
                                  THEN 1 ELSE runs_today + 1 END,
                runs_today_reset_at = CURRENT_DATE
            WHERE id = $1
            RETURNING runs_today
            ",
        )
        .bind(config_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(QuotaError::NotFound(config_id))
    }

    /// Stamp the free tier's daily free run. While the stamp is from today,
    /// [`Self::can_run_aggregation`] denies further free-tier runs for the
    /// tenant across all of their configs.
    pub async fn mark_free_run_used(&self, tenant_id: Uuid) -> Result<(), QuotaError> {
        sqlx::query("UPDATE tenants SET free_run_used_at = NOW() WHERE id = $1")
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fold a run's token usage into the tenant's daily counters. These are
    /// shared across concurrently running jobs, so each counter uses the
    /// same reset-if-stale-then-increment shape as [`Self::record_run`].
    #[instrument(skip(self, usage))]
    pub async fn record_ai_usage(
        &self,
        tenant_id: Uuid,
        usage: &TokenUsage,
    ) -> Result<(), QuotaError> {
        let tokens = usage.prompt_tokens + usage.completion_tokens;
        let cost_cents = (usage.estimated_cost_usd * 100.0).round() as i64;
        let updated = sqlx::query(
            r"
            UPDATE tenants
            SET ai_calls_today = CASE WHEN ai_calls_reset_at < CURRENT_DATE
                                      THEN $2 ELSE ai_calls_today + $2 END,
                ai_calls_reset_at = CURRENT_DATE,
                tokens_used_today = CASE WHEN tokens_reset_at < CURRENT_DATE
                                         THEN $3 ELSE tokens_used_today + $3 END,
                tokens_reset_at = CURRENT_DATE,
                cost_today_cents = CASE WHEN cost_reset_at < CURRENT_DATE
                                        THEN $4 ELSE cost_today_cents + $4 END,
                cost_reset_at = CURRENT_DATE
            WHERE id = $1
            ",
        )
        .bind(tenant_id)
        .bind(usage.ai_calls)
        .bind(tokens)
        .bind(cost_cents)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(QuotaError::NotFound(tenant_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn quotas() -> TierQuotas {
        TierQuotas::default()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn usage(tokens: i64, cost_cents: i64, reset_at: NaiveDate) -> AiUsage {
        AiUsage {
            ai_calls: DailyCounter { value: 0, reset_at },
            tokens: DailyCounter {
                value: tokens,
                reset_at,
            },
            cost_cents: DailyCounter {
                value: cost_cents,
                reset_at,
            },
        }
    }

    #[test]
    fn free_tier_config_ceiling() {
        let q = quotas();
        assert!(can_create_config(TenantTier::Free, 2, &q).is_allowed());
        assert!(!can_create_config(TenantTier::Free, 3, &q).is_allowed());
        assert!(can_create_config(TenantTier::Paid, 1000, &q).is_allowed());
        assert!(can_create_config(TenantTier::Admin, 1000, &q).is_allowed());
    }

    #[test]
    fn second_free_run_same_day_is_denied_with_upgrade_reason() {
        let q = quotas();
        let today = day(2025, 6, 1);
        let fresh = DailyCounter {
            value: 0,
            reset_at: today,
        };
        assert!(can_run_aggregation(TenantTier::Free, fresh, None, today, &q).is_allowed());

        let after_one_run = DailyCounter {
            value: 1,
            reset_at: today,
        };
        match can_run_aggregation(TenantTier::Free, after_one_run, None, today, &q) {
            Decision::Denied { reason } => assert!(reason.contains("upgrade")),
            Decision::Allowed => panic!("second free run should be denied"),
        }
    }

    #[test]
    fn free_run_stamp_blocks_further_runs_that_day() {
        let q = quotas();
        let today = day(2025, 6, 1);
        let fresh = DailyCounter {
            value: 0,
            reset_at: today,
        };

        // A same-day stamp denies even a config whose own counter is fresh,
        // so a second config is not a second free run.
        let used_today = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        match can_run_aggregation(TenantTier::Free, fresh, Some(used_today), today, &q) {
            Decision::Denied { reason } => assert!(reason.contains("upgrade")),
            Decision::Allowed => panic!("stamped free run should be denied"),
        }

        // Yesterday's stamp has expired.
        let used_yesterday = Utc.with_ymd_and_hms(2025, 5, 31, 9, 0, 0).unwrap();
        assert!(
            can_run_aggregation(TenantTier::Free, fresh, Some(used_yesterday), today, &q)
                .is_allowed()
        );
    }

    #[test]
    fn stale_counter_resets_before_compare() {
        let q = quotas();
        let today = day(2025, 6, 2);
        // Exhausted yesterday, but yesterday's counter no longer counts.
        let stale = DailyCounter {
            value: 5,
            reset_at: day(2025, 6, 1),
        };
        assert_eq!(stale.effective(today), 0);
        assert!(can_run_aggregation(TenantTier::Free, stale, None, today, &q).is_allowed());
    }

    #[test]
    fn paid_runs_are_unlimited() {
        let q = quotas();
        let today = day(2025, 6, 1);
        let heavy = DailyCounter {
            value: 10_000,
            reset_at: today,
        };
        assert!(can_run_aggregation(TenantTier::Paid, heavy, None, today, &q).is_allowed());
    }

    #[test]
    fn paid_ai_needs_headroom_in_both_budgets() {
        let q = quotas();
        let today = day(2025, 6, 1);

        let ok = usage(100, 10, today);
        assert!(can_use_platform_ai(TenantTier::Paid, &ok, today, &q).is_allowed());

        let tokens_gone = usage(q.paid_daily_token_budget, 10, today);
        assert!(!can_use_platform_ai(TenantTier::Paid, &tokens_gone, today, &q).is_allowed());

        let cost_gone = usage(100, q.paid_daily_cost_cents_budget, today);
        assert!(!can_use_platform_ai(TenantTier::Paid, &cost_gone, today, &q).is_allowed());
    }

    #[test]
    fn free_tier_ai_calls_are_not_budget_gated() {
        let q = quotas();
        let today = day(2025, 6, 1);
        let heavy = usage(i64::MAX / 2, i64::MAX / 2, today);
        assert!(can_use_platform_ai(TenantTier::Free, &heavy, today, &q).is_allowed());
    }

    #[test]
    fn free_tier_cannot_generate_summaries() {
        let q = quotas();
        let today = day(2025, 6, 1);
        let idle = usage(0, 0, today);
        assert!(!can_generate(TenantTier::Free, &idle, today, &q).is_allowed());
        assert!(can_generate(TenantTier::Paid, &idle, today, &q).is_allowed());
        assert!(can_generate(TenantTier::Admin, &idle, today, &q).is_allowed());
    }

    #[test]
    fn stale_paid_budgets_reset_on_read() {
        let q = quotas();
        let today = day(2025, 6, 2);
        let exhausted_yesterday = usage(
            q.paid_daily_token_budget,
            q.paid_daily_cost_cents_budget,
            day(2025, 6, 1),
        );
        assert!(can_use_platform_ai(TenantTier::Paid, &exhausted_yesterday, today, &q).is_allowed());
    }
}
