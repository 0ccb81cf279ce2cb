//! The License Gate: a recurring compliance sweep that re-verifies the
//! subscription backing every running continuous job and force-stops the
//! non-compliant ones, plus the daily pruning of terminal job history.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::context::{License, LicenseService, OrchestratorContext};
use crate::errors::EnqueueError;
use crate::job_store::JobStore;
use crate::policy::Schedule;
use crate::queue_job::{QueueJob, remove_repeatable};
use crate::retention::RetentionSweep;
use crate::schema::TenantTier;

/// A short-TTL cache over a [`LicenseService`], bounding external
/// verification calls when many jobs belong to the same tenant.
pub struct CachedLicenseVerifier {
    inner: Arc<dyn LicenseService>,
    ttl: Duration,
    cache: Mutex<HashMap<String, (License, Instant)>>,
}

impl CachedLicenseVerifier {
    /// Wrap a license service with the given cache TTL.
    pub fn new(inner: Arc<dyn LicenseService>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl LicenseService for CachedLicenseVerifier {
    async fn verify(&self, wallet_address: &str) -> anyhow::Result<License> {
        {
            let cache = self.cache.lock().await;
            if let Some((license, cached_at)) = cache.get(wallet_address) {
                if cached_at.elapsed() < self.ttl {
                    return Ok(license.clone());
                }
            }
        }

        let license = self.inner.verify(wallet_address).await?;
        let mut cache = self.cache.lock().await;
        cache.insert(wallet_address.to_string(), (license.clone(), Instant::now()));
        Ok(license)
    }
}

/// Register the recurring maintenance schedules: the hourly license sweep,
/// the hourly retention sweep and the daily terminal-job pruning.
///
/// Registrations are keyed upserts, so calling this on every process start
/// is safe.
pub async fn install_maintenance_schedules(
    pool: &PgPool,
    config: &OrchestratorConfig,
) -> Result<(), EnqueueError> {
    LicenseSweep
        .register_repeatable(
            pool,
            "maintenance:license-sweep",
            Schedule::cron(config.license.sweep_schedule.clone()),
        )
        .await?;
    RetentionSweep
        .register_repeatable(
            pool,
            "maintenance:retention-sweep",
            Schedule::every(Duration::from_secs(
                config.retention.resweep_after_secs.max(60) as u64,
            )),
        )
        .await?;
    PruneJobs
        .register_repeatable(
            pool,
            "maintenance:prune-jobs",
            Schedule::cron(config.pruning.schedule.clone()),
        )
        .await?;
    Ok(())
}

/// Audit every running continuous job against the license service and
/// force-stop the ones whose subscription lapsed.
#[derive(Debug, Serialize, Deserialize)]
pub struct LicenseSweep;

impl QueueJob for LicenseSweep {
    const JOB_TYPE: &'static str = "license_sweep";
    const DEDUPLICATED: bool = true;

    type Context = OrchestratorContext;

    #[instrument(name = "license.sweep", skip_all)]
    async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
        let store = JobStore::new(ctx.pool.clone());
        let verifier = CachedLicenseVerifier::new(
            ctx.license.clone(),
            Duration::from_secs(ctx.config.license.verification_ttl_secs),
        );

        let jobs = store.running_continuous_jobs().await?;
        for job in jobs {
            let tenant = sqlx::query_as::<_, (TenantTier, Option<String>)>(
                "SELECT tier, wallet_address FROM tenants WHERE id = $1",
            )
            .bind(job.tenant_id)
            .fetch_optional(&ctx.pool)
            .await?;

            let Some((tier, wallet)) = tenant else {
                warn!(job.id = %job.id, tenant.id = %job.tenant_id, "Tenant row missing, skipping");
                continue;
            };
            if tier == TenantTier::Admin {
                continue;
            }

            let is_active = match wallet.as_deref() {
                // No wallet means no verifiable subscription.
                None => false,
                Some(wallet) => match verifier.verify(wallet).await {
                    Ok(license) => license.is_active,
                    Err(error) => {
                        // Fail open: a flaky license upstream must not stop
                        // paid work.
                        warn!(job.id = %job.id, %error, "License verification failed, skipping");
                        continue;
                    }
                },
            };

            if !is_active {
                stop_for_expired_license(&ctx.pool, &store, job.id, job.config_id).await?;
            }
        }

        Ok(())
    }
}

async fn stop_for_expired_license(
    pool: &PgPool,
    store: &JobStore,
    job_id: Uuid,
    config_id: Uuid,
) -> anyhow::Result<()> {
    remove_repeatable(pool, &crate::aggregation::repeatable_key(config_id)).await?;
    store.stop_job_for_expired_license(job_id).await?;
    info!(job.id = %job_id, config.id = %config_id, "Stopped continuous job: license expired");
    Ok(())
}

/// Daily pruning of terminal job history, bounding storage growth.
#[derive(Debug, Serialize, Deserialize)]
pub struct PruneJobs;

impl QueueJob for PruneJobs {
    const JOB_TYPE: &'static str = "prune_jobs";
    const DEDUPLICATED: bool = true;

    type Context = OrchestratorContext;

    #[instrument(name = "license.prune_jobs", skip_all)]
    async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
        let store = JobStore::new(ctx.pool.clone());
        let pruned = store
            .prune_terminal_jobs(ctx.config.pruning.job_retention_days)
            .await?;
        if pruned > 0 {
            info!("Pruned {pruned} terminal aggregation job(s)");
        }
        Ok(())
    }
}
