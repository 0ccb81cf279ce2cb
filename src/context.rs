//! Collaborator seams and the dependency-injection context.
//!
//! The orchestration core treats the pipeline itself, secret/storage
//! resolution and license verification as opaque collaborators behind these
//! traits. Everything a job needs at runtime travels in one cloneable
//! [`OrchestratorContext`], so there are no process-wide singletons.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::schema::RetentionDataType;

/// Token and cost deltas reported by one pipeline run.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    /// Prompt tokens consumed.
    pub prompt_tokens: i64,
    /// Completion tokens consumed.
    pub completion_tokens: i64,
    /// LLM calls made.
    pub ai_calls: i64,
    /// Estimated spend in USD.
    pub estimated_cost_usd: f64,
}

/// A payload the pipeline produced but could not commit to the tenant's
/// external storage. The worker persists these as retention items.
#[derive(Debug, Clone)]
pub struct UnstoredPayload {
    /// Items or summary.
    pub data_type: RetentionDataType,
    /// Opaque payload matching `data_type`.
    pub data: Value,
}

/// Result of one pipeline run or tick.
#[derive(Debug, Clone, Default)]
pub struct PipelineOutcome {
    /// Items fetched from sources this run.
    pub items_fetched: i64,
    /// Items enriched and stored this run.
    pub items_processed: i64,
    /// Token/cost accounting for this run.
    pub token_usage: TokenUsage,
    /// Writes that failed against external storage and need deferred replay.
    pub unstored: Vec<UnstoredPayload>,
}

/// Handle to a tenant's external storage target.
#[async_trait]
pub trait ExternalStore: Send + Sync {
    /// Store one aggregated item.
    async fn store_item(&self, config_id: Uuid, item: &Value) -> anyhow::Result<()>;

    /// Store a single summary document.
    async fn store_summary(&self, config_id: Uuid, summary: &Value) -> anyhow::Result<()>;
}

/// Decrypted secrets and resolved storage for one config.
pub struct ResolvedConfig {
    /// Decrypted plugin secrets, opaque to this core.
    pub secrets: Value,
    /// Where results are committed.
    pub storage: Arc<dyn ExternalStore>,
    /// Whether `storage` is tenant-owned (retention applies) rather than
    /// platform-hosted.
    pub uses_external_storage: bool,
}

/// Resolves a config's secrets and storage handle.
#[async_trait]
pub trait ConfigResolver: Send + Sync {
    /// Resolve the decrypted secrets and storage target for a config.
    async fn resolve(&self, config_id: Uuid) -> anyhow::Result<ResolvedConfig>;
}

/// Options passed through to the pipeline for one run.
pub struct PipelineRunOptions {
    /// The aggregation job this run belongs to.
    pub job_id: Uuid,
    /// Whether this is a continuous tick rather than a one-time run.
    pub tick: bool,
    /// Cooperative cancellation. The pipeline is contractually required to
    /// poll this at its I/O boundaries; there is no forcible interruption.
    pub cancel: CancellationToken,
}

/// The external collaborator that performs the actual fetch/enrich/store
/// work. Opaque to this core.
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    /// Run the pipeline once for the given config.
    async fn run(
        &self,
        config_id: Uuid,
        secrets: &Value,
        storage: Arc<dyn ExternalStore>,
        options: &PipelineRunOptions,
    ) -> anyhow::Result<PipelineOutcome>;
}

/// A subscription license verification result.
#[derive(Debug, Clone)]
pub struct License {
    /// Whether the subscription is currently active.
    pub is_active: bool,
    /// When the subscription expires, if known.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Verifies the cryptographic subscription backing a tenant.
#[async_trait]
pub trait LicenseService: Send + Sync {
    /// Verify the license for a wallet address.
    async fn verify(&self, wallet_address: &str) -> anyhow::Result<License>;
}

/// Everything a queue job needs at runtime, cloned into each worker.
#[derive(Clone)]
pub struct OrchestratorContext {
    /// Shared database pool (job store, retention items, quota counters).
    pub pool: PgPool,
    /// Environment-level configuration.
    pub config: Arc<OrchestratorConfig>,
    /// The pipeline collaborator.
    pub pipeline: Arc<dyn PipelineRunner>,
    /// Secret/storage resolution collaborator.
    pub resolver: Arc<dyn ConfigResolver>,
    /// License verification collaborator (uncached; see
    /// [`CachedLicenseVerifier`](crate::license::CachedLicenseVerifier)).
    pub license: Arc<dyn LicenseService>,
}

impl std::fmt::Debug for OrchestratorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorContext").finish_non_exhaustive()
    }
}
