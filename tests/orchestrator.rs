#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use aggworkers::context::{
    ConfigResolver, ExternalStore, License, LicenseService, OrchestratorContext, PipelineOutcome,
    PipelineRunOptions, PipelineRunner, ResolvedConfig, TokenUsage, UnstoredPayload,
};
use aggworkers::schema::{AggregationJobStatus, RetentionDataType};
use aggworkers::{
    Decision, JobStore, JobStoreError, LICENSE_EXPIRED_MESSAGE, OrchestratorConfig, QueueJob,
    QuotaGate, RetentionStore, aggregation, license, retention, setup_database,
};
use async_trait::async_trait;
use claims::{assert_err, assert_matches, assert_none, assert_ok, assert_some};
use serde_json::{Value, json};
use sqlx::PgPool;
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
    let postgres_image = Postgres::default();
    let container = postgres_image.start().await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

    let pool = PgPool::connect(&connection_string).await?;
    setup_database(&pool).await?;

    Ok((pool, container))
}

/// Programmable pipeline: pops queued results in order, then falls back to
/// an empty successful outcome.
#[derive(Default)]
struct FakePipeline {
    results: Mutex<VecDeque<Result<PipelineOutcome, String>>>,
    calls: AtomicUsize,
}

impl FakePipeline {
    async fn push_ok(&self, outcome: PipelineOutcome) {
        self.results.lock().await.push_back(Ok(outcome));
    }

    async fn push_err(&self, message: &str) {
        self.results.lock().await.push_back(Err(message.to_string()));
    }
}

#[async_trait]
impl PipelineRunner for FakePipeline {
    async fn run(
        &self,
        _config_id: Uuid,
        _secrets: &Value,
        _storage: Arc<dyn ExternalStore>,
        _options: &PipelineRunOptions,
    ) -> anyhow::Result<PipelineOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.results.lock().await.pop_front() {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(message)) => Err(anyhow::anyhow!(message)),
            None => Ok(PipelineOutcome::default()),
        }
    }
}

/// External storage double with a failure toggle and call recording.
#[derive(Default)]
struct FakeStore {
    fail: AtomicBool,
    items: Mutex<Vec<Value>>,
    summaries: Mutex<Vec<Value>>,
}

#[async_trait]
impl ExternalStore for FakeStore {
    async fn store_item(&self, _config_id: Uuid, item: &Value) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused by external database");
        }
        self.items.lock().await.push(item.clone());
        Ok(())
    }

    async fn store_summary(&self, _config_id: Uuid, summary: &Value) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused by external database");
        }
        self.summaries.lock().await.push(summary.clone());
        Ok(())
    }
}

struct FakeResolver {
    storage: Arc<FakeStore>,
}

#[async_trait]
impl ConfigResolver for FakeResolver {
    async fn resolve(&self, _config_id: Uuid) -> anyhow::Result<ResolvedConfig> {
        Ok(ResolvedConfig {
            secrets: json!({}),
            storage: self.storage.clone(),
            uses_external_storage: true,
        })
    }
}

enum LicenseMode {
    Active,
    Inactive,
    Error,
}

struct FakeLicense {
    mode: Mutex<LicenseMode>,
    calls: AtomicUsize,
}

impl FakeLicense {
    fn new(mode: LicenseMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            calls: AtomicUsize::new(0),
        }
    }

    async fn set_mode(&self, mode: LicenseMode) {
        *self.mode.lock().await = mode;
    }
}

#[async_trait]
impl LicenseService for FakeLicense {
    async fn verify(&self, _wallet_address: &str) -> anyhow::Result<License> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match *self.mode.lock().await {
            LicenseMode::Active => Ok(License {
                is_active: true,
                expires_at: None,
            }),
            LicenseMode::Inactive => Ok(License {
                is_active: false,
                expires_at: None,
            }),
            LicenseMode::Error => anyhow::bail!("license upstream unavailable"),
        }
    }
}

struct Fakes {
    pipeline: Arc<FakePipeline>,
    storage: Arc<FakeStore>,
    license: Arc<FakeLicense>,
}

fn build_context(pool: PgPool) -> (OrchestratorContext, Fakes) {
    let pipeline = Arc::new(FakePipeline::default());
    let storage = Arc::new(FakeStore::default());
    let license = Arc::new(FakeLicense::new(LicenseMode::Active));

    let ctx = OrchestratorContext {
        pool,
        config: Arc::new(OrchestratorConfig::default()),
        pipeline: pipeline.clone(),
        resolver: Arc::new(FakeResolver {
            storage: storage.clone(),
        }),
        license: license.clone(),
    };
    let fakes = Fakes {
        pipeline,
        storage,
        license,
    };
    (ctx, fakes)
}

async fn seed_tenant(pool: &PgPool, tier: &str, wallet: Option<&str>) -> anyhow::Result<Uuid> {
    let id = Uuid::now_v7();
    sqlx::query("INSERT INTO tenants (id, tier, wallet_address) VALUES ($1, $2::tenant_tier, $3)")
        .bind(id)
        .bind(tier)
        .bind(wallet)
        .execute(pool)
        .await?;
    Ok(id)
}

async fn seed_config(
    pool: &PgPool,
    tenant_id: Uuid,
    uses_external_storage: bool,
) -> anyhow::Result<Uuid> {
    let id = Uuid::now_v7();
    sqlx::query(
        r"
        INSERT INTO aggregation_configs (id, tenant_id, name, uses_external_storage)
        VALUES ($1, $2, 'test config', $3)
        ",
    )
    .bind(id)
    .bind(tenant_id)
    .bind(uses_external_storage)
    .execute(pool)
    .await?;
    Ok(id)
}

fn outcome(fetched: i64, processed: i64) -> PipelineOutcome {
    PipelineOutcome {
        items_fetched: fetched,
        items_processed: processed,
        token_usage: TokenUsage::default(),
        unstored: Vec::new(),
    }
}

#[tokio::test]
async fn only_one_continuous_job_per_config() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let tenant_id = seed_tenant(&pool, "paid", Some("0xabc")).await?;
    let config_id = seed_config(&pool, tenant_id, false).await?;

    let store = JobStore::new(pool.clone());
    let first = assert_ok!(store.create_continuous_job(config_id, tenant_id, 300).await);

    let second = assert_err!(store.create_continuous_job(config_id, tenant_id, 300).await);
    assert_matches!(second, JobStoreError::AlreadyRunning(id) if id == config_id);

    // Stopping the first releases the pointer, so a new one can start.
    store.cancel_job(first.id).await?;
    assert_ok!(store.create_continuous_job(config_id, tenant_id, 300).await);

    Ok(())
}

#[tokio::test]
async fn one_time_jobs_never_touch_the_active_pointer() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let tenant_id = seed_tenant(&pool, "paid", None).await?;
    let config_id = seed_config(&pool, tenant_id, false).await?;

    let store = JobStore::new(pool.clone());
    let continuous = store.create_continuous_job(config_id, tenant_id, 300).await?;

    // A one-time run coexists with the running continuous job.
    let one_time = assert_ok!(store.create_one_time_job(config_id, tenant_id).await);
    store.complete_job(one_time.id).await?;

    // The pointer still belongs to the continuous job.
    let config = assert_some!(store.get_config(config_id).await?);
    assert_eq!(config.active_job_id, Some(continuous.id));

    Ok(())
}

#[tokio::test]
async fn continuous_ticks_accumulate_monotone_counters() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let (ctx, fakes) = build_context(pool.clone());
    let tenant_id = seed_tenant(&pool, "paid", Some("0xabc")).await?;
    let config_id = seed_config(&pool, tenant_id, false).await?;

    let store = JobStore::new(pool.clone());
    let job = store.create_continuous_job(config_id, tenant_id, 300).await?;

    // Three ticks: one productive, one empty, one productive.
    for fetched in [5, 0, 3] {
        fakes.pipeline.push_ok(outcome(fetched, fetched)).await;
        let tick = aggregation::RunAggregation {
            job_id: job.id,
            config_id,
            tick: true,
        };
        assert_ok!(tick.run(ctx.clone()).await);
    }

    let job = assert_some!(store.get_job(job.id).await?);
    assert_eq!(job.items_fetched, 8);
    assert_eq!(job.items_processed, 8);
    assert_eq!(job.run_count, 3);
    // Still running: ticks never complete a continuous job.
    assert_eq!(job.status, AggregationJobStatus::Running);
    assert_some!(job.last_fetch_at);

    let config = assert_some!(store.get_config(config_id).await?);
    assert_some!(config.last_run_at);

    Ok(())
}

#[tokio::test]
async fn one_time_run_completes_and_records_usage() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let (ctx, fakes) = build_context(pool.clone());
    let tenant_id = seed_tenant(&pool, "paid", Some("0xabc")).await?;
    let config_id = seed_config(&pool, tenant_id, false).await?;

    fakes
        .pipeline
        .push_ok(PipelineOutcome {
            items_fetched: 4,
            items_processed: 4,
            token_usage: TokenUsage {
                prompt_tokens: 900,
                completion_tokens: 100,
                ai_calls: 2,
                estimated_cost_usd: 0.25,
            },
            unstored: Vec::new(),
        })
        .await;

    let job = aggregation::start_one_time(&pool, config_id, tenant_id).await?;
    let run = aggregation::RunAggregation {
        job_id: job.id,
        config_id,
        tick: false,
    };
    assert_ok!(run.run(ctx).await);

    let store = JobStore::new(pool.clone());
    let job = assert_some!(store.get_job(job.id).await?);
    assert_eq!(job.status, AggregationJobStatus::Completed);
    assert_eq!(job.items_fetched, 4);
    assert_eq!(job.run_count, 0);
    assert_some!(job.completed_at);
    let logs = assert_some!(job.logs.as_array());
    assert!(!logs.is_empty());

    // Token usage landed on the tenant's daily counters.
    let (tokens, calls, cost_cents) = sqlx::query_as::<_, (i64, i64, i64)>(
        "SELECT tokens_used_today, ai_calls_today, cost_today_cents FROM tenants WHERE id = $1",
    )
    .bind(tenant_id)
    .fetch_one(&pool)
    .await?;
    assert_eq!(tokens, 1000);
    assert_eq!(calls, 2);
    assert_eq!(cost_cents, 25);

    let config = assert_some!(store.get_config(config_id).await?);
    assert_none!(config.active_job_id);
    assert_some!(config.last_run_duration_ms);

    Ok(())
}

#[tokio::test]
async fn pipeline_failure_records_the_error_verbatim() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let (ctx, fakes) = build_context(pool.clone());
    let tenant_id = seed_tenant(&pool, "paid", None).await?;
    let config_id = seed_config(&pool, tenant_id, false).await?;

    fakes.pipeline.push_err("upstream rate limited the fetch").await;

    let job = aggregation::start_one_time(&pool, config_id, tenant_id).await?;
    let run = aggregation::RunAggregation {
        job_id: job.id,
        config_id,
        tick: false,
    };
    assert_err!(run.run(ctx).await);

    let store = JobStore::new(pool.clone());
    let job = assert_some!(store.get_job(job.id).await?);
    assert_eq!(job.status, AggregationJobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some("upstream rate limited the fetch"));

    // The failure propagated onto the owning config.
    let config = assert_some!(store.get_config(config_id).await?);
    assert_eq!(config.last_error.as_deref(), Some("upstream rate limited the fetch"));
    assert_none!(config.active_job_id);

    Ok(())
}

#[tokio::test]
async fn cancelled_job_is_not_run_and_stays_cancelled() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let (ctx, fakes) = build_context(pool.clone());
    let tenant_id = seed_tenant(&pool, "paid", None).await?;
    let config_id = seed_config(&pool, tenant_id, false).await?;

    let job = aggregation::start_one_time(&pool, config_id, tenant_id).await?;
    aggregation::stop_job(&pool, job.id).await?;

    let run = aggregation::RunAggregation {
        job_id: job.id,
        config_id,
        tick: false,
    };
    assert_ok!(run.run(ctx).await);

    // The pipeline was never invoked; terminal states are final.
    assert_eq!(fakes.pipeline.calls.load(Ordering::SeqCst), 0);
    let store = JobStore::new(pool.clone());
    let job = assert_some!(store.get_job(job.id).await?);
    assert_eq!(job.status, AggregationJobStatus::Cancelled);
    // A plain cancellation records no message.
    assert_none!(job.error_message);

    Ok(())
}

#[tokio::test]
async fn cancelling_a_job_mid_run_trips_the_token_and_discards_completion() -> anyhow::Result<()> {
    struct BlockingPipeline {
        started: Arc<Notify>,
        observed_cancel: AtomicBool,
    }

    #[async_trait]
    impl PipelineRunner for BlockingPipeline {
        async fn run(
            &self,
            _config_id: Uuid,
            _secrets: &Value,
            _storage: Arc<dyn ExternalStore>,
            options: &PipelineRunOptions,
        ) -> anyhow::Result<PipelineOutcome> {
            self.started.notify_one();
            // Block at an I/O boundary until the cancellation token fires.
            options.cancel.cancelled().await;
            self.observed_cancel.store(true, Ordering::SeqCst);
            Ok(outcome(7, 7))
        }
    }

    let (pool, _container) = setup_test_db().await?;

    let started = Arc::new(Notify::new());
    let pipeline = Arc::new(BlockingPipeline {
        started: started.clone(),
        observed_cancel: AtomicBool::new(false),
    });
    let ctx = OrchestratorContext {
        pool: pool.clone(),
        config: Arc::new(OrchestratorConfig::default()),
        pipeline: pipeline.clone(),
        resolver: Arc::new(FakeResolver {
            storage: Arc::new(FakeStore::default()),
        }),
        license: Arc::new(FakeLicense::new(LicenseMode::Active)),
    };

    let tenant_id = seed_tenant(&pool, "paid", None).await?;
    let config_id = seed_config(&pool, tenant_id, false).await?;
    let job = aggregation::start_one_time(&pool, config_id, tenant_id).await?;
    let job_id = job.id;

    let run = aggregation::RunAggregation {
        job_id,
        config_id,
        tick: false,
    };
    let task = tokio::spawn(async move { run.run(ctx).await });

    // Cancel only once the pipeline is actually in flight.
    started.notified().await;
    aggregation::stop_job(&pool, job_id).await?;

    // The watcher polls the job store every few seconds and trips the
    // token; the run returns without recording a completion.
    let result = tokio::time::timeout(Duration::from_secs(30), task).await??;
    assert_ok!(result);
    assert!(pipeline.observed_cancel.load(Ordering::SeqCst));

    let store = JobStore::new(pool.clone());
    let job = assert_some!(store.get_job(job_id).await?);
    assert_eq!(job.status, AggregationJobStatus::Cancelled);
    assert_none!(job.error_message);
    // The late pipeline outcome was discarded.
    assert_eq!(job.items_fetched, 0);
    assert_eq!(job.items_processed, 0);

    Ok(())
}

#[tokio::test]
async fn starting_a_one_time_run_enqueues_a_broker_job() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let tenant_id = seed_tenant(&pool, "paid", None).await?;
    let config_id = seed_config(&pool, tenant_id, false).await?;

    aggregation::start_one_time(&pool, config_id, tenant_id).await?;

    let (queue, job_type) = sqlx::query_as::<_, (String, String)>(
        "SELECT queue, job_type FROM queue_jobs",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(queue, aggworkers::AGGREGATION_QUEUE);
    assert_eq!(job_type, "run_aggregation");

    Ok(())
}

#[tokio::test]
async fn stopping_a_continuous_job_removes_its_schedule() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let tenant_id = seed_tenant(&pool, "paid", None).await?;
    let config_id = seed_config(&pool, tenant_id, false).await?;

    let job = aggregation::start_continuous(&pool, config_id, tenant_id, 300).await?;

    let registrations = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM repeatable_jobs")
        .fetch_one(&pool)
        .await?;
    assert_eq!(registrations, 1);

    aggregation::stop_job(&pool, job.id).await?;

    let registrations = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM repeatable_jobs")
        .fetch_one(&pool)
        .await?;
    assert_eq!(registrations, 0);

    let store = JobStore::new(pool.clone());
    let config = assert_some!(store.get_config(config_id).await?);
    assert_none!(config.active_job_id);

    Ok(())
}

#[tokio::test]
async fn unstored_payloads_become_retention_items() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let (ctx, fakes) = build_context(pool.clone());
    let tenant_id = seed_tenant(&pool, "paid", None).await?;
    let config_id = seed_config(&pool, tenant_id, true).await?;

    fakes
        .pipeline
        .push_ok(PipelineOutcome {
            items_fetched: 2,
            items_processed: 0,
            token_usage: TokenUsage::default(),
            unstored: vec![UnstoredPayload {
                data_type: RetentionDataType::Items,
                data: json!([{"title": "a"}, {"title": "b"}]),
            }],
        })
        .await;

    let job = aggregation::start_one_time(&pool, config_id, tenant_id).await?;
    let run = aggregation::RunAggregation {
        job_id: job.id,
        config_id,
        tick: false,
    };
    assert_ok!(run.run(ctx).await);

    // The run still completes; the deferred write lives on as an item
    // plus a queued replay.
    let store = JobStore::new(pool.clone());
    let job = assert_some!(store.get_job(job.id).await?);
    assert_eq!(job.status, AggregationJobStatus::Completed);

    let items = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM retention_items")
        .fetch_one(&pool)
        .await?;
    assert_eq!(items, 1);

    let queued = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM queue_jobs WHERE job_type = 'retry_retention'",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(queued, 1);

    Ok(())
}

#[tokio::test]
async fn retention_replay_deletes_the_item_on_success() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let (ctx, fakes) = build_context(pool.clone());
    let tenant_id = seed_tenant(&pool, "paid", None).await?;
    let config_id = seed_config(&pool, tenant_id, true).await?;

    let store = RetentionStore::new(pool.clone());
    let item_id = store
        .create(
            config_id,
            RetentionDataType::Items,
            json!([{"title": "a"}, {"title": "b"}]),
        )
        .await?;

    let replay = retention::RetryRetention { item_id };
    assert_ok!(replay.run(ctx).await);

    // Replayed per element, then deleted.
    assert_eq!(fakes.storage.items.lock().await.len(), 2);
    assert_none!(store.get(item_id).await?);

    Ok(())
}

#[tokio::test]
async fn retention_replay_of_a_summary_stores_one_document() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let (ctx, fakes) = build_context(pool.clone());
    let tenant_id = seed_tenant(&pool, "paid", None).await?;
    let config_id = seed_config(&pool, tenant_id, true).await?;

    let store = RetentionStore::new(pool.clone());
    let item_id = store
        .create(config_id, RetentionDataType::Summary, json!({"text": "digest"}))
        .await?;

    assert_ok!(retention::RetryRetention { item_id }.run(ctx).await);
    assert_eq!(fakes.storage.summaries.lock().await.len(), 1);
    assert_none!(store.get(item_id).await?);

    Ok(())
}

#[tokio::test]
async fn retention_replay_of_a_missing_item_is_a_noop() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let (ctx, fakes) = build_context(pool.clone());

    let replay = retention::RetryRetention {
        item_id: Uuid::now_v7(),
    };
    assert_ok!(replay.run(ctx).await);
    assert!(fakes.storage.items.lock().await.is_empty());

    Ok(())
}

#[tokio::test]
async fn retention_item_is_discarded_when_config_dropped_external_storage() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let (ctx, fakes) = build_context(pool.clone());
    let tenant_id = seed_tenant(&pool, "paid", None).await?;
    let config_id = seed_config(&pool, tenant_id, false).await?;

    let store = RetentionStore::new(pool.clone());
    let item_id = store
        .create(config_id, RetentionDataType::Summary, json!({"text": "stale"}))
        .await?;

    assert_ok!(retention::RetryRetention { item_id }.run(ctx).await);

    // Discarded without touching storage.
    assert!(fakes.storage.summaries.lock().await.is_empty());
    assert_none!(store.get(item_id).await?);

    Ok(())
}

#[tokio::test]
async fn exhausted_retention_items_are_kept_but_not_resweeped() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let (ctx, fakes) = build_context(pool.clone());
    let tenant_id = seed_tenant(&pool, "paid", None).await?;
    let config_id = seed_config(&pool, tenant_id, true).await?;

    fakes.storage.fail.store(true, Ordering::SeqCst);

    let store = RetentionStore::new(pool.clone());
    let item_id = store
        .create(config_id, RetentionDataType::Summary, json!({"text": "digest"}))
        .await?;

    let ceiling = ctx.config.retention.retry_ceiling;
    for _ in 0..ceiling {
        let replay = retention::RetryRetention { item_id };
        assert_err!(replay.run(ctx.clone()).await);
    }

    // The item survives at the ceiling for operator inspection, but the
    // sweep no longer picks it up.
    let item = assert_some!(store.get(item_id).await?);
    assert_eq!(item.retry_count, ceiling);
    assert_some!(item.last_retry_at);

    let candidates = store.sweep_candidates(ceiling, 0).await?;
    assert!(candidates.is_empty());

    // One attempt short of the ceiling it would still be eligible.
    sqlx::query("UPDATE retention_items SET retry_count = retry_count - 1 WHERE id = $1")
        .bind(item_id)
        .execute(&pool)
        .await?;
    let candidates = store.sweep_candidates(ceiling, 0).await?;
    assert_eq!(candidates, vec![item_id]);

    Ok(())
}

#[tokio::test]
async fn license_sweep_stops_jobs_with_lapsed_subscriptions() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let (ctx, fakes) = build_context(pool.clone());
    let tenant_id = seed_tenant(&pool, "paid", Some("0xabc")).await?;
    let config_id = seed_config(&pool, tenant_id, false).await?;

    let job = aggregation::start_continuous(&pool, config_id, tenant_id, 300).await?;
    fakes.license.set_mode(LicenseMode::Inactive).await;

    assert_ok!(license::LicenseSweep.run(ctx).await);

    let store = JobStore::new(pool.clone());
    let job = assert_some!(store.get_job(job.id).await?);
    assert_eq!(job.status, AggregationJobStatus::Cancelled);
    // The terminal reason distinguishes this from a user cancellation.
    assert_eq!(job.error_message.as_deref(), Some(LICENSE_EXPIRED_MESSAGE));

    let config = assert_some!(store.get_config(config_id).await?);
    assert_none!(config.active_job_id);

    // The tick schedule is gone too.
    let registrations = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM repeatable_jobs")
        .fetch_one(&pool)
        .await?;
    assert_eq!(registrations, 0);

    Ok(())
}

#[tokio::test]
async fn license_sweep_leaves_active_and_admin_jobs_alone() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let (ctx, fakes) = build_context(pool.clone());

    let paid = seed_tenant(&pool, "paid", Some("0xabc")).await?;
    let paid_config = seed_config(&pool, paid, false).await?;
    let admin = seed_tenant(&pool, "admin", None).await?;
    let admin_config = seed_config(&pool, admin, false).await?;

    let store = JobStore::new(pool.clone());
    let paid_job = store.create_continuous_job(paid_config, paid, 300).await?;
    let admin_job = store.create_continuous_job(admin_config, admin, 300).await?;

    assert_ok!(license::LicenseSweep.run(ctx).await);

    let paid_job = assert_some!(store.get_job(paid_job.id).await?);
    assert_eq!(paid_job.status, AggregationJobStatus::Running);
    let admin_job = assert_some!(store.get_job(admin_job.id).await?);
    assert_eq!(admin_job.status, AggregationJobStatus::Running);

    // Admin tenants are exempt from verification entirely.
    assert_eq!(fakes.license.calls.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn license_sweep_fails_open_on_verification_errors() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let (ctx, fakes) = build_context(pool.clone());
    let tenant_id = seed_tenant(&pool, "paid", Some("0xabc")).await?;
    let config_id = seed_config(&pool, tenant_id, false).await?;

    let store = JobStore::new(pool.clone());
    let job = store.create_continuous_job(config_id, tenant_id, 300).await?;

    fakes.license.set_mode(LicenseMode::Error).await;
    assert_ok!(license::LicenseSweep.run(ctx).await);

    // A flaky license upstream must not stop paid work.
    let job = assert_some!(store.get_job(job.id).await?);
    assert_eq!(job.status, AggregationJobStatus::Running);

    Ok(())
}

#[tokio::test]
async fn license_sweep_stops_jobs_without_a_wallet() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let (ctx, fakes) = build_context(pool.clone());
    let tenant_id = seed_tenant(&pool, "paid", None).await?;
    let config_id = seed_config(&pool, tenant_id, false).await?;

    let store = JobStore::new(pool.clone());
    let job = store.create_continuous_job(config_id, tenant_id, 300).await?;

    assert_ok!(license::LicenseSweep.run(ctx).await);

    // No wallet means no verifiable subscription; the service is not asked.
    assert_eq!(fakes.license.calls.load(Ordering::SeqCst), 0);
    let job = assert_some!(store.get_job(job.id).await?);
    assert_eq!(job.status, AggregationJobStatus::Cancelled);
    assert_eq!(job.error_message.as_deref(), Some(LICENSE_EXPIRED_MESSAGE));

    Ok(())
}

#[tokio::test]
async fn free_tier_gets_exactly_one_run_per_day() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let tenant_id = seed_tenant(&pool, "free", None).await?;
    let config_id = seed_config(&pool, tenant_id, false).await?;

    let gate = QuotaGate::new(pool.clone(), OrchestratorConfig::default().quotas);

    assert!(gate.can_run_aggregation(tenant_id, config_id).await?.is_allowed());
    assert_eq!(gate.record_run(config_id).await?, 1);
    gate.mark_free_run_used(tenant_id).await?;

    match gate.can_run_aggregation(tenant_id, config_id).await? {
        Decision::Denied { reason } => assert!(reason.contains("upgrade")),
        Decision::Allowed => panic!("second free run on the same day should be denied"),
    }

    // A fresh config does not grant a second free run: the tenant-level
    // stamp still denies it.
    let second_config = seed_config(&pool, tenant_id, false).await?;
    match gate.can_run_aggregation(tenant_id, second_config).await? {
        Decision::Denied { reason } => assert!(reason.contains("upgrade")),
        Decision::Allowed => panic!("second config should not grant a second free run"),
    }

    // Yesterday's exhaustion does not count today, for the per-config
    // counter or the tenant stamp.
    sqlx::query(
        r"
        UPDATE aggregation_configs
        SET runs_today = 1, runs_today_reset_at = CURRENT_DATE - 1
        WHERE id = $1
        ",
    )
    .bind(config_id)
    .execute(&pool)
    .await?;
    sqlx::query("UPDATE tenants SET free_run_used_at = NOW() - INTERVAL '1 day' WHERE id = $1")
        .bind(tenant_id)
        .execute(&pool)
        .await?;

    assert!(gate.can_run_aggregation(tenant_id, config_id).await?.is_allowed());
    // The conditional UPDATE resets before incrementing.
    assert_eq!(gate.record_run(config_id).await?, 1);

    Ok(())
}

#[tokio::test]
async fn stale_ai_counters_reset_on_increment() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let tenant_id = seed_tenant(&pool, "paid", Some("0xabc")).await?;

    sqlx::query(
        r"
        UPDATE tenants
        SET tokens_used_today = 999999, tokens_reset_at = CURRENT_DATE - 1,
            ai_calls_today = 50, ai_calls_reset_at = CURRENT_DATE - 1,
            cost_today_cents = 400, cost_reset_at = CURRENT_DATE - 1
        WHERE id = $1
        ",
    )
    .bind(tenant_id)
    .execute(&pool)
    .await?;

    let gate = QuotaGate::new(pool.clone(), OrchestratorConfig::default().quotas);
    gate.record_ai_usage(
        tenant_id,
        &TokenUsage {
            prompt_tokens: 80,
            completion_tokens: 20,
            ai_calls: 1,
            estimated_cost_usd: 0.02,
        },
    )
    .await?;

    let (tokens, calls, cost_cents) = sqlx::query_as::<_, (i64, i64, i64)>(
        "SELECT tokens_used_today, ai_calls_today, cost_today_cents FROM tenants WHERE id = $1",
    )
    .bind(tenant_id)
    .fetch_one(&pool)
    .await?;
    assert_eq!(tokens, 100);
    assert_eq!(calls, 1);
    assert_eq!(cost_cents, 2);

    Ok(())
}

#[tokio::test]
async fn terminal_jobs_are_pruned_but_running_jobs_never_are() -> anyhow::Result<()> {
    let (pool, _container) = setup_test_db().await?;
    let tenant_id = seed_tenant(&pool, "paid", None).await?;
    let config_id = seed_config(&pool, tenant_id, false).await?;

    let store = JobStore::new(pool.clone());
    let old_done = store.create_one_time_job(config_id, tenant_id).await?;
    store.complete_job(old_done.id).await?;
    let old_running = store.create_one_time_job(config_id, tenant_id).await?;

    // Age both rows past the retention window.
    sqlx::query("UPDATE aggregation_jobs SET created_at = NOW() - INTERVAL '100 days'")
        .execute(&pool)
        .await?;

    let pruned = store.prune_terminal_jobs(90).await?;
    assert_eq!(pruned, 1);

    assert_none!(store.get_job(old_done.id).await?);
    assert_some!(store.get_job(old_running.id).await?);

    Ok(())
}
