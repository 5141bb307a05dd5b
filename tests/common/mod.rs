//! Shared fixtures for the integration suites: handlers with known behavior and
//! helpers to stand up a core over a test pool.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use pipeline_core::config::{ConfigManager, PipelineConfig};
use pipeline_core::error::HandlerError;
use pipeline_core::manifest::{IdempotencyLevel, ManifestKey};
use pipeline_core::models::{Execution, NewExecution, NewReject};
use pipeline_core::orchestration::{ExecutionContext, PipelineCore, PipelineHandler, PipelineOutput};
use pipeline_core::quality::{CheckOutcome, FnCheck, QualityCheck};
use pipeline_core::registry::{ParamKind, ParamSchema, ParamSpec, Registry};
use pipeline_core::state_machine::ExecutionStatus;
use pipeline_core::types::Params;

pub const STAGE_DOMAIN: &str = "finra_weekly";
pub const STAGES: [&str; 2] = ["ingested", "normalized"];

/// Completes immediately with one metric.
pub struct SucceedHandler;

#[async_trait]
impl PipelineHandler for SucceedHandler {
    async fn run(&self, _params: &Params, _ctx: &ExecutionContext) -> Result<PipelineOutput, HandlerError> {
        Ok(PipelineOutput::completed().metric("rows", 10))
    }
}

/// Declares a typed schema and succeeds.
pub struct WeeklyIngestHandler;

#[async_trait]
impl PipelineHandler for WeeklyIngestHandler {
    fn param_schema(&self) -> ParamSchema {
        ParamSchema::new()
            .param(ParamSpec::required("week_ending", ParamKind::Date))
            .param(ParamSpec::optional("tier", ParamKind::String).one_of(["NMS", "OTC"]))
    }

    async fn run(&self, params: &Params, _ctx: &ExecutionContext) -> Result<PipelineOutput, HandlerError> {
        Ok(PipelineOutput::completed().metric("week_ending", params["week_ending"].clone()))
    }
}

/// Records two rejects and otherwise succeeds.
pub struct RejectingHandler;

#[async_trait]
impl PipelineHandler for RejectingHandler {
    async fn run(&self, _params: &Params, ctx: &ExecutionContext) -> Result<PipelineOutput, HandlerError> {
        ctx.reject(
            NewReject::new("normalize", "INVALID_SYMBOL")
                .detail("symbol is empty")
                .snapshot(json!({"symbol": "", "volume": 10})),
        )
        .await?;
        ctx.reject(NewReject::new("normalize", "NEGATIVE_VOLUME").detail("volume is -4"))
            .await?;
        Ok(PipelineOutput::completed().metric("rows", 8))
    }
}

/// Raises a transient error for the first `failures` calls, then succeeds.
#[derive(Clone)]
pub struct FlakyHandler {
    failures: usize,
    latency: Duration,
    reject_each_call: bool,
    calls: Arc<AtomicUsize>,
}

impl FlakyHandler {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            latency: Duration::ZERO,
            reject_each_call: false,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every call records one reject before succeeding or failing.
    pub fn rejecting_each_call(mut self) -> Self {
        self.reject_each_call = true;
        self
    }

    /// Each failing call takes `latency` before it errors.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn always() -> Self {
        Self::new(usize::MAX)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PipelineHandler for FlakyHandler {
    async fn run(&self, _params: &Params, ctx: &ExecutionContext) -> Result<PipelineOutput, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_each_call {
            ctx.reject(NewReject::new("parse", "BAD_ROW").detail(format!("call {}", call + 1)))
                .await?;
        }
        if call < self.failures {
            tokio::time::sleep(self.latency).await;
            return Err(HandlerError::transient(format!("upstream timeout on call {}", call + 1)));
        }
        Ok(PipelineOutput::completed())
    }
}

pub struct FatalHandler;

#[async_trait]
impl PipelineHandler for FatalHandler {
    async fn run(&self, _params: &Params, _ctx: &ExecutionContext) -> Result<PipelineOutput, HandlerError> {
        Err(HandlerError::fatal("source file has an unknown layout"))
    }
}

pub struct PanicHandler;

#[async_trait]
impl PipelineHandler for PanicHandler {
    async fn run(&self, _params: &Params, _ctx: &ExecutionContext) -> Result<PipelineOutput, HandlerError> {
        panic!("handler bug");
    }
}

/// Loops over short stages, checking for cancellation between each.
pub struct CheckpointingHandler;

#[async_trait]
impl PipelineHandler for CheckpointingHandler {
    async fn run(&self, _params: &Params, ctx: &ExecutionContext) -> Result<PipelineOutput, HandlerError> {
        for _ in 0..500 {
            ctx.checkpoint().await?;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(PipelineOutput::completed())
    }
}

/// Writes `rows` records for `week_ending` through a state-idempotent stage, then
/// records a row-count quality check against the partition.
pub struct StageWriterHandler;

#[async_trait]
impl PipelineHandler for StageWriterHandler {
    fn param_schema(&self) -> ParamSchema {
        ParamSchema::new()
            .param(ParamSpec::required("week_ending", ParamKind::Date))
            .param(ParamSpec::optional("rows", ParamKind::Integer).with_default(3))
    }

    fn idempotency_level(&self) -> IdempotencyLevel {
        IdempotencyLevel::StateIdempotent
    }

    async fn run(&self, params: &Params, ctx: &ExecutionContext) -> Result<PipelineOutput, HandlerError> {
        let week = params["week_ending"].as_str().unwrap_or_default().to_string();
        let rows = params["rows"].as_i64().unwrap_or_default();
        let key = ManifestKey::new().with("week_ending", &week);
        let guard = ctx.guard(STAGE_DOMAIN, STAGES)?;

        if guard.should_skip(&key, "normalized", ctx.force).await? {
            return Ok(PipelineOutput::completed().metric("skipped", true));
        }

        let records: Vec<_> = (0..rows).map(|n| json!({"week": week, "n": n})).collect();
        ctx.stage_started("normalized").await?;
        let written = guard
            .write_stage(&key, "normalized", self.idempotency_level(), &records, Default::default(), ctx.force)
            .await?;
        ctx.stage_completed("normalized", &Default::default()).await?;

        let min_rows = FnCheck::new("row_count", |n: &i64| {
            if *n > 0 {
                CheckOutcome::pass("rows present")
            } else {
                CheckOutcome::fail("no rows").with_values(json!(n), json!("> 0"))
            }
        });
        let checks: [&dyn QualityCheck<i64>; 1] = [&min_rows];
        ctx.quality().run_checks(&week, &rows, &checks).await?;

        Ok(PipelineOutput::completed().metric("inserted", written.inserted))
    }
}

pub fn test_config(backend: &str) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.backend.kind = backend.to_string();
    config.queue.provider = "in_memory".to_string();
    config.queue.visibility_timeout_seconds = 30;
    config.retry.max_retries = 3;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.worker.poll_interval_ms = 5;
    config
}

pub fn registry_with(extra: Vec<(&str, Arc<dyn PipelineHandler>)>) -> Registry {
    let mut registry = Registry::new();
    registry.register("succeed", SucceedHandler).unwrap();
    registry.register("weekly_ingest", WeeklyIngestHandler).unwrap();
    registry.register("rejecting", RejectingHandler).unwrap();
    registry.register("fatal", FatalHandler).unwrap();
    registry.register("panicking", PanicHandler).unwrap();
    registry.register("checkpointing", CheckpointingHandler).unwrap();
    registry.register("stage_writer", StageWriterHandler).unwrap();
    for (name, handler) in extra {
        registry.register_arc(name, handler).unwrap();
    }
    registry
}

pub fn local_core(pool: SqlitePool, registry: Registry) -> PipelineCore {
    core_with(pool, registry, test_config("local"))
}

pub fn queue_core(pool: SqlitePool, registry: Registry) -> PipelineCore {
    core_with(pool, registry, test_config("queue"))
}

pub fn core_with(pool: SqlitePool, registry: Registry, config: PipelineConfig) -> PipelineCore {
    let config = ConfigManager::from_config(config).unwrap();
    PipelineCore::with_pool(config, registry, pool).unwrap()
}

pub fn request(pipeline: &str) -> NewExecution {
    NewExecution::new(pipeline, Params::new())
}

pub fn week_params(week: &str) -> Params {
    let mut params = Params::new();
    params.insert("week_ending".to_string(), json!(week));
    params
}

/// Poll the ledger until `execution_id` reaches `status`.
pub async fn wait_for_status(core: &PipelineCore, execution_id: Uuid, status: ExecutionStatus) -> Execution {
    for _ in 0..500 {
        let execution = core.queries().get_execution(execution_id).await.unwrap();
        if execution.status == status {
            return execution;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("execution {execution_id} never reached {status}");
}
