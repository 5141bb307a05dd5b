//! # Bootstrap
//!
//! Wires the core from configuration: pool and migrations, runner, the configured
//! backend, the dispatcher and the read-only query service.

use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

use super::dispatcher::Dispatcher;
use super::retry_policy::RetryPolicy;
use super::runner::PipelineRunner;
use crate::backend::{Backend, LocalBackend, QueueBackend, WorkerPool, WorkerPoolConfig};
use crate::config::{BackendKind, ConfigManager};
use crate::database;
use crate::error::PipelineResult;
use crate::ledger::ExecutionLedger;
use crate::messaging::QueueProvider;
use crate::registry::Registry;
use crate::services::QueryService;

pub struct PipelineCore {
    config: Arc<ConfigManager>,
    pool: SqlitePool,
    runner: Arc<PipelineRunner>,
    dispatcher: Dispatcher,
    queries: QueryService,
    queue: Option<Arc<QueueProvider>>,
}

impl PipelineCore {
    /// Connect, migrate if configured, and build the parts around `registry`.
    pub async fn bootstrap(config: Arc<ConfigManager>, registry: Registry) -> PipelineResult<Self> {
        let settings = config.config();
        settings.validate()?;

        let pool = database::connect(&settings.database).await?;
        Self::with_pool(config, registry, pool)
    }

    /// Build on an existing, migrated pool.
    pub fn with_pool(
        config: Arc<ConfigManager>,
        registry: Registry,
        pool: SqlitePool,
    ) -> PipelineResult<Self> {
        let settings = config.config();
        let registry = Arc::new(registry);
        let ledger = ExecutionLedger::new(pool.clone());
        let runner = Arc::new(PipelineRunner::new(
            Arc::clone(&registry),
            ledger.clone(),
            RetryPolicy::from_config(&settings.retry),
        ));

        let (backend, queue): (Arc<dyn Backend>, Option<Arc<QueueProvider>>) =
            match settings.backend_kind()? {
                BackendKind::Local => (Arc::new(LocalBackend::new(Arc::clone(&runner))), None),
                BackendKind::Queue => {
                    let queue = Arc::new(QueueProvider::from_kind(
                        settings.queue_provider_kind()?,
                        &pool,
                    ));
                    let backend = QueueBackend::new(
                        Arc::clone(&queue),
                        settings.queue.prefix.clone(),
                        Some(Arc::clone(&runner)),
                    );
                    (Arc::new(backend), Some(queue))
                }
            };

        info!(
            environment = %config.environment(),
            backend = backend.name(),
            pipelines = ?registry.list(),
            "Pipeline core ready"
        );

        Ok(Self {
            dispatcher: Dispatcher::new(registry, ledger, backend),
            queries: QueryService::new(pool.clone()),
            config,
            pool,
            runner,
            queue,
        })
    }

    pub fn config(&self) -> &ConfigManager {
        &self.config
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn queries(&self) -> &QueryService {
        &self.queries
    }

    pub fn runner(&self) -> &Arc<PipelineRunner> {
        &self.runner
    }

    /// The lane queues, when the queue backend is configured.
    pub fn queue(&self) -> Option<&Arc<QueueProvider>> {
        self.queue.as_ref()
    }

    /// A worker pool over the configured lanes, for the queue backend only.
    pub fn worker_pool(&self) -> Option<WorkerPool> {
        self.queue.as_ref().map(|queue| {
            WorkerPool::new(
                Arc::clone(&self.runner),
                Arc::clone(queue),
                WorkerPoolConfig::from_config(self.config.config()),
            )
        })
    }
}
