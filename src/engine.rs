//! Process-wide wiring.
//!
//! Connections (ledger, queue, cache) are opened once at startup and handed
//! to every component through an [`Engine`]; nothing reaches for a global.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::abort::AbortController;
use crate::cache::{CacheError, MemoryCache, RedisCache, SharedCache};
use crate::compiler::ResultCompiler;
use crate::config::{ConfigError, EngineConfig};
use crate::execution::{
    BackendError, Dispatcher, InProcessPool, ModuleRegistry, RpcBackend, SubprocessBackend,
};
use crate::ingest::{Enqueuer, Submission};
use crate::listing::{list_rows, RowPage, RowQuery};
use crate::scheduler::{
    MemoryTaskQueue, PoolDeps, QueueError, RedisTaskQueue, TaskQueue, WorkerPool,
    WorkerPoolConfig,
};
use crate::storage::{
    Database, DatabaseError, Job, JobLedger, MemoryLedger, RowStore, ScriptCatalog, StorageError,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),
}

/// Shared clients and the components built on them.
#[derive(Clone)]
pub struct Engine {
    config: EngineConfig,
    database: Option<Arc<Database>>,
    ledger: Arc<dyn JobLedger>,
    catalog: Arc<dyn ScriptCatalog>,
    queue: Arc<dyn TaskQueue>,
    cache: Arc<dyn SharedCache>,
    store: RowStore,
    compiler: Arc<ResultCompiler>,
    dispatcher: Arc<Dispatcher>,
}

impl Engine {
    /// Connects to PostgreSQL and Redis.
    pub async fn connect(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let database = Arc::new(Database::connect(&config.database_url).await?);
        let queue = Arc::new(
            RedisTaskQueue::connect(&config.redis_url, &config.queue_prefix, config.stall_timeout)
                .await?,
        );
        let cache = Arc::new(RedisCache::connect(&config.redis_url, &config.queue_prefix).await?);
        let dispatcher = build_dispatcher(&config, ModuleRegistry::with_builtins())?;

        info!(
            redis = %config.redis_url,
            prefix = %config.queue_prefix,
            results = %config.results_path.display(),
            "Engine connected"
        );

        Ok(Self::assemble(
            config,
            Some(database.clone()),
            database.clone(),
            database,
            queue,
            cache,
            dispatcher,
        ))
    }

    /// Builds an engine on in-memory ledger, queue and cache. Rows still run
    /// through real backends and the filesystem row store.
    pub fn in_memory(
        config: EngineConfig,
        ledger: Arc<MemoryLedger>,
        registry: ModuleRegistry,
    ) -> Result<Self, EngineError> {
        let queue = Arc::new(MemoryTaskQueue::new(config.stall_timeout));
        let dispatcher = build_dispatcher(&config, registry)?;
        Ok(Self::assemble(
            config,
            None,
            ledger.clone(),
            ledger,
            queue,
            Arc::new(MemoryCache::new()),
            dispatcher,
        ))
    }

    fn assemble(
        config: EngineConfig,
        database: Option<Arc<Database>>,
        ledger: Arc<dyn JobLedger>,
        catalog: Arc<dyn ScriptCatalog>,
        queue: Arc<dyn TaskQueue>,
        cache: Arc<dyn SharedCache>,
        dispatcher: Dispatcher,
    ) -> Self {
        let store = RowStore::new(config.results_path.clone());
        let compiler = Arc::new(
            ResultCompiler::new(Arc::clone(&ledger), store.clone()).with_cache(Arc::clone(&cache)),
        );
        Self {
            config,
            database,
            ledger,
            catalog,
            queue,
            cache,
            store,
            compiler,
            dispatcher: Arc::new(dispatcher),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn database(&self) -> Option<&Database> {
        self.database.as_deref()
    }

    pub fn ledger(&self) -> Arc<dyn JobLedger> {
        Arc::clone(&self.ledger)
    }

    pub fn queue(&self) -> Arc<dyn TaskQueue> {
        Arc::clone(&self.queue)
    }

    pub fn cache(&self) -> Arc<dyn SharedCache> {
        Arc::clone(&self.cache)
    }

    pub fn store(&self) -> &RowStore {
        &self.store
    }

    pub fn compiler(&self) -> Arc<ResultCompiler> {
        Arc::clone(&self.compiler)
    }

    pub fn enqueuer(&self) -> Enqueuer {
        Enqueuer::new(self.queue(), self.ledger(), self.cache())
            .with_config(&self.config)
            .with_compiler(self.compiler())
    }

    pub fn submission(&self) -> Submission {
        Submission::new(
            self.ledger(),
            Arc::clone(&self.catalog),
            self.enqueuer(),
            self.config.uploads_path.clone(),
        )
    }

    pub fn abort_controller(&self) -> AbortController {
        AbortController::new(
            self.ledger(),
            self.cache(),
            self.queue(),
            self.config.abort_flag_ttl,
        )
    }

    pub fn pool_deps(&self) -> PoolDeps {
        PoolDeps {
            queue: self.queue(),
            ledger: self.ledger(),
            cache: self.cache(),
            store: self.store.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            compiler: self.compiler(),
        }
    }

    /// A worker pool sized from the configuration; not started.
    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(WorkerPoolConfig::from_engine(&self.config), self.pool_deps())
    }

    pub async fn job(&self, job_id: Uuid) -> Result<Job, EngineError> {
        self.ledger
            .get_job(job_id)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))
    }

    /// Lists a job's rows with their derived status.
    pub async fn rows(&self, job_id: Uuid, query: RowQuery) -> Result<RowPage, EngineError> {
        let job = self.job(job_id).await?;
        Ok(list_rows(&self.store, job_id, job.total_items.max(0) as u64, query).await?)
    }

    /// Closes the database pool.
    pub async fn shutdown(&self) {
        if let Some(db) = &self.database {
            db.close().await;
        }
    }
}

fn build_dispatcher(
    config: &EngineConfig,
    registry: ModuleRegistry,
) -> Result<Dispatcher, EngineError> {
    let subprocess = SubprocessBackend::new(
        config.python_bin.clone(),
        config.node_bin.clone(),
        config.subprocess_timeout,
    );
    let pool = InProcessPool::new(Arc::new(registry), config.pool_threads);
    let mut dispatcher = Dispatcher::new(Arc::new(subprocess)).with_pool(Arc::new(pool));
    if let Some(url) = &config.rpc_url {
        dispatcher = dispatcher.with_rpc(Arc::new(RpcBackend::new(url.clone(), config.rpc_timeout)?));
    }
    Ok(dispatcher)
}

/// Waits until `job_id` reaches a terminal status or `timeout` passes.
pub async fn wait_for_terminal(
    engine: &Engine,
    job_id: Uuid,
    poll: Duration,
    timeout: Duration,
) -> Result<Job, EngineError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = engine.job(job_id).await?;
        if job.status.is_terminal() || tokio::time::Instant::now() >= deadline {
            return Ok(job);
        }
        tokio::time::sleep(poll).await;
    }
}
