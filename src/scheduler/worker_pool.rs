//! Worker pool for processing row tasks.
//!
//! Each worker runs as an independent async task that leases one row task
//! at a time, so the number of workers caps concurrent leases. A separate
//! semaphore caps executions in flight across all workers.
//!
//! # Features
//!
//! - Abort consulted before a row is leased into a slot and again once the
//!   slot is acquired
//! - Lease extended on a heartbeat while the row runs
//! - Job marked running on its first row, once
//! - Each row claimed once, its result written, then counters incremented
//!   atomically
//! - Uncaught backend failures handed back to the queue for retry
//! - Completion check after a settle delay, compiling finished jobs
//! - Periodic recovery of stalled leases; rows out of attempts are recorded
//!   as failed
//! - Graceful shutdown with broadcast channel

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{progress_channel, SharedCache};
use crate::compiler::ResultCompiler;
use crate::config::EngineConfig;
use crate::execution::{BackendError, BackendOutput, Dispatcher, ExecutionRequest};
use crate::metrics::MetricsCollector;
use crate::storage::{CounterDelta, JobCounters, JobLedger, JobStatus, RowResult, RowStore};

use super::queue::{QueueError, Recovery, RetryOutcome, TaskQueue, STALLED_OUT};
use super::state::{RowLifecycle, RowOutcome, RowState};
use super::task::{Lease, RowTask};

/// Upper bound on the stalled-lease sweep interval.
const MAX_RECOVERY_INTERVAL: Duration = Duration::from_secs(60);

/// Lower bound on the lease heartbeat interval.
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The task queue failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks, i.e. concurrent leases.
    pub num_workers: usize,
    /// Maximum executions in flight across all workers.
    pub max_children: usize,
    /// How long one lease attempt waits when the queue is empty.
    pub poll_interval: Duration,
    /// How often expired leases are recovered.
    pub recovery_interval: Duration,
    /// How often a running row extends its lease.
    pub heartbeat_interval: Duration,
    /// Delay between a counter increment and the completion check.
    pub settle_delay: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 5,
            max_children: 1000,
            poll_interval: Duration::from_secs(1),
            recovery_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            settle_delay: Duration::from_millis(200),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Derives the pool settings from the engine configuration.
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            num_workers: config.worker_concurrency,
            max_children: config.worker_max_children,
            poll_interval: config.poll_interval,
            recovery_interval: (config.stall_timeout / 4)
                .clamp(Duration::from_secs(1), MAX_RECOVERY_INTERVAL),
            heartbeat_interval: config.stall_timeout / 3,
            settle_delay: config.settle_delay,
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// Sets the execution cap.
    pub fn with_max_children(mut self, max_children: usize) -> Self {
        self.max_children = max_children;
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the stalled-lease recovery interval.
    pub fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = interval;
        self
    }

    /// Sets the lease heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the settle delay.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Row executions currently in flight.
    pub active_executions: usize,
    pub rows_succeeded: u64,
    pub rows_failed: u64,
    /// Rows skipped because their job was aborted (also failures).
    pub rows_aborted: u64,
    /// Executions handed back to the queue.
    pub rows_retried: u64,
    /// Average row processing duration.
    pub average_row_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of rows finalized.
    pub fn total_processed(&self) -> u64 {
        self.rows_succeeded + self.rows_failed + self.rows_aborted
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.rows_succeeded as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    rows_succeeded: AtomicU64,
    rows_failed: AtomicU64,
    rows_aborted: AtomicU64,
    rows_retried: AtomicU64,
    total_duration_ms: AtomicU64,
    active_executions: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            rows_succeeded: AtomicU64::new(0),
            rows_failed: AtomicU64::new(0),
            rows_aborted: AtomicU64::new(0),
            rows_retried: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_executions: AtomicU64::new(0),
        }
    }

    fn record(&self, outcome: RowOutcome, duration: Duration) {
        let counter = match outcome {
            RowOutcome::Succeeded => &self.rows_succeeded,
            RowOutcome::Failed => &self.rows_failed,
            RowOutcome::Aborted => &self.rows_aborted,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_retry(&self) {
        self.rows_retried.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_executions.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_executions.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let succeeded = self.rows_succeeded.load(Ordering::SeqCst);
        let failed = self.rows_failed.load(Ordering::SeqCst);
        let aborted = self.rows_aborted.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total_rows = succeeded + failed + aborted;
        let average_duration = if total_rows > 0 {
            Duration::from_millis(total_duration_ms / total_rows)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_executions: self.active_executions.load(Ordering::SeqCst) as usize,
            rows_succeeded: succeeded,
            rows_failed: failed,
            rows_aborted: aborted,
            rows_retried: self.rows_retried.load(Ordering::SeqCst),
            average_row_duration: average_duration,
        }
    }
}

/// Collaborators shared by every worker.
#[derive(Clone)]
pub struct PoolDeps {
    pub queue: Arc<dyn TaskQueue>,
    pub ledger: Arc<dyn JobLedger>,
    pub cache: Arc<dyn SharedCache>,
    pub store: RowStore,
    pub dispatcher: Arc<Dispatcher>,
    pub compiler: Arc<ResultCompiler>,
}

/// Runs one leased task from abort check to finalize.
pub struct RowProcessor {
    deps: PoolDeps,
    children: Semaphore,
    settle_delay: Duration,
    heartbeat_interval: Duration,
    /// Jobs this process marked running that have not finished yet.
    started_jobs: Mutex<HashSet<Uuid>>,
    metrics: MetricsCollector,
    stats: Arc<SharedPoolStats>,
}

/// What happened once a row asked for an execution slot.
enum Slot {
    /// The semaphore was closed.
    Closed(String),
    /// The job was aborted while the row waited.
    Aborted,
    Ran(Result<BackendOutput, BackendError>),
}

fn advance(life: &mut RowLifecycle, to: RowState, lease: &Lease) {
    if let Err(e) = life.advance(to) {
        error!(task_id = %lease.task().id, error = %e, "Row lifecycle violated");
    }
}

/// Failed row recorded for a task whose attempts ran out.
fn exhausted_row(task: &RowTask, error: &str) -> RowResult {
    RowResult {
        job_id: task.job_id,
        row_index: task.row_index,
        code: 1,
        out: error.to_string(),
        err: error.to_string(),
        row_data: task.row_data.clone(),
        finished_at: Utc::now(),
        result: None,
        aborted: false,
        backend: None,
    }
}

impl RowProcessor {
    fn new(deps: PoolDeps, config: &WorkerPoolConfig, stats: Arc<SharedPoolStats>) -> Self {
        Self {
            deps,
            children: Semaphore::new(config.max_children.max(1)),
            settle_delay: config.settle_delay,
            heartbeat_interval: config.heartbeat_interval.max(MIN_HEARTBEAT),
            started_jobs: Mutex::new(HashSet::new()),
            metrics: MetricsCollector::new(),
            stats,
        }
    }

    /// Processes one leased task.
    pub async fn process(&self, lease: Lease, worker_id: &str) {
        let task = lease.task();
        let job_id = task.job_id;
        let row_index = task.row_index;
        let started = Instant::now();
        let mut life = RowLifecycle::new();

        debug!(
            worker_id,
            job_id = %job_id,
            row_index,
            attempt = lease.attempt(),
            "Processing row"
        );

        if self.deps.store.is_claimed(job_id, row_index).await {
            info!(worker_id, job_id = %job_id, row_index, "Row already recorded, dropping redelivery");
            self.ack(&lease).await;
            return;
        }

        let aborted = self.abort_flagged(job_id).await;
        advance(&mut life, RowState::AbortChecked, &lease);
        if aborted {
            self.skip_aborted(&lease, &mut life, started, worker_id).await;
            return;
        }

        let slot = self
            .with_heartbeat(&lease, self.run_in_slot(&lease, &mut life))
            .await;
        let output = match slot {
            Slot::Ran(Ok(output)) => output,
            Slot::Ran(Err(e)) => {
                advance(&mut life, RowState::Released, &lease);
                self.release(&lease, &e.to_string(), started).await;
                return;
            }
            Slot::Closed(error) => {
                advance(&mut life, RowState::Released, &lease);
                self.release(&lease, &error, started).await;
                return;
            }
            Slot::Aborted => {
                self.skip_aborted(&lease, &mut life, started, worker_id).await;
                return;
            }
        };

        let mut log_tail = String::new();
        if !output.backend.streams_log() {
            for text in [&output.out, &output.err] {
                if !text.is_empty() {
                    log_tail.push_str(text);
                    if !text.ends_with('\n') {
                        log_tail.push('\n');
                    }
                }
            }
        }
        log_tail.push_str(&format!("\nEXIT={}\n", output.code));
        if let Err(e) = self.deps.store.append_log(job_id, row_index, &log_tail).await {
            warn!(job_id = %job_id, row_index, error = %e, "Failed to append to row log");
        }

        let outcome = if output.code == 0 {
            RowOutcome::Succeeded
        } else {
            RowOutcome::Failed
        };
        advance(&mut life, RowState::Finalized(outcome), &lease);

        let backend = output.backend.as_str();
        let result = RowResult {
            job_id,
            row_index,
            code: output.code,
            out: output.out,
            err: output.err,
            row_data: task.row_data.clone(),
            finished_at: Utc::now(),
            result: output.result,
            aborted: false,
            backend: Some(backend.to_string()),
        };
        self.finalize(Some(&lease), result, outcome, started, backend)
            .await;
    }

    /// Waits for an execution slot, re-checks the abort, then runs the row.
    async fn run_in_slot(&self, lease: &Lease, life: &mut RowLifecycle) -> Slot {
        let task = lease.task();
        let job_id = task.job_id;
        let row_index = task.row_index;

        let _permit = match self.children.acquire().await {
            Ok(permit) => permit,
            Err(e) => return Slot::Closed(format!("execution slots closed: {}", e)),
        };

        // The abort may have landed while this row waited for a slot
        if self.abort_requested(job_id).await {
            return Slot::Aborted;
        }

        self.mark_running(job_id).await;

        if let Err(e) = self
            .deps
            .store
            .create_log(job_id, row_index, &task.row_data)
            .await
        {
            warn!(job_id = %job_id, row_index, error = %e, "Failed to create row log");
        }

        let request = ExecutionRequest {
            job_id,
            row_index,
            row_data: task.row_data.clone(),
            script_path: task.script.path.clone(),
            log_path: self.deps.store.log_path(job_id, row_index),
            result_path: self.deps.store.result_path(job_id, row_index),
        };

        advance(life, RowState::Executing, lease);
        self.metrics.execution_started();
        self.stats.increment_active();
        let dispatched = self
            .deps
            .dispatcher
            .dispatch(task.script.kind, &request)
            .await;
        self.stats.decrement_active();
        self.metrics.execution_finished();
        Slot::Ran(dispatched)
    }

    /// Drives `work` to completion, extending the lease every heartbeat.
    async fn with_heartbeat<F: Future>(&self, lease: &Lease, work: F) -> F::Output {
        tokio::pin!(work);
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = ticker.tick() => match self.deps.queue.extend(lease).await {
                    Ok(true) => {}
                    Ok(false) => warn!(
                        task_id = %lease.task().id,
                        job_id = %lease.task().job_id,
                        row_index = lease.task().row_index,
                        "Lease lost while the row was running"
                    ),
                    Err(e) => warn!(task_id = %lease.task().id, error = %e, "Failed to extend lease"),
                },
            }
        }
    }

    /// Fast path: the cache flag only.
    async fn abort_flagged(&self, job_id: Uuid) -> bool {
        match self.deps.cache.has_abort_flag(job_id).await {
            Ok(flag) => flag,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Abort flag lookup failed, assuming not aborted");
                false
            }
        }
    }

    /// The cache flag, then the ledger status.
    async fn abort_requested(&self, job_id: Uuid) -> bool {
        if self.abort_flagged(job_id).await {
            return true;
        }
        match self.deps.ledger.get_job(job_id).await {
            Ok(job) => job.is_some_and(|job| job.status == JobStatus::Aborted),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Job status lookup failed, assuming not aborted");
                false
            }
        }
    }

    async fn skip_aborted(
        &self,
        lease: &Lease,
        life: &mut RowLifecycle,
        started: Instant,
        worker_id: &str,
    ) {
        let task = lease.task();
        info!(worker_id, job_id = %task.job_id, row_index = task.row_index, "Job aborted, skipping row");
        advance(life, RowState::Finalized(RowOutcome::Aborted), lease);
        let result = RowResult {
            job_id: task.job_id,
            row_index: task.row_index,
            code: 1,
            out: "aborted".to_string(),
            err: "job was aborted before this row started".to_string(),
            row_data: task.row_data.clone(),
            finished_at: Utc::now(),
            result: None,
            aborted: true,
            backend: None,
        };
        self.finalize(Some(lease), result, RowOutcome::Aborted, started, "none")
            .await;
    }

    /// Marks the job running the first time this process starts one of its rows.
    async fn mark_running(&self, job_id: Uuid) {
        if !self.started_jobs.lock().await.insert(job_id) {
            return;
        }
        match self.deps.ledger.transition(job_id, JobStatus::Running).await {
            Ok(true) => info!(job_id = %job_id, "Job started"),
            Ok(false) => {}
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to mark job running");
                self.started_jobs.lock().await.remove(&job_id);
            }
        }
    }

    /// Records a row exactly once: claims it, writes its result, then counts
    /// it. `lease` is acked when given; dead-lettered rows pass `None`.
    async fn finalize(
        &self,
        lease: Option<&Lease>,
        result: RowResult,
        outcome: RowOutcome,
        started: Instant,
        backend: &str,
    ) {
        let job_id = result.job_id;
        let row_index = result.row_index;

        let written = match self.deps.store.claim_row(job_id, row_index).await {
            Ok(true) => self.deps.store.write_row_result(&result).await.map(|_| ()),
            Ok(false) => {
                info!(job_id = %job_id, row_index, "Row recorded by another delivery, not counting again");
                if let Some(lease) = lease {
                    self.ack(lease).await;
                }
                return;
            }
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            error!(job_id = %job_id, row_index, error = %e, "Failed to write row result");
            if let Some(lease) = lease {
                // Let the next delivery record the row
                if let Err(release_err) = self.deps.store.release_claim(job_id, row_index).await {
                    warn!(job_id = %job_id, row_index, error = %release_err, "Failed to release row claim");
                }
                let error = format!("row result write failed: {}", e);
                if self.hand_back(lease, &error).await.is_none() {
                    return;
                }
            }
            // Out of attempts: count it anyway so the job can still complete
            warn!(job_id = %job_id, row_index, "Counting row as failed without a result artifact");
            self.count(None, job_id, row_index, RowOutcome::Failed, started, backend)
                .await;
            return;
        }

        self.count(lease, job_id, row_index, outcome, started, backend)
            .await;
    }

    /// Increments the job counters, acks, publishes progress and checks for
    /// completion.
    async fn count(
        &self,
        lease: Option<&Lease>,
        job_id: Uuid,
        row_index: u64,
        outcome: RowOutcome,
        started: Instant,
        backend: &str,
    ) {
        let counters = match self
            .deps
            .ledger
            .increment(job_id, CounterDelta::for_outcome(outcome.succeeded()))
            .await
        {
            Ok(counters) => Some(counters),
            Err(e) => {
                error!(job_id = %job_id, row_index, error = %e, "Failed to increment job counters");
                None
            }
        };

        let duration = started.elapsed();
        self.metrics.record_row(outcome.as_str(), backend, duration);
        self.stats.record(outcome, duration);

        if let Some(lease) = lease {
            self.ack(lease).await;
        }

        debug!(
            job_id = %job_id,
            row_index,
            outcome = outcome.as_str(),
            duration_ms = duration.as_millis() as u64,
            "Row finalized"
        );

        let Some(counters) = counters else { return };
        self.publish_progress(job_id, &counters).await;

        if counters.is_complete() || counters.status.is_terminal() {
            self.started_jobs.lock().await.remove(&job_id);
        }

        if counters.is_complete() {
            tokio::time::sleep(self.settle_delay).await;
            if let Err(e) = self.deps.compiler.compile_if_complete(job_id).await {
                error!(job_id = %job_id, error = %e, "Result compilation failed");
            }
        }
    }

    async fn ack(&self, lease: &Lease) {
        if let Err(e) = self.deps.queue.ack(lease).await {
            warn!(task_id = %lease.task().id, error = %e, "Failed to ack task");
        }
    }

    /// Hands a task back after an uncaught failure. Once its attempts are
    /// spent the row is recorded as failed so the job can still complete.
    async fn release(&self, lease: &Lease, error: &str, started: Instant) {
        if let Some(result) = self.hand_back(lease, error).await {
            self.finalize(None, result, RowOutcome::Failed, started, "none")
                .await;
        }
    }

    /// Returns the failed row to record when the task was dead-lettered.
    async fn hand_back(&self, lease: &Lease, error: &str) -> Option<RowResult> {
        let task = lease.task();
        self.stats.record_retry();

        match self.deps.queue.retry(lease, error).await {
            Ok(RetryOutcome::Requeued { delay }) => {
                warn!(
                    job_id = %task.job_id,
                    row_index = task.row_index,
                    error,
                    remaining_attempts = lease.envelope.remaining_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Row execution failed, requeued for retry"
                );
                None
            }
            Ok(RetryOutcome::DeadLettered) => {
                error!(
                    job_id = %task.job_id,
                    row_index = task.row_index,
                    error,
                    "Row execution failed after max attempts"
                );
                Some(exhausted_row(task, error))
            }
            Err(e) => {
                error!(
                    job_id = %task.job_id,
                    row_index = task.row_index,
                    error = %e,
                    "Failed to hand task back to the queue"
                );
                None
            }
        }
    }

    /// Returns expired leases to the queue and records rows whose attempts
    /// ran out as failed.
    pub async fn recover_stalled(&self) -> Result<Recovery, QueueError> {
        let recovery = self.deps.queue.recover_stalled().await?;
        for envelope in &recovery.dead_lettered {
            let task = &envelope.task;
            error!(
                job_id = %task.job_id,
                row_index = task.row_index,
                attempts = envelope.attempts,
                "Row lease expired after max attempts"
            );
            self.finalize(
                None,
                exhausted_row(task, STALLED_OUT),
                RowOutcome::Failed,
                Instant::now(),
                "none",
            )
            .await;
        }
        Ok(recovery)
    }

    async fn publish_progress(&self, job_id: Uuid, counters: &JobCounters) {
        let message = json!({
            "jobId": job_id,
            "processedRows": counters.processed_rows,
            "totalItems": counters.total_items,
            "successCount": counters.success_count,
            "failedCount": counters.failed_count,
            "status": counters.status,
        })
        .to_string();
        if let Err(e) = self
            .deps
            .cache
            .publish(&progress_channel(job_id), &message)
            .await
        {
            warn!(job_id = %job_id, error = %e, "Failed to publish progress");
        }
    }
}

/// Worker pool that manages multiple workers processing row tasks.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    processor: Arc<RowProcessor>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, deps: PoolDeps) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);
        let stats = Arc::new(SharedPoolStats::new());
        let processor = Arc::new(RowProcessor::new(deps, &config, Arc::clone(&stats)));

        Self {
            config,
            processor,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats,
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers and the stalled-lease recovery loop.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        // Recover tasks stuck under leases from previous runs
        log_recovery(self.processor.recover_stalled().await);

        for i in 0..self.config.num_workers {
            let worker = Worker::new(
                format!("worker-{}", i),
                Arc::clone(&self.processor),
                self.shutdown_tx.subscribe(),
                self.config.poll_interval,
            );
            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        let recovery = recovery_loop(
            Arc::clone(&self.processor),
            self.shutdown_tx.subscribe(),
            self.config.recovery_interval,
        );
        self.worker_handles.push(tokio::spawn(recovery));

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            num_workers = self.config.num_workers,
            max_children = self.config.max_children,
            "Worker pool started"
        );

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers finish the row they are processing before stopping.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Ignore send error - workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = self.worker_handles.drain(..).collect();
        let shutdown_future = async move {
            for result in futures::future::join_all(handles).await {
                if let Err(e) = result {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let outcome = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        match outcome {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    /// Returns the row processor shared by the workers.
    pub fn processor(&self) -> &Arc<RowProcessor> {
        &self.processor
    }
}

fn log_recovery(recovered: Result<Recovery, QueueError>) {
    match recovered {
        Ok(recovery) if !recovery.is_empty() => info!(
            requeued = recovery.requeued,
            dead_lettered = recovery.dead_lettered.len(),
            "Recovered stalled tasks"
        ),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Failed to recover stalled tasks"),
    }
}

async fn recovery_loop(
    processor: Arc<RowProcessor>,
    mut shutdown_rx: broadcast::Receiver<()>,
    interval: Duration,
) {
    let metrics = MetricsCollector::new();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        log_recovery(processor.recover_stalled().await);

        if let Ok(stats) = processor.deps.queue.stats().await {
            metrics.set_queue_depth("pending", stats.pending as u64);
            metrics.set_queue_depth("leased", stats.leased as u64);
            metrics.set_queue_depth("delayed", stats.delayed as u64);
            metrics.set_queue_depth("dead_letter", stats.dead_letter as u64);
        }
    }
}

/// A single worker that leases and processes tasks.
pub struct Worker {
    /// Unique identifier for this worker.
    id: String,
    processor: Arc<RowProcessor>,
    /// Receiver for shutdown signal.
    shutdown_rx: broadcast::Receiver<()>,
    /// How long one lease attempt waits when the queue is empty.
    poll_interval: Duration,
}

impl Worker {
    fn new(
        id: String,
        processor: Arc<RowProcessor>,
        shutdown_rx: broadcast::Receiver<()>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            id,
            processor,
            shutdown_rx,
            poll_interval,
        }
    }

    /// Main worker loop.
    ///
    /// Leases and processes tasks until a shutdown signal is received.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            // Check for shutdown signal (non-blocking)
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.processor.deps.queue.lease(self.poll_interval).await {
                Ok(Some(lease)) => {
                    self.processor.process(lease, &self.id).await;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to lease task");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Returns the worker's ID.
    pub fn id(&self) -> &str {
        &self.id
    }
}
