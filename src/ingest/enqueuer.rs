//! Turns a persisted input into row tasks.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::BufReader;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::SharedCache;
use crate::compiler::ResultCompiler;
use crate::config::EngineConfig;
use crate::error::IngestError;
use crate::scheduler::{RetryPolicy, RowTask, ScriptRef, TaskQueue, PRIORITY_HIGH, PRIORITY_LOW};
use crate::storage::{JobLedger, JobStatus};

use super::csv::{echoes_header, is_blank, to_row, CsvReader};

/// Priority for every task of a job, from the size of its input.
///
/// Small inputs jump ahead of large ones.
pub fn dispatch_priority(input_bytes: u64, threshold: u64) -> i32 {
    if input_bytes < threshold {
        PRIORITY_HIGH
    } else {
        PRIORITY_LOW
    }
}

/// One ingestion run.
#[derive(Debug, Clone)]
pub struct IngestJob {
    pub job_id: Uuid,
    pub script: ScriptRef,
    pub input: PathBuf,
    /// Overrides the configured chunk size.
    pub chunk_size: Option<usize>,
}

/// What an ingestion run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub job_id: Uuid,
    /// Accepted rows, equal to the job's `total_items`.
    pub total_rows: u64,
    pub blank_rows: u64,
    pub chunks: usize,
    pub priority: i32,
    /// Ingestion stopped early because the job was aborted.
    pub aborted: bool,
}

/// Streams inputs into the task queue in bounded chunks.
#[derive(Clone)]
pub struct Enqueuer {
    queue: Arc<dyn TaskQueue>,
    ledger: Arc<dyn JobLedger>,
    cache: Arc<dyn SharedCache>,
    compiler: Option<Arc<ResultCompiler>>,
    chunk_size: usize,
    priority_threshold: u64,
    retry: RetryPolicy,
}

impl Enqueuer {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        ledger: Arc<dyn JobLedger>,
        cache: Arc<dyn SharedCache>,
    ) -> Self {
        let config = EngineConfig::default();
        Self {
            queue,
            ledger,
            cache,
            compiler: None,
            chunk_size: config.chunk_size,
            priority_threshold: config.priority_size_threshold,
            retry: config.retry,
        }
    }

    /// Applies chunk size, priority threshold and retry policy from `config`.
    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.chunk_size = config.chunk_size;
        self.priority_threshold = config.priority_size_threshold;
        self.retry = config.retry;
        self
    }

    /// Compiles jobs whose rows all finished before their total was known.
    pub fn with_compiler(mut self, compiler: Arc<ResultCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Streams the input, enqueues its rows and records the job's total.
    ///
    /// On any error the job is marked failed, rows already enqueued are
    /// withdrawn and the error returned.
    pub async fn ingest(&self, job: IngestJob) -> Result<IngestSummary, IngestError> {
        let job_id = job.job_id;
        let result = self.stream(&job).await;
        let summary = match result {
            Ok(summary) => summary,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Ingestion failed");
                self.fail(job_id).await;
                return Err(e);
            }
        };

        let counters = match self
            .ledger
            .set_total_items(job_id, summary.total_rows as i64)
            .await
        {
            Ok(counters) => counters,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to record total rows");
                self.fail(job_id).await;
                return Err(e.into());
            }
        };

        info!(
            job_id = %job_id,
            rows = summary.total_rows,
            chunks = summary.chunks,
            priority = summary.priority,
            aborted = summary.aborted,
            "Bulk enqueue complete"
        );

        if summary.total_rows == 0 && !summary.aborted {
            if self.ledger.transition(job_id, JobStatus::Completed).await? {
                info!(job_id = %job_id, "Job has no rows, completed");
            }
        } else if counters.is_complete() {
            if let Some(compiler) = &self.compiler {
                if let Err(e) = compiler.compile_if_complete(job_id).await {
                    warn!(job_id = %job_id, error = %e, "Compilation after ingestion failed");
                }
            }
        }

        Ok(summary)
    }

    async fn stream(&self, job: &IngestJob) -> Result<IngestSummary, IngestError> {
        let chunk_size = job.chunk_size.unwrap_or(self.chunk_size).max(1);
        let size = tokio::fs::metadata(&job.input).await?.len();
        let priority = dispatch_priority(size, self.priority_threshold);

        let mut summary = IngestSummary {
            job_id: job.job_id,
            total_rows: 0,
            blank_rows: 0,
            chunks: 0,
            priority,
            aborted: false,
        };

        let mut reader = CsvReader::new(BufReader::new(File::open(&job.input).await?));
        let headers = match reader.read_headers().await? {
            Some(headers) => headers,
            None => return Ok(summary),
        };

        let mut buffer: Vec<RowTask> = Vec::with_capacity(chunk_size);
        let mut first = true;
        while let Some(record) = reader.next_record().await? {
            if first {
                first = false;
                if echoes_header(&headers, &record) {
                    debug!(job_id = %job.job_id, "Skipping repeated header row");
                    continue;
                }
            }
            if is_blank(&record) {
                summary.blank_rows += 1;
                continue;
            }

            summary.total_rows += 1;
            buffer.push(RowTask::new(
                job.job_id,
                summary.total_rows,
                to_row(&headers, record),
                job.script.clone(),
                priority,
                self.retry,
            ));

            if buffer.len() >= chunk_size {
                if self.is_aborted(job.job_id).await {
                    summary.total_rows -= buffer.len() as u64;
                    summary.aborted = true;
                    return Ok(summary);
                }
                self.flush(job.job_id, &mut buffer, &mut summary).await?;
            }
        }

        if !buffer.is_empty() {
            if self.is_aborted(job.job_id).await {
                summary.total_rows -= buffer.len() as u64;
                summary.aborted = true;
                return Ok(summary);
            }
            self.flush(job.job_id, &mut buffer, &mut summary).await?;
        }

        Ok(summary)
    }

    async fn flush(
        &self,
        job_id: Uuid,
        buffer: &mut Vec<RowTask>,
        summary: &mut IngestSummary,
    ) -> Result<(), IngestError> {
        let tasks = std::mem::take(buffer);
        let count = self.queue.enqueue_bulk(tasks).await?;
        summary.chunks += 1;
        debug!(job_id = %job_id, count, chunk = summary.chunks, "Enqueued chunk");
        Ok(())
    }

    /// Marks the job failed and withdraws its rows still waiting in the queue.
    async fn fail(&self, job_id: Uuid) {
        if let Err(mark) = self.ledger.transition(job_id, JobStatus::Failed).await {
            error!(job_id = %job_id, error = %mark, "Failed to mark job failed");
        }

        match self
            .queue
            .remove_pending(&move |task: &RowTask| task.job_id == job_id)
            .await
        {
            Ok(report) => {
                if report.removed() > 0 {
                    info!(job_id = %job_id, removed = report.removed(), "Withdrew rows of failed job");
                }
                if !report.is_clean() {
                    warn!(job_id = %job_id, failed = report.failed(), "Some rows of failed job could not be withdrawn");
                }
            }
            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to withdraw rows of failed job"),
        }
    }

    async fn is_aborted(&self, job_id: Uuid) -> bool {
        match self.cache.has_abort_flag(job_id).await {
            Ok(flagged) => flagged,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Abort flag check failed");
                false
            }
        }
    }
}
