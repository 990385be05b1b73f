//! Cooperative job cancellation.
//!
//! Aborting marks the job in the ledger, raises the fast-path flag that
//! workers and the enqueuer consult before starting new work, and prunes
//! the job's pending tasks. Rows already executing run to completion.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::SharedCache;
use crate::scheduler::{PruneReport, RowTask, TaskQueue};
use crate::storage::{DatabaseError, JobLedger, JobStatus};

#[derive(Debug, Error)]
pub enum AbortError {
    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result of an abort request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortReport {
    pub job_id: Uuid,
    /// Status after the request; not `aborted` if the job had already finished.
    pub status: JobStatus,
    /// True if this request moved the job to aborted.
    pub transitioned: bool,
    pub flag_set: bool,
    /// `None` if pruning could not run at all.
    pub pruned: Option<PruneReport>,
}

pub struct AbortController {
    ledger: Arc<dyn JobLedger>,
    cache: Arc<dyn SharedCache>,
    queue: Arc<dyn TaskQueue>,
    flag_ttl: Duration,
}

impl AbortController {
    pub fn new(
        ledger: Arc<dyn JobLedger>,
        cache: Arc<dyn SharedCache>,
        queue: Arc<dyn TaskQueue>,
        flag_ttl: Duration,
    ) -> Self {
        Self {
            ledger,
            cache,
            queue,
            flag_ttl,
        }
    }

    /// Aborts a job.
    ///
    /// Only the ledger update can fail the request. The flag and the queue
    /// prune are best effort and logged.
    pub async fn abort(&self, job_id: Uuid) -> Result<AbortReport, AbortError> {
        if self.ledger.get_job(job_id).await?.is_none() {
            return Err(AbortError::NotFound(job_id));
        }

        let transitioned = self.ledger.transition(job_id, JobStatus::Aborted).await?;
        let status = self
            .ledger
            .get_job(job_id)
            .await?
            .map(|job| job.status)
            .ok_or(AbortError::NotFound(job_id))?;

        if !transitioned && status != JobStatus::Aborted {
            info!(job_id = %job_id, status = %status, "Job already finished, nothing to abort");
            return Ok(AbortReport {
                job_id,
                status,
                transitioned,
                flag_set: false,
                pruned: None,
            });
        }

        let flag_set = match self.cache.set_abort_flag(job_id, self.flag_ttl).await {
            Ok(()) => true,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to set abort flag");
                false
            }
        };

        let predicate = move |task: &RowTask| task.job_id == job_id;
        let pruned = match self.queue.remove_pending(&predicate).await {
            Ok(report) => {
                if !report.is_clean() {
                    warn!(
                        job_id = %job_id,
                        failed = report.failed(),
                        "Some pending tasks could not be removed"
                    );
                }
                Some(report)
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to prune pending tasks");
                None
            }
        };

        info!(
            job_id = %job_id,
            flag_set,
            removed = pruned.as_ref().map(|r| r.removed()).unwrap_or(0),
            "Job aborted"
        );

        Ok(AbortReport {
            job_id,
            status,
            transitioned,
            flag_set,
            pruned,
        })
    }

    /// Fast-path check used before starting new work. Cache errors read as
    /// not aborted.
    pub async fn is_flagged(&self, job_id: Uuid) -> bool {
        match self.cache.has_abort_flag(job_id).await {
            Ok(flagged) => flagged,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Abort flag check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheError, MemoryCache};
    use crate::scheduler::task::fixtures;
    use crate::scheduler::MemoryTaskQueue;
    use crate::storage::{MemoryLedger, NewJob};
    use async_trait::async_trait;

    async fn new_job(ledger: &MemoryLedger) -> Uuid {
        ledger
            .create_job(NewJob {
                owner_id: 1,
                script_id: 1,
                script_path: "/scripts/row.js".into(),
                input_path: None,
            })
            .await
            .unwrap()
    }

    struct BrokenCache;

    #[async_trait]
    impl SharedCache for BrokenCache {
        async fn set_abort_flag(&self, _job_id: Uuid, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::ConnectionFailed("down".into()))
        }

        async fn has_abort_flag(&self, _job_id: Uuid) -> Result<bool, CacheError> {
            Err(CacheError::ConnectionFailed("down".into()))
        }

        async fn publish(&self, _channel: &str, _message: &str) -> Result<(), CacheError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_abort_marks_flags_and_prunes() {
        let ledger = Arc::new(MemoryLedger::new());
        let cache = Arc::new(MemoryCache::new());
        let queue = Arc::new(MemoryTaskQueue::new(Duration::from_secs(60)));
        let job = new_job(&ledger).await;
        let other = new_job(&ledger).await;
        queue
            .enqueue_bulk(vec![
                fixtures::task(job, 1, 1),
                fixtures::task(job, 2, 1),
                fixtures::task(other, 1, 1),
            ])
            .await
            .unwrap();

        let controller =
            AbortController::new(ledger.clone(), cache.clone(), queue.clone(), Duration::from_secs(60));
        let report = controller.abort(job).await.unwrap();

        assert!(report.transitioned);
        assert_eq!(report.status, JobStatus::Aborted);
        assert!(report.flag_set);
        assert_eq!(report.pruned.unwrap().removed(), 2);
        assert!(controller.is_flagged(job).await);
        assert!(!controller.is_flagged(other).await);
        assert_eq!(queue.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_abort_of_finished_job_is_noop() {
        let ledger = Arc::new(MemoryLedger::new());
        let cache = Arc::new(MemoryCache::new());
        let queue = Arc::new(MemoryTaskQueue::new(Duration::from_secs(60)));
        let job = new_job(&ledger).await;
        ledger.transition(job, JobStatus::Completed).await.unwrap();

        let controller = AbortController::new(ledger, cache, queue, Duration::from_secs(60));
        let report = controller.abort(job).await.unwrap();
        assert!(!report.transitioned);
        assert_eq!(report.status, JobStatus::Completed);
        assert!(!controller.is_flagged(job).await);
    }

    #[tokio::test]
    async fn test_cache_failure_is_not_fatal() {
        let ledger = Arc::new(MemoryLedger::new());
        let queue = Arc::new(MemoryTaskQueue::new(Duration::from_secs(60)));
        let job = new_job(&ledger).await;

        let controller =
            AbortController::new(ledger.clone(), Arc::new(BrokenCache), queue, Duration::from_secs(60));
        let report = controller.abort(job).await.unwrap();
        assert!(!report.flag_set);
        assert_eq!(
            ledger.get_job(job).await.unwrap().unwrap().status,
            JobStatus::Aborted
        );
        assert!(!controller.is_flagged(job).await);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let controller = AbortController::new(
            Arc::new(MemoryLedger::new()),
            Arc::new(MemoryCache::new()),
            Arc::new(MemoryTaskQueue::new(Duration::from_secs(60))),
            Duration::from_secs(60),
        );
        assert!(matches!(
            controller.abort(Uuid::new_v4()).await,
            Err(AbortError::NotFound(_))
        ));
    }
}
