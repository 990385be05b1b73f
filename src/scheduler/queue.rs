//! Task queue contract.
//!
//! The queue is durable, priority-ordered and at-least-once:
//!
//! - `enqueue_bulk` adds a batch of row tasks
//! - `lease` hands the highest-priority due task to one worker until its
//!   deadline; `extend` pushes the deadline out while the row runs, and an
//!   expired lease is returned by `recover_stalled`
//! - `ack` drops a finished task
//! - `retry` redelivers after exponential backoff, or dead-letters once the
//!   task's attempts are spent
//! - `remove_pending` prunes tasks nobody leased yet, reporting per task

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::task::{Lease, RowTask, TaskEnvelope};

/// Dead-letter reason for a lease that expired on its last attempt.
pub const STALLED_OUT: &str = "lease expired after max attempts";

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize task data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// The leased task is no longer known to the queue.
    #[error("Task {0} not found")]
    TaskNotFound(Uuid),
}

/// What happened to a task handed back with `retry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Will be leasable again after `delay`.
    Requeued { delay: Duration },
    /// Attempts exhausted.
    DeadLettered,
}

/// Result of pruning one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "error")]
pub enum PruneOutcome {
    Removed,
    /// Leased or acked between listing and removal.
    AlreadyGone,
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct PruneItem {
    pub task_id: Uuid,
    pub row_index: u64,
    #[serde(flatten)]
    pub outcome: PruneOutcome,
}

/// Per-task outcome of a `remove_pending` call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneReport {
    pub items: Vec<PruneItem>,
}

impl PruneReport {
    pub fn push(&mut self, task: &RowTask, outcome: PruneOutcome) {
        self.items.push(PruneItem {
            task_id: task.id,
            row_index: task.row_index,
            outcome,
        });
    }

    pub fn removed(&self) -> usize {
        self.count(|o| matches!(o, PruneOutcome::Removed))
    }

    pub fn already_gone(&self) -> usize {
        self.count(|o| matches!(o, PruneOutcome::AlreadyGone))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, PruneOutcome::Failed(_)))
    }

    /// True if no item failed.
    pub fn is_clean(&self) -> bool {
        self.failed() == 0
    }

    fn count(&self, pred: impl Fn(&PruneOutcome) -> bool) -> usize {
        self.items.iter().filter(|i| pred(&i.outcome)).count()
    }
}

/// Statistics about queue state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Tasks waiting to be leased.
    pub pending: usize,
    /// Tasks currently owned by a worker.
    pub leased: usize,
    /// Tasks waiting out a retry backoff.
    pub delayed: usize,
    /// Tasks that exhausted their attempts.
    pub dead_letter: usize,
}

impl QueueStats {
    /// Tasks that may still run.
    pub fn outstanding(&self) -> usize {
        self.pending + self.leased + self.delayed
    }
}

/// Outcome of one `recover_stalled` sweep.
#[derive(Debug, Clone, Default)]
pub struct Recovery {
    /// Expired leases returned to pending.
    pub requeued: usize,
    /// Expired leases whose attempts were spent. The caller records these
    /// rows as failed.
    pub dead_lettered: Vec<TaskEnvelope>,
}

impl Recovery {
    pub fn is_empty(&self) -> bool {
        self.requeued == 0 && self.dead_lettered.is_empty()
    }
}

/// Filter passed to `remove_pending`.
pub type TaskPredicate = dyn Fn(&RowTask) -> bool + Send + Sync;

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Adds tasks; returns how many were enqueued.
    async fn enqueue_bulk(&self, tasks: Vec<RowTask>) -> Result<usize, QueueError>;

    /// Waits up to `wait` for a due task. The returned lease counts as one
    /// delivery attempt.
    async fn lease(&self, wait: Duration) -> Result<Option<Lease>, QueueError>;

    /// Moves the lease deadline to now plus the stall timeout. Returns false
    /// when the lease is no longer held.
    async fn extend(&self, lease: &Lease) -> Result<bool, QueueError>;

    /// Drops a finished task.
    async fn ack(&self, lease: &Lease) -> Result<(), QueueError>;

    /// Hands back a task whose execution failed without an outcome.
    async fn retry(&self, lease: &Lease, error: &str) -> Result<RetryOutcome, QueueError>;

    /// Removes every pending or delayed task matching `predicate`.
    async fn remove_pending(&self, predicate: &TaskPredicate) -> Result<PruneReport, QueueError>;

    /// Returns expired leases to pending, dead-lettering those out of
    /// attempts.
    async fn recover_stalled(&self) -> Result<Recovery, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::fixtures;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = QueueError::TaskNotFound(Uuid::nil());
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_prune_report_counts() {
        let job = Uuid::new_v4();
        let mut report = PruneReport::default();
        report.push(&fixtures::task(job, 1, 1), PruneOutcome::Removed);
        report.push(&fixtures::task(job, 2, 1), PruneOutcome::Removed);
        report.push(&fixtures::task(job, 3, 1), PruneOutcome::AlreadyGone);
        assert!(report.is_clean());

        report.push(&fixtures::task(job, 4, 1), PruneOutcome::Failed("io".into()));
        assert_eq!(report.removed(), 2);
        assert_eq!(report.already_gone(), 1);
        assert_eq!(report.failed(), 1);
        assert!(!report.is_clean());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["items"][3]["outcome"], "failed");
        assert_eq!(json["items"][3]["error"], "io");
        assert_eq!(json["items"][0]["row_index"], 1);
    }

    #[test]
    fn test_queue_stats_outstanding() {
        let stats = QueueStats {
            pending: 10,
            leased: 5,
            delayed: 2,
            dead_letter: 7,
        };
        assert_eq!(stats.outstanding(), 17);
    }
}
