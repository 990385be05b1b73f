//! Row task definitions.
//!
//! - `RowTask`: immutable unit of work for one input row
//! - `RetryPolicy`: queue-level redelivery policy attached to each task
//! - `TaskEnvelope`: a task plus its delivery count, as stored by the queue
//! - `Lease`: temporary ownership of an envelope by one worker

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::execution::ScriptKind;

/// Default maximum number of delivery attempts for a task.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay for exponential backoff.
const DEFAULT_BACKOFF_BASE_MS: u64 = 3000;

/// Priority given to tasks of small inputs.
pub const PRIORITY_HIGH: i32 = 10;

/// Priority given to tasks of large inputs.
pub const PRIORITY_LOW: i32 = 1;

/// Upper bound of accepted priorities; higher values are clamped.
pub const MAX_PRIORITY: i32 = 100;

/// Redelivery policy for uncaught failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff_base_ms,
        }
    }

    /// Delay before redelivery after the `attempt`-th delivery failed:
    /// `base * 2^(attempt - 1)`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(1u64 << exponent))
    }
}

/// Script reference carried by every task of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptRef {
    pub script_id: i64,
    pub path: PathBuf,
    pub kind: ScriptKind,
}

/// Unit of work for one input row. Never modified after enqueue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowTask {
    pub id: Uuid,
    pub job_id: Uuid,
    /// 1-based index assigned at ingestion.
    pub row_index: u64,
    pub row_data: Map<String, Value>,
    pub script: ScriptRef,
    /// Higher values are leased sooner.
    pub priority: i32,
    pub retry: RetryPolicy,
    pub created_at: DateTime<Utc>,
}

impl RowTask {
    pub fn new(
        job_id: Uuid,
        row_index: u64,
        row_data: Map<String, Value>,
        script: ScriptRef,
        priority: i32,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            row_index,
            row_data,
            script,
            priority: priority.clamp(0, MAX_PRIORITY),
            retry,
            created_at: Utc::now(),
        }
    }
}

/// A task as stored by the queue, with the number of deliveries so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task: RowTask,
    pub attempts: u32,
}

impl TaskEnvelope {
    pub fn new(task: RowTask) -> Self {
        Self { task, attempts: 0 }
    }

    /// Whether another delivery is allowed after a failure.
    pub fn should_retry(&self) -> bool {
        self.attempts < self.task.retry.max_attempts
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.task.retry.max_attempts.saturating_sub(self.attempts)
    }

    /// Backoff before the next delivery.
    pub fn next_backoff(&self) -> Duration {
        self.task.retry.backoff_for(self.attempts)
    }
}

/// Temporary ownership of a task.
#[derive(Debug, Clone)]
pub struct Lease {
    pub envelope: TaskEnvelope,
    /// After this instant the queue may hand the task to another worker.
    pub deadline: DateTime<Utc>,
}

impl Lease {
    pub fn task(&self) -> &RowTask {
        &self.envelope.task
    }

    /// 1-based delivery number of this lease.
    pub fn attempt(&self) -> u32 {
        self.envelope.attempts
    }
}

/// A task that exhausted its attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub envelope: TaskEnvelope,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_exponential() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(3000));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(6000));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(12000));
    }

    #[test]
    fn test_envelope_retry_budget() {
        let mut envelope = TaskEnvelope::new(fixtures::task(Uuid::new_v4(), 1, PRIORITY_HIGH));
        assert!(envelope.should_retry());

        envelope.attempts = 2;
        assert!(envelope.should_retry());
        assert_eq!(envelope.remaining_attempts(), 1);

        envelope.attempts = 3;
        assert!(!envelope.should_retry());
        assert_eq!(envelope.remaining_attempts(), 0);
    }

    #[test]
    fn test_priority_is_clamped() {
        let task = fixtures::task(Uuid::new_v4(), 1, 5000);
        assert_eq!(task.priority, MAX_PRIORITY);
        let task = fixtures::task(Uuid::new_v4(), 1, -3);
        assert_eq!(task.priority, 0);
    }

    #[test]
    fn test_task_serialization() {
        let task = fixtures::task(Uuid::new_v4(), 7, PRIORITY_LOW);
        let json = serde_json::to_string(&TaskEnvelope::new(task.clone())).unwrap();
        let back: TaskEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.task, task);
        assert_eq!(back.attempts, 0);
    }
}
