//! Row task scheduling: the task queue and the worker pool consuming it.
//!
//! - **RowTask**: one input row plus everything needed to run it
//! - **TaskQueue**: durable priority queue with leases, retry with
//!   backoff and a dead letter list ([`RedisTaskQueue`], [`MemoryTaskQueue`])
//! - **WorkerPool**: bounded pool of workers that lease tasks, run them
//!   through the execution backends and finalize each row
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Enqueuer   │
//!                      └──────┬───────┘
//!                             │ enqueue_bulk
//!                      ┌──────▼───────┐
//!                      │  Task Queue  │
//!                      └──────┬───────┘
//!                             │ lease
//!         ┌───────────────────┼───────────────────┐
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └────────── execution slots ────────────┘
//! ```
//!
//! # Reliability
//!
//! - **At-least-once**: an expired lease is handed to another worker
//! - **Retry**: uncaught backend failures are redelivered with exponential backoff
//! - **Dead letter queue**: tasks out of attempts are kept for inspection
//! - **Graceful shutdown**: workers finish their current row before stopping

pub mod memory_queue;
pub mod queue;
pub mod redis_queue;
pub mod state;
pub mod task;
pub mod worker_pool;

pub use memory_queue::MemoryTaskQueue;
pub use queue::{
    PruneItem, PruneOutcome, PruneReport, QueueError, QueueStats, Recovery, RetryOutcome,
    TaskPredicate, TaskQueue,
};
pub use redis_queue::RedisTaskQueue;
pub use state::{RowLifecycle, RowOutcome, RowState, TransitionError};
pub use task::{
    DeadLetter, Lease, RetryPolicy, RowTask, ScriptRef, TaskEnvelope, MAX_PRIORITY, PRIORITY_HIGH,
    PRIORITY_LOW,
};
pub use worker_pool::{PoolDeps, PoolError, PoolStats, RowProcessor, Worker, WorkerPool, WorkerPoolConfig};
