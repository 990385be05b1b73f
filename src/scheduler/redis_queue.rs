//! Redis-backed priority task queue.
//!
//! # Key layout
//!
//! - `{prefix}:tasks`: hash, task id → task JSON (immutable)
//! - `{prefix}:attempts`: hash, task id → deliveries so far
//! - `{prefix}:scores`: hash, task id → pending score
//! - `{prefix}:pending`: sorted set ordered by priority, then enqueue order
//! - `{prefix}:delayed`: sorted set, score = due time (ms)
//! - `{prefix}:leased`: sorted set, score = lease deadline (ms)
//! - `{prefix}:dead_letter`: list of dead-letter entries
//! - `{prefix}:seq`: enqueue counter
//!
//! Leasing runs as one Lua script: due delayed tasks are promoted, the best
//! pending task is popped and recorded as leased, and its attempt counter is
//! bumped. A live worker pushes its deadline out with `extend`; a worker
//! that dies leaves its task in `leased` until `recover_stalled` finds the
//! expired deadline.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, warn};

use super::queue::{
    PruneOutcome, PruneReport, QueueError, QueueStats, Recovery, RetryOutcome, TaskPredicate,
    TaskQueue, STALLED_OUT,
};
use super::task::{DeadLetter, Lease, RowTask, TaskEnvelope, MAX_PRIORITY};

/// Spacing between priority bands in the pending score.
const PRIORITY_BAND: f64 = 1e12;

/// Interval between lease attempts while waiting for work.
const LEASE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Ids fetched per round trip while pruning.
const PRUNE_BATCH: usize = 500;

const LEASE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  local score = redis.call('HGET', KEYS[5], id)
  if score then
    redis.call('ZADD', KEYS[1], score, id)
  end
end
local popped = redis.call('ZPOPMIN', KEYS[1])
if #popped == 0 then
  return false
end
local id = popped[1]
local raw = redis.call('HGET', KEYS[4], id)
if not raw then
  redis.call('HDEL', KEYS[5], id)
  redis.call('HDEL', KEYS[6], id)
  return false
end
local attempts = redis.call('HINCRBY', KEYS[6], id, 1)
redis.call('ZADD', KEYS[3], ARGV[2], id)
return {raw, attempts}
"#;

fn pending_score(priority: i32, seq: u64) -> f64 {
    (MAX_PRIORITY - priority.clamp(0, MAX_PRIORITY)) as f64 * PRIORITY_BAND + seq as f64
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Redis-backed implementation of [`TaskQueue`].
pub struct RedisTaskQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    prefix: String,
    stall_timeout: Duration,
    lease_script: redis::Script,
}

impl RedisTaskQueue {
    /// Connects to Redis and creates a queue under `prefix`.
    pub async fn connect(
        redis_url: &str,
        prefix: &str,
        stall_timeout: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, prefix, stall_timeout))
    }

    /// Creates a queue from an existing ConnectionManager.
    ///
    /// Useful when sharing a connection with the cache.
    pub fn from_connection(redis: ConnectionManager, prefix: &str, stall_timeout: Duration) -> Self {
        Self {
            redis,
            prefix: prefix.to_string(),
            stall_timeout,
            lease_script: redis::Script::new(LEASE_SCRIPT),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }

    fn deadline(&self) -> chrono::DateTime<Utc> {
        Utc::now()
            + chrono::Duration::from_std(self.stall_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(300))
    }

    async fn try_lease(&self) -> Result<Option<Lease>, QueueError> {
        let mut conn = self.redis.clone();
        let now = now_ms();
        let deadline = self.deadline();

        let leased: Option<(String, u32)> = self
            .lease_script
            .key(self.key("pending"))
            .key(self.key("delayed"))
            .key(self.key("leased"))
            .key(self.key("tasks"))
            .key(self.key("scores"))
            .key(self.key("attempts"))
            .arg(now)
            .arg(deadline.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        match leased {
            Some((raw, attempts)) => {
                let task: RowTask = serde_json::from_str(&raw)?;
                Ok(Some(Lease {
                    envelope: TaskEnvelope { task, attempts },
                    deadline,
                }))
            }
            None => Ok(None),
        }
    }

    /// Removes every trace of a task from the bookkeeping hashes.
    fn forget(&self, pipe: &mut redis::Pipeline, id: &str) {
        pipe.hdel(self.key("tasks"), id)
            .hdel(self.key("scores"), id)
            .hdel(self.key("attempts"), id);
    }

    async fn dead_letter(&self, envelope: TaskEnvelope, error: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let id = envelope.task.id.to_string();
        let entry = serde_json::to_string(&DeadLetter {
            envelope,
            error: error.to_string(),
            failed_at: Utc::now(),
        })?;

        let mut pipe = redis::pipe();
        pipe.atomic().zrem(self.key("leased"), &id);
        self.forget(&mut pipe, &id);
        pipe.rpush(self.key("dead_letter"), entry);
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Peeks at dead-letter entries without removing them.
    pub async fn peek_dead_letter(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        let mut conn = self.redis.clone();
        let data: Vec<String> = conn
            .lrange(self.key("dead_letter"), 0, limit as isize - 1)
            .await?;
        data.iter()
            .map(|s| serde_json::from_str(s).map_err(QueueError::from))
            .collect()
    }

    /// Deletes every key of this queue.
    ///
    /// **Warning**: This permanently deletes all tasks. Use with caution.
    pub async fn clear(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        for name in [
            "tasks",
            "attempts",
            "scores",
            "pending",
            "delayed",
            "leased",
            "dead_letter",
            "seq",
        ] {
            pipe.del(self.key(name));
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue_bulk(&self, tasks: Vec<RowTask>) -> Result<usize, QueueError> {
        if tasks.is_empty() {
            return Ok(0);
        }
        let mut conn = self.redis.clone();

        // Reserve a contiguous block of sequence numbers
        let count = tasks.len() as i64;
        let last: i64 = conn.incr(self.key("seq"), count).await?;
        let first = (last - count + 1).max(0) as u64;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (offset, task) in tasks.iter().enumerate() {
            let id = task.id.to_string();
            let score = pending_score(task.priority, first + offset as u64);
            pipe.hset(self.key("tasks"), &id, serde_json::to_string(task)?)
                .hset(self.key("scores"), &id, score)
                .hset(self.key("attempts"), &id, 0)
                .zadd(self.key("pending"), &id, score);
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(tasks.len())
    }

    async fn lease(&self, wait: Duration) -> Result<Option<Lease>, QueueError> {
        let started = tokio::time::Instant::now();
        loop {
            if let Some(lease) = self.try_lease().await? {
                return Ok(Some(lease));
            }
            let elapsed = started.elapsed();
            if elapsed >= wait {
                return Ok(None);
            }
            tokio::time::sleep(LEASE_POLL_INTERVAL.min(wait - elapsed)).await;
        }
    }

    async fn extend(&self, lease: &Lease) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let id = lease.task().id.to_string();
        // XX only touches members that are still leased
        let (held, _): (Option<f64>, i64) = redis::pipe()
            .atomic()
            .zscore(self.key("leased"), &id)
            .cmd("ZADD")
            .arg(self.key("leased"))
            .arg("XX")
            .arg(self.deadline().timestamp_millis())
            .arg(&id)
            .query_async(&mut conn)
            .await?;
        Ok(held.is_some())
    }

    async fn ack(&self, lease: &Lease) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let id = lease.task().id.to_string();

        let mut pipe = redis::pipe();
        pipe.atomic().zrem(self.key("leased"), &id);
        self.forget(&mut pipe, &id);
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn retry(&self, lease: &Lease, error: &str) -> Result<RetryOutcome, QueueError> {
        if !lease.envelope.should_retry() {
            warn!(
                task_id = %lease.task().id,
                job_id = %lease.task().job_id,
                attempts = lease.attempt(),
                error,
                "Task exhausted its attempts, moving to dead letter"
            );
            self.dead_letter(lease.envelope.clone(), error).await?;
            return Ok(RetryOutcome::DeadLettered);
        }

        let mut conn = self.redis.clone();
        let id = lease.task().id.to_string();
        let delay = lease.envelope.next_backoff();
        let due = now_ms() + delay.as_millis() as i64;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrem(self.key("leased"), &id)
            .zadd(self.key("delayed"), &id, due);
        pipe.query_async::<_, ()>(&mut conn).await?;

        debug!(task_id = %id, delay_ms = delay.as_millis() as u64, "Task scheduled for retry");
        Ok(RetryOutcome::Requeued { delay })
    }

    async fn remove_pending(&self, predicate: &TaskPredicate) -> Result<PruneReport, QueueError> {
        let mut conn = self.redis.clone();
        let mut ids: Vec<String> = conn.zrange(self.key("pending"), 0, -1).await?;
        let delayed: Vec<String> = conn.zrange(self.key("delayed"), 0, -1).await?;
        ids.extend(delayed);

        let mut report = PruneReport::default();
        for chunk in ids.chunks(PRUNE_BATCH) {
            let raws: Vec<Option<String>> = redis::cmd("HMGET")
                .arg(self.key("tasks"))
                .arg(chunk)
                .query_async(&mut conn)
                .await?;

            let matched: Vec<RowTask> = raws
                .into_iter()
                .flatten()
                .filter_map(|raw| serde_json::from_str::<RowTask>(&raw).ok())
                .filter(|task| predicate(task))
                .collect();
            if matched.is_empty() {
                continue;
            }

            let mut pipe = redis::pipe();
            for task in &matched {
                let id = task.id.to_string();
                pipe.zrem(self.key("pending"), &id)
                    .zrem(self.key("delayed"), &id);
            }
            let removed: Vec<i64> = match pipe.query_async(&mut conn).await {
                Ok(removed) => removed,
                Err(e) => {
                    for task in &matched {
                        report.push(task, PruneOutcome::Failed(e.to_string()));
                    }
                    continue;
                }
            };

            let mut cleanup = redis::pipe();
            for (task, pair) in matched.iter().zip(removed.chunks(2)) {
                if pair.iter().sum::<i64>() > 0 {
                    self.forget(&mut cleanup, &task.id.to_string());
                    report.push(task, PruneOutcome::Removed);
                } else {
                    report.push(task, PruneOutcome::AlreadyGone);
                }
            }
            if let Err(e) = cleanup.query_async::<_, ()>(&mut conn).await {
                // Removed from the schedule already; only bookkeeping leaked
                warn!(error = %e, "Failed to clean up pruned task data");
            }
        }

        Ok(report)
    }

    async fn recover_stalled(&self) -> Result<Recovery, QueueError> {
        let mut conn = self.redis.clone();
        let expired: Vec<String> = conn
            .zrangebyscore(self.key("leased"), "-inf", now_ms())
            .await?;

        let mut recovery = Recovery::default();
        for id in expired {
            // Another worker may be recovering the same lease
            let claimed: i64 = conn.zrem(self.key("leased"), &id).await?;
            if claimed == 0 {
                continue;
            }

            let raw: Option<String> = conn.hget(self.key("tasks"), &id).await?;
            let Some(raw) = raw else { continue };
            let task: RowTask = match serde_json::from_str(&raw) {
                Ok(task) => task,
                Err(e) => {
                    warn!(task_id = %id, error = %e, "Dropping undecodable stalled task");
                    let mut pipe = redis::pipe();
                    self.forget(&mut pipe, &id);
                    pipe.query_async::<_, ()>(&mut conn).await?;
                    continue;
                }
            };
            let attempts: Option<u32> = conn.hget(self.key("attempts"), &id).await?;
            let envelope = TaskEnvelope {
                task,
                attempts: attempts.unwrap_or(0),
            };

            if envelope.should_retry() {
                let score: Option<f64> = conn.hget(self.key("scores"), &id).await?;
                let score = score.unwrap_or_else(|| pending_score(envelope.task.priority, 0));
                conn.zadd::<_, _, _, ()>(self.key("pending"), &id, score)
                    .await?;
                recovery.requeued += 1;
            } else {
                warn!(
                    task_id = %id,
                    job_id = %envelope.task.job_id,
                    attempts = envelope.attempts,
                    "Stalled task exhausted its attempts, moving to dead letter"
                );
                self.dead_letter(envelope.clone(), STALLED_OUT).await?;
                recovery.dead_lettered.push(envelope);
            }
        }

        Ok(recovery)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.redis.clone();
        let (pending, leased, delayed, dead_letter): (usize, usize, usize, usize) = redis::pipe()
            .zcard(self.key("pending"))
            .zcard(self.key("leased"))
            .zcard(self.key("delayed"))
            .llen(self.key("dead_letter"))
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            pending,
            leased,
            delayed,
            dead_letter,
        })
    }
}
