//! In-process task queue with the same semantics as the Redis queue.
//!
//! Used by tests and by single-process deployments without Redis.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use super::queue::{
    PruneOutcome, PruneReport, QueueError, QueueStats, Recovery, RetryOutcome, TaskPredicate,
    TaskQueue, STALLED_OUT,
};
use super::task::{DeadLetter, Lease, RowTask, TaskEnvelope};

/// Upper bound on one wait between lease attempts, so delayed tasks become
/// leasable without a notification.
const MAX_IDLE_WAIT: Duration = Duration::from_millis(50);

struct Entry {
    envelope: TaskEnvelope,
    seq: u64,
}

type PendingKey = (Reverse<i32>, u64, Uuid);

#[derive(Default)]
struct State {
    entries: HashMap<Uuid, Entry>,
    pending: BTreeSet<PendingKey>,
    delayed: HashMap<Uuid, Instant>,
    leased: HashMap<Uuid, Instant>,
    dead_letter: Vec<DeadLetter>,
    seq: u64,
}

impl State {
    fn pending_key(&self, id: Uuid) -> Option<PendingKey> {
        self.entries
            .get(&id)
            .map(|e| (Reverse(e.envelope.task.priority), e.seq, id))
    }

    fn promote_due(&mut self, now: Instant) {
        let due: Vec<Uuid> = self
            .delayed
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            self.delayed.remove(&id);
            if let Some(key) = self.pending_key(id) {
                self.pending.insert(key);
            }
        }
    }

    fn dead_letter(&mut self, id: Uuid, error: &str) -> Option<TaskEnvelope> {
        self.leased.remove(&id);
        let entry = self.entries.remove(&id)?;
        self.dead_letter.push(DeadLetter {
            envelope: entry.envelope.clone(),
            error: error.to_string(),
            failed_at: Utc::now(),
        });
        Some(entry.envelope)
    }
}

/// Memory-backed implementation of [`TaskQueue`].
pub struct MemoryTaskQueue {
    state: Mutex<State>,
    notify: Notify,
    stall_timeout: Duration,
}

impl MemoryTaskQueue {
    pub fn new(stall_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            stall_timeout,
        }
    }

    fn deadline(&self) -> chrono::DateTime<Utc> {
        Utc::now()
            + chrono::Duration::from_std(self.stall_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(300))
    }

    /// Snapshot of dead-letter entries.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letter.clone()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue_bulk(&self, tasks: Vec<RowTask>) -> Result<usize, QueueError> {
        let count = tasks.len();
        {
            let mut state = self.state.lock().await;
            for task in tasks {
                state.seq += 1;
                let seq = state.seq;
                let id = task.id;
                state.pending.insert((Reverse(task.priority), seq, id));
                state.entries.insert(
                    id,
                    Entry {
                        envelope: TaskEnvelope::new(task),
                        seq,
                    },
                );
            }
        }
        if count > 0 {
            self.notify.notify_waiters();
        }
        Ok(count)
    }

    async fn lease(&self, wait: Duration) -> Result<Option<Lease>, QueueError> {
        let until = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.promote_due(now);

                if let Some(key) = state.pending.pop_first() {
                    let id = key.2;
                    state.leased.insert(id, now + self.stall_timeout);
                    if let Some(entry) = state.entries.get_mut(&id) {
                        entry.envelope.attempts += 1;
                        return Ok(Some(Lease {
                            envelope: entry.envelope.clone(),
                            deadline: self.deadline(),
                        }));
                    }
                    state.leased.remove(&id);
                    continue;
                }
            }

            let now = Instant::now();
            if now >= until {
                return Ok(None);
            }
            let nap = (until - now).min(MAX_IDLE_WAIT);
            let _ = tokio::time::timeout(nap, notified).await;
        }
    }

    async fn extend(&self, lease: &Lease) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let until = Instant::now() + self.stall_timeout;
        match state.leased.get_mut(&lease.task().id) {
            Some(deadline) => {
                *deadline = until;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ack(&self, lease: &Lease) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let id = lease.task().id;
        state.leased.remove(&id);
        state.entries.remove(&id);
        Ok(())
    }

    async fn retry(&self, lease: &Lease, error: &str) -> Result<RetryOutcome, QueueError> {
        let mut state = self.state.lock().await;
        let id = lease.task().id;
        if !state.entries.contains_key(&id) {
            return Err(QueueError::TaskNotFound(id));
        }

        if !lease.envelope.should_retry() {
            state.dead_letter(id, error);
            return Ok(RetryOutcome::DeadLettered);
        }

        let delay = lease.envelope.next_backoff();
        state.leased.remove(&id);
        state.delayed.insert(id, Instant::now() + delay);
        Ok(RetryOutcome::Requeued { delay })
    }

    async fn remove_pending(&self, predicate: &TaskPredicate) -> Result<PruneReport, QueueError> {
        let mut state = self.state.lock().await;
        let mut report = PruneReport::default();

        let waiting: Vec<Uuid> = state
            .pending
            .iter()
            .map(|k| k.2)
            .chain(state.delayed.keys().copied())
            .collect();

        for id in waiting {
            let Some(entry) = state.entries.get(&id) else {
                continue;
            };
            if !predicate(&entry.envelope.task) {
                continue;
            }
            let task = entry.envelope.task.clone();
            let key = (Reverse(task.priority), entry.seq, id);
            let removed = state.pending.remove(&key) | state.delayed.remove(&id).is_some();
            if removed {
                state.entries.remove(&id);
                report.push(&task, PruneOutcome::Removed);
            } else {
                report.push(&task, PruneOutcome::AlreadyGone);
            }
        }

        Ok(report)
    }

    async fn recover_stalled(&self) -> Result<Recovery, QueueError> {
        let recovery = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let expired: Vec<Uuid> = state
                .leased
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(id, _)| *id)
                .collect();

            let mut recovery = Recovery::default();
            for id in expired {
                let retry = state
                    .entries
                    .get(&id)
                    .map(|e| e.envelope.should_retry())
                    .unwrap_or(false);
                if retry {
                    state.leased.remove(&id);
                    if let Some(key) = state.pending_key(id) {
                        state.pending.insert(key);
                        recovery.requeued += 1;
                    }
                } else if let Some(envelope) = state.dead_letter(id, STALLED_OUT) {
                    recovery.dead_lettered.push(envelope);
                }
            }
            recovery
        };

        if recovery.requeued > 0 {
            self.notify.notify_waiters();
        }
        Ok(recovery)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.state.lock().await;
        Ok(QueueStats {
            pending: state.pending.len(),
            leased: state.leased.len(),
            delayed: state.delayed.len(),
            dead_letter: state.dead_letter.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::{fixtures, PRIORITY_HIGH, PRIORITY_LOW};

    const NO_WAIT: Duration = Duration::from_millis(0);

    fn queue() -> MemoryTaskQueue {
        MemoryTaskQueue::new(Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_lease_honors_priority_then_fifo() {
        let q = queue();
        let job = Uuid::new_v4();
        q.enqueue_bulk(vec![
            fixtures::task(job, 1, PRIORITY_LOW),
            fixtures::task(job, 2, PRIORITY_HIGH),
            fixtures::task(job, 3, PRIORITY_HIGH),
        ])
        .await
        .unwrap();

        let order: Vec<u64> = {
            let mut order = Vec::new();
            while let Some(lease) = q.lease(NO_WAIT).await.unwrap() {
                order.push(lease.task().row_index);
                q.ack(&lease).await.unwrap();
            }
            order
        };
        assert_eq!(order, vec![2, 3, 1]);
        assert_eq!(q.stats().await.unwrap(), QueueStats::default());
    }

    #[tokio::test]
    async fn test_lease_waits_for_enqueue() {
        let q = std::sync::Arc::new(queue());
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.lease(Duration::from_secs(5)).await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.enqueue_bulk(vec![fixtures::task(Uuid::new_v4(), 1, PRIORITY_HIGH)])
            .await
            .unwrap();

        let lease = waiter.await.unwrap().expect("lease should arrive");
        assert_eq!(lease.task().row_index, 1);
    }

    #[tokio::test]
    async fn test_retry_backs_off_then_dead_letters() {
        let q = queue();
        // fixtures use 3 attempts with a 10ms base
        q.enqueue_bulk(vec![fixtures::task(Uuid::new_v4(), 1, PRIORITY_HIGH)])
            .await
            .unwrap();

        let first = q.lease(NO_WAIT).await.unwrap().unwrap();
        assert_eq!(first.attempt(), 1);
        let outcome = q.retry(&first, "boom").await.unwrap();
        assert_eq!(
            outcome,
            RetryOutcome::Requeued {
                delay: Duration::from_millis(10)
            }
        );
        assert_eq!(q.stats().await.unwrap().delayed, 1);

        let second = q.lease(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(second.attempt(), 2);
        q.retry(&second, "boom").await.unwrap();

        let third = q.lease(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(third.attempt(), 3);
        assert_eq!(
            q.retry(&third, "boom again").await.unwrap(),
            RetryOutcome::DeadLettered
        );

        let stats = q.stats().await.unwrap();
        assert_eq!(stats.outstanding(), 0);
        assert_eq!(stats.dead_letter, 1);
        assert_eq!(q.dead_letters().await[0].error, "boom again");
    }

    #[tokio::test]
    async fn test_remove_pending_only_touches_waiting_tasks() {
        let q = queue();
        let job = Uuid::new_v4();
        let other = Uuid::new_v4();
        q.enqueue_bulk(vec![
            fixtures::task(job, 1, PRIORITY_HIGH),
            fixtures::task(job, 2, PRIORITY_HIGH),
            fixtures::task(other, 1, PRIORITY_HIGH),
        ])
        .await
        .unwrap();
        let leased = q.lease(NO_WAIT).await.unwrap().unwrap();
        assert_eq!(leased.task().job_id, job);

        let report = q
            .remove_pending(&move |t: &RowTask| t.job_id == job)
            .await
            .unwrap();
        assert_eq!(report.removed(), 1);
        assert!(report.is_clean());

        let stats = q.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.leased, 1);
    }

    #[tokio::test]
    async fn test_recover_stalled_lease() {
        let q = MemoryTaskQueue::new(Duration::from_millis(200));
        q.enqueue_bulk(vec![fixtures::task(Uuid::new_v4(), 1, PRIORITY_HIGH)])
            .await
            .unwrap();
        let _abandoned = q.lease(NO_WAIT).await.unwrap().unwrap();

        assert!(q.recover_stalled().await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(q.recover_stalled().await.unwrap().requeued, 1);

        let again = q.lease(NO_WAIT).await.unwrap().unwrap();
        assert_eq!(again.attempt(), 2);
    }

    #[tokio::test]
    async fn test_extend_keeps_lease_alive() {
        let q = MemoryTaskQueue::new(Duration::from_millis(200));
        q.enqueue_bulk(vec![fixtures::task(Uuid::new_v4(), 1, PRIORITY_HIGH)])
            .await
            .unwrap();
        let lease = q.lease(NO_WAIT).await.unwrap().unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(q.extend(&lease).await.unwrap());
        }
        assert!(q.recover_stalled().await.unwrap().is_empty());
        assert_eq!(q.stats().await.unwrap().leased, 1);

        q.ack(&lease).await.unwrap();
        assert!(!q.extend(&lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_recover_stalled_returns_exhausted_tasks() {
        let q = MemoryTaskQueue::new(Duration::from_millis(50));
        let job = Uuid::new_v4();
        // fixtures allow 3 attempts
        q.enqueue_bulk(vec![fixtures::task(job, 1, PRIORITY_HIGH)])
            .await
            .unwrap();

        for attempt in 1..=3 {
            let lease = q.lease(NO_WAIT).await.unwrap().unwrap();
            assert_eq!(lease.attempt(), attempt);
            tokio::time::sleep(Duration::from_millis(80)).await;
            let recovery = q.recover_stalled().await.unwrap();
            if attempt < 3 {
                assert_eq!(recovery.requeued, 1);
                assert!(recovery.dead_lettered.is_empty());
            } else {
                assert_eq!(recovery.requeued, 0);
                assert_eq!(recovery.dead_lettered.len(), 1);
                assert_eq!(recovery.dead_lettered[0].task.job_id, job);
            }
        }

        let stats = q.stats().await.unwrap();
        assert_eq!(stats.outstanding(), 0);
        assert_eq!(stats.dead_letter, 1);
        assert_eq!(q.dead_letters().await[0].error, STALLED_OUT);
    }
}
