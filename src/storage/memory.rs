//! In-memory ledger and script catalog.
//!
//! Used by tests and single-process runs. Every operation takes the lock
//! once, so increments are as atomic as the Postgres single-row update.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::database::DatabaseError;
use super::ledger::{
    CounterDelta, Job, JobCounters, JobLedger, JobStatus, NewJob, Script, ScriptCatalog,
};

/// Ledger backed by a map of jobs.
#[derive(Default)]
pub struct MemoryLedger {
    jobs: Mutex<HashMap<Uuid, Job>>,
    scripts: Mutex<HashMap<i64, Script>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a script in the catalog.
    pub async fn insert_script(&self, script: Script) {
        self.scripts.lock().await.insert(script.id, script);
    }

    /// Number of jobs ever created.
    pub async fn job_count(&self) -> usize {
        self.jobs.lock().await.len()
    }
}

fn not_found(id: Uuid) -> DatabaseError {
    DatabaseError::NotFound(format!("job {}", id))
}

#[async_trait]
impl JobLedger for MemoryLedger {
    async fn create_job(&self, job: NewJob) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        let record = Job {
            id,
            owner_id: job.owner_id,
            script_id: job.script_id,
            script_path: job.script_path,
            input_path: job.input_path,
            status: JobStatus::Queued,
            total_items: 0,
            processed_rows: 0,
            success_count: 0,
            failed_count: 0,
            result_path: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        self.jobs.lock().await.insert(id, record);
        Ok(id)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn increment(
        &self,
        id: Uuid,
        delta: CounterDelta,
    ) -> Result<JobCounters, DatabaseError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or_else(|| not_found(id))?;
        job.processed_rows += delta.processed_rows;
        job.success_count += delta.success_count;
        job.failed_count += delta.failed_count;
        Ok(job.counters())
    }

    async fn transition(&self, id: Uuid, to: JobStatus) -> Result<bool, DatabaseError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or_else(|| not_found(id))?;
        if !job.status.can_advance_to(to) {
            return Ok(false);
        }
        let now = Utc::now();
        if to == JobStatus::Running && job.started_at.is_none() {
            job.started_at = Some(now);
        }
        if to.is_terminal() {
            job.finished_at = Some(now);
        }
        job.status = to;
        Ok(true)
    }

    async fn set_input_path(&self, id: Uuid, path: &str) -> Result<(), DatabaseError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or_else(|| not_found(id))?;
        job.input_path = Some(path.to_string());
        Ok(())
    }

    async fn set_total_items(&self, id: Uuid, total: i64) -> Result<JobCounters, DatabaseError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or_else(|| not_found(id))?;
        job.total_items = total;
        Ok(job.counters())
    }

    async fn set_result_path(&self, id: Uuid, path: &str) -> Result<(), DatabaseError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or_else(|| not_found(id))?;
        job.result_path = Some(path.to_string());
        Ok(())
    }
}

#[async_trait]
impl ScriptCatalog for MemoryLedger {
    async fn find_owned_script(
        &self,
        script_id: i64,
        owner_id: i64,
    ) -> Result<Option<Script>, DatabaseError> {
        Ok(self
            .scripts
            .lock()
            .await
            .get(&script_id)
            .filter(|s| s.owner_id == owner_id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn new_job() -> NewJob {
        NewJob {
            owner_id: 7,
            script_id: 1,
            script_path: "/scripts/run.js".to_string(),
            input_path: None,
        }
    }

    #[tokio::test]
    async fn test_concurrent_increments_keep_invariant() {
        let ledger = Arc::new(MemoryLedger::new());
        let id = ledger.create_job(new_job()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..50 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                let counters = ledger
                    .increment(id, CounterDelta::for_outcome(i % 3 != 0))
                    .await
                    .unwrap();
                assert_eq!(
                    counters.success_count + counters.failed_count,
                    counters.processed_rows
                );
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let job = ledger.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.processed_rows, 50);
        assert_eq!(job.failed_count, 17);
        assert_eq!(job.success_count, 33);
    }

    #[tokio::test]
    async fn test_transition_is_forward_only() {
        let ledger = MemoryLedger::new();
        let id = ledger.create_job(new_job()).await.unwrap();

        assert!(ledger.transition(id, JobStatus::Running).await.unwrap());
        assert!(!ledger.transition(id, JobStatus::Running).await.unwrap());
        assert!(!ledger.transition(id, JobStatus::Queued).await.unwrap());
        assert!(ledger.transition(id, JobStatus::Aborted).await.unwrap());
        assert!(!ledger.transition(id, JobStatus::Completed).await.unwrap());

        let job = ledger.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Aborted);
        assert!(job.started_at.is_some());
        assert!(job.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let ledger = MemoryLedger::new();
        let err = ledger
            .increment(Uuid::new_v4(), CounterDelta::success())
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_script_lookup_checks_owner() {
        let ledger = MemoryLedger::new();
        ledger
            .insert_script(Script {
                id: 3,
                owner_id: 7,
                name: "run".to_string(),
                language: "javascript".to_string(),
                file_path: PathBuf::from("/scripts/run.js"),
            })
            .await;

        assert!(ledger.find_owned_script(3, 7).await.unwrap().is_some());
        assert!(ledger.find_owned_script(3, 8).await.unwrap().is_none());
        assert!(ledger.find_owned_script(4, 7).await.unwrap().is_none());
    }
}
