//! Job ledger and script catalog contracts.
//!
//! The ledger owns the durable record of every job. Callers never overwrite
//! counters: they go through [`JobLedger::increment`], which must be a single
//! atomic update, and status changes go through [`JobLedger::transition`],
//! which only ever moves a job forward.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::database::DatabaseError;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created, rows are being or have been enqueued.
    Queued,
    /// At least one row has started executing.
    Running,
    /// All rows finalized and results compiled.
    Completed,
    /// Ingestion failed.
    Failed,
    /// Cancelled by the owner.
    Aborted,
}

impl JobStatus {
    /// All statuses in lifecycle order.
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Aborted,
    ];

    /// Returns the string stored in the ledger.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Aborted => "aborted",
        }
    }

    /// Returns true if no further transitions are allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Aborted
        )
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Running => 1,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Aborted => 2,
        }
    }

    /// Returns true if a job in this status may move to `next`.
    ///
    /// Transitions only go forward along queued → running → terminal, and a
    /// terminal status is final.
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    /// Statuses from which a job may move to `target`.
    pub fn predecessors(target: JobStatus) -> Vec<JobStatus> {
        JobStatus::ALL
            .into_iter()
            .filter(|s| s.can_advance_to(target))
            .collect()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "aborted" => Ok(JobStatus::Aborted),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Durable record of one batch job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub owner_id: i64,
    pub script_id: i64,
    pub script_path: String,
    pub input_path: Option<String>,
    pub status: JobStatus,
    /// Number of accepted rows; zero until ingestion finishes.
    pub total_items: i64,
    pub processed_rows: i64,
    pub success_count: i64,
    pub failed_count: i64,
    pub result_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Snapshot of the counter columns.
    pub fn counters(&self) -> JobCounters {
        JobCounters {
            total_items: self.total_items,
            processed_rows: self.processed_rows,
            success_count: self.success_count,
            failed_count: self.failed_count,
            status: self.status,
        }
    }
}

/// Fields needed to create a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub owner_id: i64,
    pub script_id: i64,
    pub script_path: String,
    pub input_path: Option<String>,
}

/// Amounts added by one atomic increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterDelta {
    pub processed_rows: i64,
    pub success_count: i64,
    pub failed_count: i64,
}

impl CounterDelta {
    /// One processed row that succeeded.
    pub fn success() -> Self {
        Self {
            processed_rows: 1,
            success_count: 1,
            failed_count: 0,
        }
    }

    /// One processed row that failed.
    pub fn failure() -> Self {
        Self {
            processed_rows: 1,
            success_count: 0,
            failed_count: 1,
        }
    }

    /// Delta for a row outcome.
    pub fn for_outcome(succeeded: bool) -> Self {
        if succeeded {
            Self::success()
        } else {
            Self::failure()
        }
    }
}

/// Counter values as returned by the ledger after an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounters {
    pub total_items: i64,
    pub processed_rows: i64,
    pub success_count: i64,
    pub failed_count: i64,
    pub status: JobStatus,
}

impl JobCounters {
    /// True once every accepted row has been finalized.
    ///
    /// A job whose total is still unknown (zero) is never complete here;
    /// zero-row jobs are completed by ingestion.
    pub fn is_complete(&self) -> bool {
        self.total_items > 0 && self.processed_rows >= self.total_items
    }
}

/// A user-owned script as recorded by the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    /// Declared language, e.g. `python` or `javascript`.
    pub language: String,
    pub file_path: PathBuf,
}

/// Durable per-job record store.
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Creates a job in `queued` status and returns its id.
    async fn create_job(&self, job: NewJob) -> Result<Uuid, DatabaseError>;

    /// Loads a job.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Atomically adds `delta` to the counters and returns the new values.
    async fn increment(&self, id: Uuid, delta: CounterDelta)
        -> Result<JobCounters, DatabaseError>;

    /// Moves the job to `to` if its current status allows it.
    ///
    /// Returns `false` when the job was already at or past `to`. Sets
    /// `started_at` on entry to running and `finished_at` on entry to a
    /// terminal status.
    async fn transition(&self, id: Uuid, to: JobStatus) -> Result<bool, DatabaseError>;

    /// Records where the persisted input lives.
    async fn set_input_path(&self, id: Uuid, path: &str) -> Result<(), DatabaseError>;

    /// Records the number of accepted rows and returns the counters.
    async fn set_total_items(&self, id: Uuid, total: i64) -> Result<JobCounters, DatabaseError>;

    /// Records the primary consolidated artifact.
    async fn set_result_path(&self, id: Uuid, path: &str) -> Result<(), DatabaseError>;
}

/// Lookup of scripts by owner.
#[async_trait]
pub trait ScriptCatalog: Send + Sync {
    /// Returns the script only if it exists and belongs to `owner_id`.
    async fn find_owned_script(
        &self,
        script_id: i64,
        owner_id: i64,
    ) -> Result<Option<Script>, DatabaseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_only_moves_forward() {
        assert!(JobStatus::Queued.can_advance_to(JobStatus::Running));
        assert!(JobStatus::Queued.can_advance_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_advance_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_advance_to(JobStatus::Aborted));

        assert!(!JobStatus::Running.can_advance_to(JobStatus::Queued));
        assert!(!JobStatus::Running.can_advance_to(JobStatus::Running));
        assert!(!JobStatus::Completed.can_advance_to(JobStatus::Aborted));
        assert!(!JobStatus::Aborted.can_advance_to(JobStatus::Completed));
    }

    #[test]
    fn test_predecessors() {
        assert_eq!(
            JobStatus::predecessors(JobStatus::Running),
            vec![JobStatus::Queued]
        );
        assert_eq!(
            JobStatus::predecessors(JobStatus::Completed),
            vec![JobStatus::Queued, JobStatus::Running]
        );
        assert!(JobStatus::predecessors(JobStatus::Queued).is_empty());
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_counter_delta_keeps_sum() {
        for delta in [CounterDelta::success(), CounterDelta::failure()] {
            assert_eq!(delta.success_count + delta.failed_count, delta.processed_rows);
        }
    }

    #[test]
    fn test_completion_requires_known_total() {
        let mut counters = JobCounters {
            total_items: 0,
            processed_rows: 2,
            success_count: 2,
            failed_count: 0,
            status: JobStatus::Running,
        };
        assert!(!counters.is_complete());

        counters.total_items = 3;
        assert!(!counters.is_complete());

        counters.total_items = 2;
        assert!(counters.is_complete());
    }
}
