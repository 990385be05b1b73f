//! Error types for job submission and ingestion.
//!
//! Subsystem errors (`DatabaseError`, `QueueError`, `CacheError`,
//! `StorageError`, `BackendError`, `CompileError`, `PoolError`) live next
//! to their subsystem; the two enums here cover the request path that
//! spans several of them.

use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::QueueError;
use crate::storage::{DatabaseError, StorageError};

/// Errors raised while streaming an input into row tasks.
///
/// Any of these fails the job; ingestion is never retried.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The input is not well-formed CSV.
    #[error("Malformed input at line {line}: {message}")]
    Malformed { line: u64, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Errors returned to the submitter of a bulk job.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// A required input is missing or invalid; nothing was created.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The script does not exist or belongs to someone else; nothing was created.
    #[error("Invalid script_id {0} (not owned)")]
    ScriptNotOwned(i64),

    /// The job was created but ingestion failed; the job is marked failed.
    #[error("Ingestion of job {job_id} failed: {source}")]
    Ingest {
        job_id: Uuid,
        #[source]
        source: IngestError,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SubmitError {
    /// True if the request was rejected before any job existed.
    pub fn is_rejection(&self) -> bool {
        matches!(self, SubmitError::Validation(_) | SubmitError::ScriptNotOwned(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_error_display() {
        let err = IngestError::Malformed {
            line: 7,
            message: "unterminated quoted field".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Malformed input at line 7: unterminated quoted field"
        );
    }

    #[test]
    fn test_submit_error_rejection() {
        assert!(SubmitError::Validation("inputFile is required".into()).is_rejection());
        assert!(SubmitError::ScriptNotOwned(4).is_rejection());

        let err = SubmitError::Ingest {
            job_id: Uuid::nil(),
            source: IngestError::Malformed {
                line: 1,
                message: "bad".into(),
            },
        };
        assert!(!err.is_rejection());
        assert!(err.to_string().contains("bad"));
    }
}
