//! Validation front door for bulk jobs.
//!
//! Rejections happen before a job exists: a missing input or script id, or
//! a script the caller does not own, discards the upload and creates
//! nothing. Past validation the upload is persisted under the job's upload
//! directory and streamed by the [`Enqueuer`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::SubmitError;
use crate::execution::ScriptKind;
use crate::scheduler::ScriptRef;
use crate::storage::{JobLedger, JobStatus, NewJob, ScriptCatalog};

use super::enqueuer::{Enqueuer, IngestJob};

/// A bulk job request as received from a caller.
#[derive(Debug, Clone, Default)]
pub struct BulkSubmission {
    pub owner_id: i64,
    pub script_id: Option<i64>,
    /// Uploaded input; consumed (moved or deleted) by the submission.
    pub input_file: Option<PathBuf>,
    pub chunk_size: Option<usize>,
}

/// Returned once every row has been enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub job_id: Uuid,
    pub total_rows: u64,
}

/// Creates jobs from uploads.
pub struct Submission {
    ledger: Arc<dyn JobLedger>,
    catalog: Arc<dyn ScriptCatalog>,
    enqueuer: Enqueuer,
    uploads_path: PathBuf,
}

impl Submission {
    pub fn new(
        ledger: Arc<dyn JobLedger>,
        catalog: Arc<dyn ScriptCatalog>,
        enqueuer: Enqueuer,
        uploads_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ledger,
            catalog,
            enqueuer,
            uploads_path: uploads_path.into(),
        }
    }

    /// Validates the request, creates the job and enqueues every row.
    pub async fn submit_bulk(&self, request: BulkSubmission) -> Result<SubmitReceipt, SubmitError> {
        let upload = request
            .input_file
            .ok_or_else(|| SubmitError::Validation("inputFile is required".to_string()))?;

        let script_id = match request.script_id {
            Some(id) => id,
            None => {
                discard(&upload).await;
                return Err(SubmitError::Validation("script_id is required".to_string()));
            }
        };
        if request.chunk_size == Some(0) {
            discard(&upload).await;
            return Err(SubmitError::Validation(
                "chunkSize must be positive".to_string(),
            ));
        }

        let script = match self
            .catalog
            .find_owned_script(script_id, request.owner_id)
            .await
        {
            Ok(Some(script)) => script,
            Ok(None) => {
                discard(&upload).await;
                return Err(SubmitError::ScriptNotOwned(script_id));
            }
            Err(e) => {
                discard(&upload).await;
                return Err(e.into());
            }
        };

        let job_id = self
            .ledger
            .create_job(NewJob {
                owner_id: request.owner_id,
                script_id,
                script_path: script.file_path.display().to_string(),
                input_path: None,
            })
            .await?;

        let input = match self.persist_upload(job_id, &upload).await {
            Ok(path) => path,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to persist upload");
                if let Err(mark) = self.ledger.transition(job_id, JobStatus::Failed).await {
                    error!(job_id = %job_id, error = %mark, "Failed to mark job failed");
                }
                return Err(e.into());
            }
        };
        self.ledger
            .set_input_path(job_id, &input.display().to_string())
            .await?;

        info!(
            job_id = %job_id,
            script_id,
            owner_id = request.owner_id,
            input = %input.display(),
            "Created bulk job"
        );

        let kind = ScriptKind::resolve(&script.language, &script.file_path);
        let summary = self
            .enqueuer
            .ingest(IngestJob {
                job_id,
                script: ScriptRef {
                    script_id,
                    path: script.file_path,
                    kind,
                },
                input,
                chunk_size: request.chunk_size,
            })
            .await
            .map_err(|source| SubmitError::Ingest { job_id, source })?;

        Ok(SubmitReceipt {
            job_id,
            total_rows: summary.total_rows,
        })
    }

    /// Moves the upload to `job_{id}/input_{millis}.csv` under the uploads root.
    async fn persist_upload(&self, job_id: Uuid, upload: &Path) -> std::io::Result<PathBuf> {
        let dir = self.uploads_path.join(format!("job_{}", job_id));
        tokio::fs::create_dir_all(&dir).await?;
        let dest = dir.join(format!("input_{}.csv", Utc::now().timestamp_millis()));
        move_file(upload, &dest).await?;
        Ok(dest)
    }
}

/// Renames `src` to `dest`, copying then removing when a rename is not
/// possible (different filesystems).
pub async fn move_file(src: &Path, dest: &Path) -> std::io::Result<()> {
    if tokio::fs::rename(src, dest).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(src, dest).await?;
    tokio::fs::remove_file(src).await
}

async fn discard(upload: &Path) {
    match tokio::fs::remove_file(upload).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %upload.display(), error = %e, "Failed to discard upload"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::scheduler::{MemoryTaskQueue, TaskQueue};
    use crate::storage::{MemoryLedger, Script};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        ledger: Arc<MemoryLedger>,
        queue: Arc<MemoryTaskQueue>,
        submission: Submission,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(MemoryLedger::new());
        ledger
            .insert_script(Script {
                id: 7,
                owner_id: 1,
                name: "score".into(),
                language: "python".into(),
                file_path: PathBuf::from("/scripts/score.py"),
            })
            .await;
        let queue = Arc::new(MemoryTaskQueue::new(Duration::from_secs(60)));
        let enqueuer = Enqueuer::new(queue.clone(), ledger.clone(), Arc::new(MemoryCache::new()));
        let submission = Submission::new(
            ledger.clone(),
            ledger.clone(),
            enqueuer,
            dir.path().join("uploads"),
        );
        Fixture {
            dir,
            ledger,
            queue,
            submission,
        }
    }

    fn upload(f: &Fixture, csv: &str) -> PathBuf {
        let path = f.dir.path().join(format!("upload-{}.csv", Uuid::new_v4()));
        std::fs::write(&path, csv).unwrap();
        path
    }

    #[tokio::test]
    async fn test_submit_bulk_creates_job() {
        let f = fixture().await;
        let input = upload(&f, "a,b\n1,2\n3,4\n5,6\n");

        let receipt = f
            .submission
            .submit_bulk(BulkSubmission {
                owner_id: 1,
                script_id: Some(7),
                input_file: Some(input.clone()),
                chunk_size: None,
            })
            .await
            .unwrap();

        assert_eq!(receipt.total_rows, 3);
        assert!(!input.exists());

        let job = f.ledger.get_job(receipt.job_id).await.unwrap().unwrap();
        assert_eq!(job.total_items, 3);
        assert_eq!(job.script_path, "/scripts/score.py");
        let persisted = PathBuf::from(job.input_path.unwrap());
        assert!(persisted.exists());
        assert!(persisted
            .parent()
            .unwrap()
            .ends_with(format!("job_{}", receipt.job_id)));

        let lease = f.queue.lease(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(lease.task().script.kind, ScriptKind::Python);
    }

    #[tokio::test]
    async fn test_unowned_script_is_rejected_and_upload_removed() {
        let f = fixture().await;
        let input = upload(&f, "a\n1\n");

        let err = f
            .submission
            .submit_bulk(BulkSubmission {
                owner_id: 2,
                script_id: Some(7),
                input_file: Some(input.clone()),
                chunk_size: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, SubmitError::ScriptNotOwned(7)));
        assert!(!input.exists());
        assert_eq!(f.ledger.job_count().await, 0);
        assert_eq!(f.queue.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_missing_fields_are_rejected() {
        let f = fixture().await;

        let err = f
            .submission
            .submit_bulk(BulkSubmission {
                owner_id: 1,
                script_id: Some(7),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.is_rejection());

        let input = upload(&f, "a\n1\n");
        let err = f
            .submission
            .submit_bulk(BulkSubmission {
                owner_id: 1,
                script_id: None,
                input_file: Some(input.clone()),
                chunk_size: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Validation(_)));
        assert!(!input.exists());
        assert_eq!(f.ledger.job_count().await, 0);
    }

    #[tokio::test]
    async fn test_malformed_upload_fails_job() {
        let f = fixture().await;
        let input = upload(&f, "a\n\"open\n");

        let err = f
            .submission
            .submit_bulk(BulkSubmission {
                owner_id: 1,
                script_id: Some(7),
                input_file: Some(input),
                chunk_size: None,
            })
            .await
            .unwrap_err();

        let job_id = match err {
            SubmitError::Ingest { job_id, .. } => job_id,
            other => panic!("unexpected error: {other}"),
        };
        let job = f.ledger.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_move_file() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.csv");
        let dest = dir.path().join("b.csv");
        std::fs::write(&src, "x").unwrap();
        move_file(&src, &dest).await.unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "x");
    }
}
