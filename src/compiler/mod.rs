//! Result compiler.
//!
//! Runs once a job's processed rows reach its total and turns the per-row
//! artifacts under `job_{id}/rows/` into consolidated outputs under
//! `job_{id}/results/`:
//!
//! | Row artifacts | Consolidated output |
//! |---|---|
//! | `row_N.json` | `master_results.csv` (`rowIndex,result_json`, one line per row) |
//! | `row_N.csv` | `combined.csv` (header from the first file only) |
//! | anything else | `outputs_{ext}.tar.gz` per extension plus `outputs_all.tar.gz` |
//!
//! Compilation reads only the row directory and rewrites every output
//! atomically, so running it again over the same rows yields the same
//! content. Concurrent finalizers may all trigger it.

pub mod archive;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{progress_channel, SharedCache};
use crate::metrics::MetricsCollector;
use crate::storage::{DatabaseError, JobLedger, JobStatus, RowArtifact, RowStore, StorageError};

/// File name of the structured-output summary.
pub const MASTER_RESULTS: &str = "master_results.csv";

/// File name of the concatenated tabular output.
pub const COMBINED_CSV: &str = "combined.csv";

/// File name of the catch-all bundle.
pub const ALL_OUTPUTS: &str = "outputs_all.tar.gz";

const MASTER_HEADER: &str = "rowIndex,result_json";

/// Errors raised while compiling.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Compilation task failed: {0}")]
    Join(String),
}

/// Outcome of one compilation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompileReport {
    pub job_id: Uuid,
    /// Row artifacts consumed, by type group.
    pub json_rows: usize,
    pub csv_rows: usize,
    pub other_files: usize,
    /// Every consolidated file written.
    pub artifacts: Vec<PathBuf>,
    /// Recorded as the job's result path.
    pub primary: Option<PathBuf>,
    /// True if this run moved the job to `completed`.
    pub completed_now: bool,
}

/// Row artifacts grouped by detected output type.
#[derive(Debug, Default)]
struct Groups {
    json: Vec<RowArtifact>,
    csv: Vec<RowArtifact>,
    other: BTreeMap<String, Vec<RowArtifact>>,
}

impl Groups {
    fn from_artifacts(artifacts: Vec<RowArtifact>) -> Self {
        let mut groups = Groups::default();
        for artifact in artifacts {
            match artifact.extension.as_str() {
                "json" => groups.json.push(artifact),
                "csv" => groups.csv.push(artifact),
                ext => groups.other.entry(ext.to_string()).or_default().push(artifact),
            }
        }
        groups
    }
}

/// Quotes a CSV field, doubling embedded quotes.
fn csv_quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

async fn blocking<F>(f: F) -> Result<(), CompileError>
where
    F: FnOnce() -> std::io::Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CompileError::Join(e.to_string()))??;
    Ok(())
}

/// Builds consolidated artifacts and completes jobs.
pub struct ResultCompiler {
    ledger: Arc<dyn JobLedger>,
    store: RowStore,
    cache: Option<Arc<dyn SharedCache>>,
    metrics: MetricsCollector,
}

impl ResultCompiler {
    pub fn new(ledger: Arc<dyn JobLedger>, store: RowStore) -> Self {
        Self {
            ledger,
            store,
            cache: None,
            metrics: MetricsCollector::new(),
        }
    }

    /// Publishes a completion message when a job completes.
    pub fn with_cache(mut self, cache: Arc<dyn SharedCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Compiles if every row of the job has been finalized.
    ///
    /// Returns `None` when the job is not complete yet, or was failed or
    /// aborted.
    pub async fn compile_if_complete(
        &self,
        job_id: Uuid,
    ) -> Result<Option<CompileReport>, CompileError> {
        let job = self
            .ledger
            .get_job(job_id)
            .await?
            .ok_or(CompileError::JobNotFound(job_id))?;

        if matches!(job.status, JobStatus::Failed | JobStatus::Aborted) {
            debug!(job_id = %job_id, status = %job.status, "Skipping compilation of terminal job");
            return Ok(None);
        }
        if !job.counters().is_complete() {
            return Ok(None);
        }

        self.compile(job_id).await.map(Some)
    }

    /// Builds every consolidated artifact for the job, records the primary
    /// one and marks the job completed when its status allows it.
    pub async fn compile(&self, job_id: Uuid) -> Result<CompileReport, CompileError> {
        self.store.ensure_job_dirs(job_id).await?;
        let results_dir = self.store.results_dir(job_id);
        let groups = Groups::from_artifacts(self.store.list_row_artifacts(job_id).await?);

        let mut report = CompileReport {
            job_id,
            json_rows: groups.json.len(),
            csv_rows: groups.csv.len(),
            other_files: groups.other.values().map(Vec::len).sum(),
            ..Default::default()
        };

        let mut master = None;
        if !groups.json.is_empty() {
            let path = results_dir.join(MASTER_RESULTS);
            write_master(&path, &groups.json).await?;
            report.artifacts.push(path.clone());
            master = Some(path);
        }

        let mut combined = None;
        if !groups.csv.is_empty() {
            let path = results_dir.join(COMBINED_CSV);
            write_combined(&path, &groups.csv).await?;
            report.artifacts.push(path.clone());
            combined = Some(path);
        }

        let mut all_bundle = None;
        if !groups.other.is_empty() {
            let (written, all) = write_bundles(&results_dir, &groups.other).await?;
            report.artifacts.extend(written);
            all_bundle = all;
        }

        report.primary = master.or(combined).or(all_bundle);
        if let Some(primary) = &report.primary {
            self.ledger
                .set_result_path(job_id, &primary.display().to_string())
                .await?;
        }

        report.completed_now = self.ledger.transition(job_id, JobStatus::Completed).await?;
        if report.completed_now {
            self.metrics.record_compiled();
            info!(
                job_id = %job_id,
                artifacts = report.artifacts.len(),
                primary = ?report.primary,
                "Job completed"
            );
            self.announce_completion(job_id).await;
        } else {
            debug!(job_id = %job_id, "Recompiled job without status change");
        }

        Ok(report)
    }

    async fn announce_completion(&self, job_id: Uuid) {
        let Some(cache) = &self.cache else { return };
        let message = json!({ "jobId": job_id, "status": JobStatus::Completed }).to_string();
        if let Err(e) = cache.publish(&progress_channel(job_id), &message).await {
            warn!(job_id = %job_id, error = %e, "Failed to publish completion");
        }
    }
}

/// `rowIndex,result_json` with one line per row in index order.
async fn write_master(path: &Path, rows: &[RowArtifact]) -> Result<(), CompileError> {
    let mut content = String::from(MASTER_HEADER);
    content.push('\n');

    for row in rows {
        let raw = match fs::read_to_string(&row.path).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %row.path.display(), error = %e, "Skipping unreadable row result");
                continue;
            }
        };
        // Compact form keeps one row per line
        let compact = match serde_json::from_str::<Value>(&raw) {
            Ok(value) => value.to_string(),
            Err(_) => Value::String(raw.trim().to_string()).to_string(),
        };
        content.push_str(&row.row_index.to_string());
        content.push(',');
        content.push_str(&csv_quote(&compact));
        content.push('\n');
    }

    let path = path.to_path_buf();
    blocking(move || archive::write_atomic(&path, content.as_bytes())).await
}

/// Concatenates CSV row outputs, keeping only the first file's header.
async fn write_combined(path: &Path, rows: &[RowArtifact]) -> Result<(), CompileError> {
    let mut content = String::new();
    let mut header_written = false;

    for row in rows {
        let raw = match fs::read_to_string(&row.path).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %row.path.display(), error = %e, "Skipping unreadable CSV output");
                continue;
            }
        };
        let mut lines = raw.lines();
        let Some(header) = lines.next() else { continue };
        if !header_written {
            content.push_str(header.trim_start_matches('\u{feff}'));
            content.push('\n');
            header_written = true;
        }
        for line in lines.filter(|l| !l.trim().is_empty()) {
            content.push_str(line);
            content.push('\n');
        }
    }

    let path = path.to_path_buf();
    blocking(move || archive::write_atomic(&path, content.as_bytes())).await
}

/// One bundle per extension plus the catch-all. A bundle that cannot be
/// built is replaced by a placeholder listing its files.
async fn write_bundles(
    results_dir: &Path,
    groups: &BTreeMap<String, Vec<RowArtifact>>,
) -> Result<(Vec<PathBuf>, Option<PathBuf>), CompileError> {
    let mut written = Vec::new();
    let mut all_files = Vec::new();

    for (ext, artifacts) in groups {
        let files: Vec<PathBuf> = artifacts.iter().map(|a| a.path.clone()).collect();
        all_files.extend(files.iter().cloned());
        let target = results_dir.join(format!("outputs_{}.tar.gz", ext));
        let placeholder = results_dir.join(format!("outputs_{}.unarchived.txt", ext));
        written.push(bundle_or_placeholder(target, placeholder, files).await?);
    }

    let target = results_dir.join(ALL_OUTPUTS);
    let placeholder = results_dir.join("outputs_all.unarchived.txt");
    let all = bundle_or_placeholder(target, placeholder, all_files).await?;
    written.push(all.clone());

    Ok((written, Some(all)))
}

async fn bundle_or_placeholder(
    target: PathBuf,
    placeholder: PathBuf,
    files: Vec<PathBuf>,
) -> Result<PathBuf, CompileError> {
    let attempt = {
        let target = target.clone();
        let files = files.clone();
        tokio::task::spawn_blocking(move || archive::write_tar_gz(&target, &files))
            .await
            .map_err(|e| CompileError::Join(e.to_string()))?
    };

    match attempt {
        Ok(()) => {
            // A bundle supersedes an earlier placeholder
            let _ = fs::remove_file(&placeholder).await;
            Ok(target)
        }
        Err(e) => {
            warn!(target = %target.display(), error = %e, "Archiving failed, writing placeholder");
            let reason = e.to_string();
            let path = placeholder.clone();
            blocking(move || archive::write_placeholder(&path, &files, &reason)).await?;
            Ok(placeholder)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::storage::{CounterDelta, MemoryLedger, NewJob, RowResult};
    use chrono::Utc;
    use serde_json::Map;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<MemoryLedger>, RowStore, Uuid) {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(MemoryLedger::new());
        let store = RowStore::new(dir.path());
        let job_id = ledger
            .create_job(NewJob {
                owner_id: 1,
                script_id: 1,
                script_path: "/s/x.js".to_string(),
                input_path: None,
            })
            .await
            .unwrap();
        (dir, ledger, store, job_id)
    }

    async fn finish_row(ledger: &MemoryLedger, store: &RowStore, job_id: Uuid, idx: u64, code: i32) {
        let mut row = Map::new();
        row.insert("n".to_string(), Value::from(idx));
        store
            .write_row_result(&RowResult {
                job_id,
                row_index: idx,
                code,
                out: format!("out {}", idx),
                err: String::new(),
                row_data: row,
                finished_at: Utc::now(),
                result: None,
                aborted: false,
                backend: None,
            })
            .await
            .unwrap();
        ledger
            .increment(job_id, CounterDelta::for_outcome(code == 0))
            .await
            .unwrap();
    }

    #[test]
    fn test_csv_quote() {
        assert_eq!(csv_quote(r#"{"a":"b"}"#), r#""{""a"":""b""}""#);
    }

    #[tokio::test]
    async fn test_not_complete_until_total_reached() {
        let (_dir, ledger, store, job_id) = setup().await;
        let compiler = ResultCompiler::new(ledger.clone(), store.clone());
        ledger.set_total_items(job_id, 2).await.unwrap();
        finish_row(&ledger, &store, job_id, 1, 0).await;

        assert!(compiler.compile_if_complete(job_id).await.unwrap().is_none());

        finish_row(&ledger, &store, job_id, 2, 1).await;
        let report = compiler.compile_if_complete(job_id).await.unwrap().unwrap();
        assert!(report.completed_now);
        assert_eq!(report.json_rows, 2);

        let job = ledger.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.result_path.unwrap().ends_with(MASTER_RESULTS));
        assert!(job.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_master_results_ordered_and_idempotent() {
        let (_dir, ledger, store, job_id) = setup().await;
        let compiler = ResultCompiler::new(ledger.clone(), store.clone());
        ledger.set_total_items(job_id, 3).await.unwrap();
        for idx in [3, 1, 2] {
            finish_row(&ledger, &store, job_id, idx, 0).await;
        }

        let first = compiler.compile(job_id).await.unwrap();
        let path = first.primary.clone().unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "rowIndex,result_json");
        assert!(lines[1].starts_with("1,\""));
        assert!(lines[2].starts_with("2,\""));
        assert!(lines[3].starts_with("3,\""));
        assert_eq!(lines.len(), 4);

        let second = compiler.compile(job_id).await.unwrap();
        assert!(first.completed_now);
        assert!(!second.completed_now);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), content);
    }

    #[tokio::test]
    async fn test_csv_outputs_share_one_header() {
        let (_dir, ledger, store, job_id) = setup().await;
        let rows = store.rows_dir(job_id);
        store.ensure_job_dirs(job_id).await.unwrap();
        std::fs::write(rows.join("row_2.csv"), "a,b\n3,4\n").unwrap();
        std::fs::write(rows.join("row_1.csv"), "a,b\n1,2\n").unwrap();

        let report = ResultCompiler::new(ledger.clone(), store.clone())
            .compile(job_id)
            .await
            .unwrap();
        let combined = store.results_dir(job_id).join(COMBINED_CSV);
        assert_eq!(report.primary, Some(combined.clone()));
        assert_eq!(
            std::fs::read_to_string(combined).unwrap(),
            "a,b\n1,2\n3,4\n"
        );
    }

    #[tokio::test]
    async fn test_other_outputs_are_bundled_per_type() {
        let (_dir, ledger, store, job_id) = setup().await;
        let rows = store.rows_dir(job_id);
        store.ensure_job_dirs(job_id).await.unwrap();
        std::fs::write(rows.join("row_1.png"), b"png").unwrap();
        std::fs::write(rows.join("row_2.txt"), b"txt").unwrap();
        std::fs::write(rows.join("notes.md"), b"ignored").unwrap();

        let report = ResultCompiler::new(ledger.clone(), store.clone())
            .compile(job_id)
            .await
            .unwrap();
        let results = store.results_dir(job_id);
        assert_eq!(report.other_files, 2);
        assert!(results.join("outputs_png.tar.gz").exists());
        assert!(results.join("outputs_txt.tar.gz").exists());
        assert_eq!(report.primary, Some(results.join(ALL_OUTPUTS)));
    }

    #[tokio::test]
    async fn test_completion_is_published() {
        let (_dir, ledger, store, job_id) = setup().await;
        let cache = Arc::new(MemoryCache::new());
        let mut rx = cache.subscribe();
        let compiler = ResultCompiler::new(ledger.clone(), store.clone()).with_cache(cache);
        ledger.set_total_items(job_id, 1).await.unwrap();
        finish_row(&ledger, &store, job_id, 1, 0).await;

        compiler.compile_if_complete(job_id).await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, progress_channel(job_id));
        let payload: Value = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(payload["status"], "completed");
    }

    #[tokio::test]
    async fn test_aborted_job_is_not_completed() {
        let (_dir, ledger, store, job_id) = setup().await;
        ledger.set_total_items(job_id, 1).await.unwrap();
        finish_row(&ledger, &store, job_id, 1, 0).await;
        ledger.transition(job_id, JobStatus::Aborted).await.unwrap();

        let compiler = ResultCompiler::new(ledger.clone(), store.clone());
        assert!(compiler.compile_if_complete(job_id).await.unwrap().is_none());

        // Explicit compilation still builds artifacts but keeps the status
        let report = compiler.compile(job_id).await.unwrap();
        assert!(!report.completed_now);
        let job = ledger.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Aborted);
    }
}
