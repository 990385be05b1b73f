//! Filesystem row store.
//!
//! Every job owns a directory under the store root:
//!
//! ```text
//! job_{id}/
//!   logs/row_{n}.log      streamed stdout/stderr of row n
//!   rows/row_{n}.json     RowResult of row n (plus any extra row_{n}.* outputs)
//!   rows/.row_{n}.done    claim marker, created once per row
//!   results/              consolidated artifacts written by the compiler
//! ```
//!
//! Row indexes are recovered from file names alone, so listing never needs
//! the ledger.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Errors that can occur during row store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to encode a row result.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage directory creation failed.
    #[error("Failed to create storage directory: {0}")]
    DirectoryCreationFailed(String),

    /// An artifact exists but cannot be decoded.
    #[error("Unreadable artifact {path}: {message}")]
    Unreadable { path: PathBuf, message: String },
}

/// Persisted outcome of one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowResult {
    pub job_id: Uuid,
    pub row_index: u64,
    /// Zero means success.
    pub code: i32,
    pub out: String,
    pub err: String,
    pub row_data: Map<String, Value>,
    pub finished_at: DateTime<Utc>,
    /// Structured value returned by the script, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Set when the row was skipped because its job was aborted.
    #[serde(default)]
    pub aborted: bool,
    /// Backend that produced this result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
}

impl RowResult {
    pub fn succeeded(&self) -> bool {
        self.code == 0 && !self.aborted
    }
}

/// A per-row artifact discovered by listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowArtifact {
    pub row_index: u64,
    /// Extension after `row_{n}.`, lowercased (may contain dots, e.g. `tar.gz`).
    pub extension: String,
    pub path: PathBuf,
}

/// Last lines of a row log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogTail {
    pub lines: Vec<String>,
    pub total_lines: usize,
}

fn row_file_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^row_(\d+)\.(.+)$").expect("Invalid regex for row files"))
}

/// Parses `row_{n}.{ext}` into its index and extension.
pub fn parse_row_file_name(name: &str) -> Option<(u64, String)> {
    let caps = row_file_pattern().captures(name)?;
    let index = caps.get(1)?.as_str().parse().ok()?;
    let ext = caps.get(2)?.as_str().to_lowercase();
    Some((index, ext))
}

/// Storage of per-row logs and results.
#[derive(Debug, Clone)]
pub struct RowStore {
    base_path: PathBuf,
}

impl RowStore {
    /// Creates a store rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Returns the base storage path.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn job_dir(&self, job_id: Uuid) -> PathBuf {
        self.base_path.join(format!("job_{}", job_id))
    }

    pub fn logs_dir(&self, job_id: Uuid) -> PathBuf {
        self.job_dir(job_id).join("logs")
    }

    pub fn rows_dir(&self, job_id: Uuid) -> PathBuf {
        self.job_dir(job_id).join("rows")
    }

    pub fn results_dir(&self, job_id: Uuid) -> PathBuf {
        self.job_dir(job_id).join("results")
    }

    pub fn log_path(&self, job_id: Uuid, row_index: u64) -> PathBuf {
        self.logs_dir(job_id).join(format!("row_{}.log", row_index))
    }

    pub fn result_path(&self, job_id: Uuid, row_index: u64) -> PathBuf {
        self.rows_dir(job_id).join(format!("row_{}.json", row_index))
    }

    fn claim_path(&self, job_id: Uuid, row_index: u64) -> PathBuf {
        self.rows_dir(job_id).join(format!(".row_{}.done", row_index))
    }

    /// Claims the right to record row `row_index`.
    ///
    /// Returns `Ok(false)` when another delivery of the same row already
    /// holds the claim.
    pub async fn claim_row(&self, job_id: Uuid, row_index: u64) -> Result<bool, StorageError> {
        self.ensure_job_dirs(job_id).await?;
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.claim_path(job_id, row_index))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Drops a claim so a later delivery can record the row.
    pub async fn release_claim(&self, job_id: Uuid, row_index: u64) -> Result<(), StorageError> {
        match fs::remove_file(self.claim_path(job_id, row_index)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the row was already recorded.
    pub async fn is_claimed(&self, job_id: Uuid, row_index: u64) -> bool {
        fs::try_exists(self.claim_path(job_id, row_index))
            .await
            .unwrap_or(false)
    }

    /// Ensures the job's directory structure exists.
    pub async fn ensure_job_dirs(&self, job_id: Uuid) -> Result<(), StorageError> {
        for dir in [
            self.logs_dir(job_id),
            self.rows_dir(job_id),
            self.results_dir(job_id),
        ] {
            fs::create_dir_all(&dir).await.map_err(|e| {
                StorageError::DirectoryCreationFailed(format!("{}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    /// Creates (truncating) the row log and writes the `ROW DATA:` preamble.
    pub async fn create_log(
        &self,
        job_id: Uuid,
        row_index: u64,
        row_data: &Map<String, Value>,
    ) -> Result<fs::File, StorageError> {
        self.ensure_job_dirs(job_id).await?;
        let mut file = fs::File::create(self.log_path(job_id, row_index)).await?;
        let preamble = format!("ROW DATA: {}\n", serde_json::to_string(row_data)?);
        file.write_all(preamble.as_bytes()).await?;
        Ok(file)
    }

    /// Appends raw text to a row log.
    pub async fn append_log(
        &self,
        job_id: Uuid,
        row_index: u64,
        text: &str,
    ) -> Result<(), StorageError> {
        self.ensure_job_dirs(job_id).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(job_id, row_index))
            .await?;
        file.write_all(text.as_bytes()).await?;
        Ok(())
    }

    /// Writes a row result, replacing any previous one atomically.
    pub async fn write_row_result(&self, result: &RowResult) -> Result<PathBuf, StorageError> {
        self.ensure_job_dirs(result.job_id).await?;
        let target = self.result_path(result.job_id, result.row_index);
        let tmp = self.rows_dir(result.job_id).join(format!(
            ".row_{}.json.{}.tmp",
            result.row_index,
            Uuid::new_v4().simple()
        ));

        let data = serde_json::to_vec_pretty(result)?;
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&tmp, &target).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(target)
    }

    /// Reads a row result.
    ///
    /// Returns `Ok(None)` when the row has not been written yet and
    /// `StorageError::Unreadable` when the file exists but does not decode.
    pub async fn read_row_result(
        &self,
        job_id: Uuid,
        row_index: u64,
    ) -> Result<Option<RowResult>, StorageError> {
        let path = self.result_path(job_id, row_index);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| StorageError::Unreadable {
                path,
                message: e.to_string(),
            })
    }

    /// Lists every `row_{n}.*` artifact in the job's rows directory, sorted
    /// by row index then extension.
    pub async fn list_row_artifacts(&self, job_id: Uuid) -> Result<Vec<RowArtifact>, StorageError> {
        let mut artifacts = list_matching(&self.rows_dir(job_id)).await?;
        artifacts.sort_by(|a, b| {
            a.row_index
                .cmp(&b.row_index)
                .then_with(|| a.extension.cmp(&b.extension))
        });
        Ok(artifacts)
    }

    /// Lists every log or output file belonging to one row.
    pub async fn row_files(&self, job_id: Uuid, row_index: u64) -> Result<Vec<PathBuf>, StorageError> {
        let mut files = Vec::new();
        for dir in [self.logs_dir(job_id), self.rows_dir(job_id)] {
            files.extend(
                list_matching(&dir)
                    .await?
                    .into_iter()
                    .filter(|a| a.row_index == row_index)
                    .map(|a| a.path),
            );
        }
        files.sort();
        Ok(files)
    }

    /// Reads a whole row log.
    pub async fn read_log(&self, job_id: Uuid, row_index: u64) -> Result<Option<String>, StorageError> {
        match fs::read(self.log_path(job_id, row_index)).await {
            Ok(data) => Ok(Some(String::from_utf8_lossy(&data).into_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the last `lines` non-empty lines of a row log.
    pub async fn tail_log(
        &self,
        job_id: Uuid,
        row_index: u64,
        lines: usize,
    ) -> Result<Option<LogTail>, StorageError> {
        Ok(self
            .read_log(job_id, row_index)
            .await?
            .map(|content| tail_lines(&content, lines)))
    }
}

fn tail_lines(content: &str, lines: usize) -> LogTail {
    let all: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = all.len().saturating_sub(lines);
    LogTail {
        lines: all[start..].iter().map(|l| l.to_string()).collect(),
        total_lines: all.len(),
    }
}

async fn list_matching(dir: &Path) -> Result<Vec<RowArtifact>, StorageError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut artifacts = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some((row_index, extension)) = parse_row_file_name(name) {
            artifacts.push(RowArtifact {
                row_index,
                extension,
                path: entry.path(),
            });
        }
    }
    Ok(artifacts)
}
