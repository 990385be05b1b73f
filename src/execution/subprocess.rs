//! Subprocess backend.
//!
//! Spawns `<interpreter> <script> <row-json> --logFile=<log> --resultFile=<result>`.
//! Stdout and stderr are read by two reader tasks that push chunks into a
//! bounded channel; a single writer task drains it into the row log, so the
//! log grows while the script runs and the two streams never interleave
//! mid-chunk. A hard timeout kills runaway processes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{BackendError, BackendKind, BackendOutput, ExecutionRequest, RowBackend};

/// Maximum stdout or stderr kept in memory per row (1 MiB); the log keeps everything.
const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// Size of one read from a child pipe.
const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Chunks buffered between the readers and the log writer.
const CHANNEL_CAPACITY: usize = 64;

/// Exit code recorded when the process was killed or reported no code.
pub const KILLED_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

struct Chunk {
    stream: Stream,
    data: Vec<u8>,
}

/// Runs scripts as child processes.
#[derive(Debug, Clone)]
pub struct SubprocessBackend {
    interpreters: HashMap<String, String>,
    default_interpreter: String,
    timeout: Duration,
}

impl SubprocessBackend {
    /// Python scripts run with `python_bin`, everything else with `node_bin`.
    pub fn new(python_bin: impl Into<String>, node_bin: impl Into<String>, timeout: Duration) -> Self {
        let mut interpreters = HashMap::new();
        interpreters.insert("py".to_string(), python_bin.into());
        Self {
            interpreters,
            default_interpreter: node_bin.into(),
            timeout,
        }
    }

    /// Uses `bin` for scripts with extension `ext`.
    pub fn with_interpreter(mut self, ext: impl Into<String>, bin: impl Into<String>) -> Self {
        self.interpreters.insert(ext.into().to_lowercase(), bin.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Interpreter chosen for a script.
    pub fn interpreter_for(&self, script: &Path) -> &str {
        script
            .extension()
            .and_then(|e| e.to_str())
            .and_then(|ext| self.interpreters.get(&ext.to_lowercase()))
            .unwrap_or(&self.default_interpreter)
    }

    fn command(&self, request: &ExecutionRequest) -> Command {
        let mut cmd = Command::new(self.interpreter_for(&request.script_path));
        cmd.arg(&request.script_path)
            .arg(serde_json::Value::Object(request.row_data.clone()).to_string())
            .arg(format!("--logFile={}", request.log_path.display()))
            .arg(format!("--resultFile={}", request.result_path.display()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RowBackend for SubprocessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Subprocess
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<BackendOutput, BackendError> {
        // A stale result file from an earlier attempt must not be mistaken for this one
        let _ = fs::remove_file(&request.result_path).await;

        let mut child = match self.command(request).spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!(
                    "failed to spawn {}: {}",
                    self.interpreter_for(&request.script_path),
                    e
                );
                append_to_log(&request.log_path, &format!("{}\n", message)).await;
                return Ok(BackendOutput::failure(BackendKind::Subprocess, message));
            }
        };

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let stdout_task = tokio::spawn(pump(child.stdout.take(), Stream::Stdout, tx.clone()));
        let stderr_task = tokio::spawn(pump(child.stderr.take(), Stream::Stderr, tx));
        let writer_task = tokio::spawn(write_log(request.log_path.clone(), rx));

        let (code, timed_out) = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => (status.code().unwrap_or(KILLED_EXIT_CODE), false),
            Ok(Err(e)) => return Err(BackendError::Io(e)),
            Err(_) => {
                warn!(
                    job_id = %request.job_id,
                    row_index = request.row_index,
                    timeout_secs = self.timeout.as_secs(),
                    "Subprocess exceeded timeout, killing"
                );
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill subprocess");
                }
                (KILLED_EXIT_CODE, true)
            }
        };

        if timed_out {
            // Grandchildren may still hold the pipes open
            stdout_task.abort();
            stderr_task.abort();
        }
        let _ = stdout_task.await;
        let _ = stderr_task.await;
        let (out, mut err) = match writer_task.await {
            Ok(captured) => captured,
            Err(e) => {
                warn!(job_id = %request.job_id, row_index = request.row_index, error = %e, "Log writer task failed, output not captured");
                (String::new(), String::new())
            }
        };

        if timed_out {
            let note = format!("killed after {}s timeout", self.timeout.as_secs());
            append_to_log(&request.log_path, &format!("{}\n", note)).await;
            if !err.is_empty() && !err.ends_with('\n') {
                err.push('\n');
            }
            err.push_str(&note);
        }

        let result = read_result_file(&request.result_path).await;
        debug!(
            job_id = %request.job_id,
            row_index = request.row_index,
            code,
            has_result = result.is_some(),
            "Subprocess finished"
        );

        Ok(BackendOutput {
            code,
            out,
            err,
            result,
            backend: BackendKind::Subprocess,
        })
    }
}

/// Forwards one pipe into the channel until EOF.
async fn pump<R: AsyncRead + Unpin>(handle: Option<R>, stream: Stream, tx: mpsc::Sender<Chunk>) {
    let Some(mut reader) = handle else { return };
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = Chunk {
                    stream,
                    data: buf[..n].to_vec(),
                };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Single writer for one row log. Returns the bounded captures.
async fn write_log(path: PathBuf, mut rx: mpsc::Receiver<Chunk>) -> (String, String) {
    let mut file = match fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(file) => Some(file),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot open row log, output kept in memory only");
            None
        }
    };

    let mut out = Vec::new();
    let mut err = Vec::new();
    while let Some(chunk) = rx.recv().await {
        if let Some(f) = file.as_mut() {
            if let Err(e) = f.write_all(&chunk.data).await {
                warn!(path = %path.display(), error = %e, "Row log write failed");
                file = None;
            } else {
                let _ = f.flush().await;
            }
        }
        let capture = match chunk.stream {
            Stream::Stdout => &mut out,
            Stream::Stderr => &mut err,
        };
        let room = MAX_CAPTURE_BYTES.saturating_sub(capture.len());
        capture.extend_from_slice(&chunk.data[..chunk.data.len().min(room)]);
    }

    (
        String::from_utf8_lossy(&out).into_owned(),
        String::from_utf8_lossy(&err).into_owned(),
    )
}

async fn append_to_log(path: &Path, text: &str) {
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await;
    match file {
        Ok(mut f) => {
            let _ = f.write_all(text.as_bytes()).await;
        }
        Err(e) => warn!(path = %path.display(), error = %e, "Cannot append to row log"),
    }
}

/// Reads what the script wrote to its result file, if anything.
async fn read_result_file(path: &Path) -> Option<Value> {
    let content = fs::read_to_string(path).await.ok()?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string())))
}
