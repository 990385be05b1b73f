//! Row execution backends.
//!
//! Three interchangeable strategies run one row's script:
//!
//! - **RPC** ([`RpcBackend`]): forwards the row to a remote execution service.
//! - **In-process pool** ([`InProcessPool`]): runs a registered module on a
//!   bounded set of blocking threads, reloading it for every call.
//! - **Subprocess** ([`SubprocessBackend`]): spawns an interpreter and streams
//!   its output into the row log.
//!
//! The [`Dispatcher`] picks a backend from the task's [`ScriptKind`]. A
//! backend returns `Ok` for every outcome it could observe, including script
//! failures; `Err` means the backend itself broke and the task should be
//! retried by the queue.

pub mod pool;
pub mod rpc;
pub mod subprocess;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::metrics::MetricsCollector;

pub use pool::{InProcessPool, ModuleLoader, ModuleRegistry, RowModule};
pub use rpc::RpcBackend;
pub use subprocess::SubprocessBackend;

/// Errors raised when a backend cannot produce a row outcome.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The module raised an error while running.
    #[error("Module raised: {0}")]
    Module(String),

    /// No module is registered for the script.
    #[error("No loadable module for {0}")]
    NotLoadable(PathBuf),

    /// The execution thread panicked.
    #[error("Execution panicked: {0}")]
    Panicked(String),

    /// IO failure while supervising the execution.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to build the HTTP client.
    #[error("HTTP client error: {0}")]
    Client(String),
}

/// Language class of a script, resolved once per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptKind {
    /// Runs over RPC when a remote service is configured, otherwise as a subprocess.
    Python,
    /// Runs in the in-process pool when loadable, otherwise as a subprocess.
    Node,
}

impl ScriptKind {
    /// Resolves the kind from the catalog's declared language, falling back
    /// to the file extension.
    pub fn resolve(language: &str, path: &Path) -> ScriptKind {
        match language.trim().to_lowercase().as_str() {
            "python" | "py" => return ScriptKind::Python,
            "javascript" | "js" | "node" => return ScriptKind::Node,
            _ => {}
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("py") => ScriptKind::Python,
            _ => ScriptKind::Node,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptKind::Python => "python",
            ScriptKind::Node => "node",
        }
    }
}

/// Which backend produced an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Rpc,
    Pool,
    Subprocess,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Rpc => "rpc",
            BackendKind::Pool => "pool",
            BackendKind::Subprocess => "subprocess",
        }
    }

    /// True if the backend wrote its output into the row log while running.
    pub fn streams_log(&self) -> bool {
        matches!(self, BackendKind::Subprocess)
    }
}

/// Everything a backend needs to run one row.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub job_id: Uuid,
    pub row_index: u64,
    pub row_data: Map<String, Value>,
    pub script_path: PathBuf,
    pub log_path: PathBuf,
    pub result_path: PathBuf,
}

/// Observed outcome of one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendOutput {
    pub code: i32,
    pub out: String,
    pub err: String,
    pub result: Option<Value>,
    pub backend: BackendKind,
}

impl BackendOutput {
    /// A caught failure with the message as both output and error text.
    pub fn failure(backend: BackendKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            code: 1,
            out: message.clone(),
            err: message,
            result: None,
            backend,
        }
    }
}

/// A strategy for running one row.
#[async_trait]
pub trait RowBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn execute(&self, request: &ExecutionRequest) -> Result<BackendOutput, BackendError>;
}

/// Chooses a backend per script kind and applies the pool → subprocess
/// fallback.
pub struct Dispatcher {
    rpc: Option<Arc<dyn RowBackend>>,
    pool: Option<Arc<InProcessPool>>,
    subprocess: Arc<dyn RowBackend>,
    metrics: MetricsCollector,
}

impl Dispatcher {
    /// Creates a dispatcher that runs everything as a subprocess.
    pub fn new(subprocess: Arc<dyn RowBackend>) -> Self {
        Self {
            rpc: None,
            pool: None,
            subprocess,
            metrics: MetricsCollector::new(),
        }
    }

    /// Routes Python-class scripts to a remote service.
    pub fn with_rpc(mut self, rpc: Arc<dyn RowBackend>) -> Self {
        self.rpc = Some(rpc);
        self
    }

    /// Routes loadable Node-class scripts to the in-process pool.
    pub fn with_pool(mut self, pool: Arc<InProcessPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Runs one row with the backend chosen for `kind`.
    pub async fn dispatch(
        &self,
        kind: ScriptKind,
        request: &ExecutionRequest,
    ) -> Result<BackendOutput, BackendError> {
        match kind {
            ScriptKind::Python => match &self.rpc {
                Some(rpc) => rpc.execute(request).await,
                None => self.subprocess.execute(request).await,
            },
            ScriptKind::Node => {
                let pool = self
                    .pool
                    .as_ref()
                    .filter(|p| p.can_load(&request.script_path));
                let Some(pool) = pool else {
                    return self.subprocess.execute(request).await;
                };

                match pool.execute(request).await {
                    Ok(output) => Ok(output),
                    Err(e) => {
                        warn!(
                            job_id = %request.job_id,
                            row_index = request.row_index,
                            error = %e,
                            "In-process execution failed, retrying as subprocess"
                        );
                        self.metrics.record_fallback();
                        self.subprocess.execute(request).await
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBackend {
        kind: BackendKind,
        calls: AtomicUsize,
    }

    impl CountingBackend {
        fn new(kind: BackendKind) -> Arc<Self> {
            Arc::new(Self {
                kind,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RowBackend for CountingBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        async fn execute(&self, _request: &ExecutionRequest) -> Result<BackendOutput, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(BackendOutput {
                code: 0,
                out: self.kind.as_str().to_string(),
                err: String::new(),
                result: None,
                backend: self.kind,
            })
        }
    }

    fn request(script: &str) -> ExecutionRequest {
        ExecutionRequest {
            job_id: Uuid::new_v4(),
            row_index: 1,
            row_data: Map::new(),
            script_path: PathBuf::from(script),
            log_path: PathBuf::from("/tmp/row_1.log"),
            result_path: PathBuf::from("/tmp/row_1.json"),
        }
    }

    #[test]
    fn test_script_kind_resolution() {
        assert_eq!(
            ScriptKind::resolve("python", Path::new("x.js")),
            ScriptKind::Python
        );
        assert_eq!(
            ScriptKind::resolve("", Path::new("/s/clean.PY")),
            ScriptKind::Python
        );
        assert_eq!(
            ScriptKind::resolve("javascript", Path::new("x.py")),
            ScriptKind::Node
        );
        assert_eq!(
            ScriptKind::resolve("", Path::new("/s/run.mjs")),
            ScriptKind::Node
        );
    }

    #[tokio::test]
    async fn test_python_uses_rpc_when_configured() {
        let rpc = CountingBackend::new(BackendKind::Rpc);
        let sub = CountingBackend::new(BackendKind::Subprocess);

        let plain = Dispatcher::new(sub.clone());
        let out = plain
            .dispatch(ScriptKind::Python, &request("a.py"))
            .await
            .unwrap();
        assert_eq!(out.backend, BackendKind::Subprocess);

        let with_rpc = Dispatcher::new(sub.clone()).with_rpc(rpc.clone());
        let out = with_rpc
            .dispatch(ScriptKind::Python, &request("a.py"))
            .await
            .unwrap();
        assert_eq!(out.backend, BackendKind::Rpc);
        assert_eq!(rpc.calls.load(Ordering::SeqCst), 1);
        assert_eq!(sub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pool_failure_falls_back_to_subprocess() {
        let mut registry = ModuleRegistry::new();
        registry.register_fn("broken", |_row: &Map<String, Value>| {
            Err("TypeError: row.name is undefined".to_string())
        });
        registry.register_fn("fine", |_row: &Map<String, Value>| Ok(Value::Bool(true)));
        let pool = Arc::new(InProcessPool::new(Arc::new(registry), 2));
        let sub = CountingBackend::new(BackendKind::Subprocess);
        let dispatcher = Dispatcher::new(sub.clone()).with_pool(pool);

        let out = dispatcher
            .dispatch(ScriptKind::Node, &request("/s/fine.js"))
            .await
            .unwrap();
        assert_eq!(out.backend, BackendKind::Pool);
        assert_eq!(sub.calls.load(Ordering::SeqCst), 0);

        let out = dispatcher
            .dispatch(ScriptKind::Node, &request("/s/broken.js"))
            .await
            .unwrap();
        assert_eq!(out.backend, BackendKind::Subprocess);
        assert_eq!(sub.calls.load(Ordering::SeqCst), 1);

        // Not registered at all: straight to subprocess
        let out = dispatcher
            .dispatch(ScriptKind::Node, &request("/s/other.js"))
            .await
            .unwrap();
        assert_eq!(out.backend, BackendKind::Subprocess);
        assert_eq!(sub.calls.load(Ordering::SeqCst), 2);
    }
}
