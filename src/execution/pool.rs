//! In-process module pool.
//!
//! Scripts that map to a registered module run on tokio's blocking threads,
//! capped by a semaphore at the configured thread count. The module is
//! loaded again for every call, so edits to the script file are picked up
//! without restarting the worker.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;

use super::{BackendError, BackendKind, BackendOutput, ExecutionRequest, RowBackend};

/// A loaded row module: takes the row, returns a structured result.
pub trait RowModule: Send + Sync {
    fn run(&self, row: &Map<String, Value>) -> Result<Value, String>;
}

impl<F> RowModule for F
where
    F: Fn(&Map<String, Value>) -> Result<Value, String> + Send + Sync,
{
    fn run(&self, row: &Map<String, Value>) -> Result<Value, String> {
        self(row)
    }
}

/// Loads a module from a script path.
pub type ModuleLoader = Arc<dyn Fn(&Path) -> Result<Arc<dyn RowModule>, String> + Send + Sync>;

/// Modules the pool knows how to load, keyed by script file stem or by
/// extension.
#[derive(Default, Clone)]
pub struct ModuleRegistry {
    by_stem: HashMap<String, ModuleLoader>,
    by_extension: HashMap<String, ModuleLoader>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the bundled `.tpl` template module.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_extension("tpl", Arc::new(load_template));
        registry
    }

    /// Registers a loader for scripts whose file stem is `stem`.
    pub fn register(&mut self, stem: impl Into<String>, loader: ModuleLoader) {
        self.by_stem.insert(stem.into(), loader);
    }

    /// Registers a plain function as the module for `stem`.
    pub fn register_fn<F>(&mut self, stem: impl Into<String>, module: F)
    where
        F: Fn(&Map<String, Value>) -> Result<Value, String> + Send + Sync + 'static,
    {
        let module: Arc<dyn RowModule> = Arc::new(module);
        self.register(
            stem,
            Arc::new(move |_path: &Path| -> Result<Arc<dyn RowModule>, String> {
                Ok(module.clone())
            }),
        );
    }

    /// Registers a loader for every script with extension `ext`.
    pub fn register_extension(&mut self, ext: impl Into<String>, loader: ModuleLoader) {
        self.by_extension.insert(ext.into().to_lowercase(), loader);
    }

    fn loader_for(&self, path: &Path) -> Option<&ModuleLoader> {
        let by_stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|stem| self.by_stem.get(stem));
        by_stem.or_else(|| {
            path.extension()
                .and_then(|e| e.to_str())
                .and_then(|ext| self.by_extension.get(&ext.to_lowercase()))
        })
    }

    /// True if some loader claims the script.
    pub fn can_load(&self, path: &Path) -> bool {
        self.loader_for(path).is_some()
    }

    /// Loads a fresh module instance for the script.
    pub fn load(&self, path: &Path) -> Result<Arc<dyn RowModule>, BackendError> {
        let loader = self
            .loader_for(path)
            .ok_or_else(|| BackendError::NotLoadable(path.to_path_buf()))?;
        loader(path).map_err(BackendError::Module)
    }
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([^{}\s]+)\s*\}\}").expect("Invalid regex for template placeholders")
    })
}

/// Template module: the script file is text with `{{column}}` placeholders.
fn load_template(path: &Path) -> Result<Arc<dyn RowModule>, String> {
    let template = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read template {}: {}", path.display(), e))?;

    let module = move |row: &Map<String, Value>| -> Result<Value, String> {
        let mut missing = None;
        let rendered = placeholder_pattern().replace_all(&template, |caps: &regex::Captures| {
            let key = &caps[1];
            match row.get(key) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => {
                    missing.get_or_insert_with(|| key.to_string());
                    String::new()
                }
            }
        });
        match missing {
            Some(key) => Err(format!("template references unknown column '{}'", key)),
            None => Ok(Value::String(rendered.into_owned())),
        }
    };
    Ok(Arc::new(module))
}

/// Bounded pool running registered modules.
pub struct InProcessPool {
    registry: Arc<ModuleRegistry>,
    permits: Arc<Semaphore>,
    threads: usize,
}

impl InProcessPool {
    pub fn new(registry: Arc<ModuleRegistry>, threads: usize) -> Self {
        let threads = threads.max(1);
        Self {
            registry,
            permits: Arc::new(Semaphore::new(threads)),
            threads,
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn can_load(&self, path: &Path) -> bool {
        self.registry.can_load(path)
    }
}

#[async_trait]
impl RowBackend for InProcessPool {
    fn kind(&self) -> BackendKind {
        BackendKind::Pool
    }

    async fn execute(&self, request: &ExecutionRequest) -> Result<BackendOutput, BackendError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| BackendError::Module(format!("execution pool closed: {}", e)))?;

        let registry = Arc::clone(&self.registry);
        let path = request.script_path.clone();
        let row = request.row_data.clone();

        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let module = registry.load(&path)?;
            let value = module.run(&row).map_err(BackendError::Module)?;
            let out = serde_json::to_string(&value)
                .map_err(|e| BackendError::Module(format!("unserializable result: {}", e)))?;
            Ok((value, out))
        })
        .await;

        match joined {
            Ok(Ok((value, out))) => Ok(BackendOutput {
                code: 0,
                out,
                err: String::new(),
                result: Some(value),
                backend: BackendKind::Pool,
            }),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(BackendError::Panicked(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn request(script: PathBuf, row: Map<String, Value>) -> ExecutionRequest {
        ExecutionRequest {
            job_id: Uuid::new_v4(),
            row_index: 1,
            row_data: row,
            script_path: script,
            log_path: PathBuf::from("/tmp/row_1.log"),
            result_path: PathBuf::from("/tmp/row_1.json"),
        }
    }

    fn row(name: &str) -> Map<String, Value> {
        let mut row = Map::new();
        row.insert("name".to_string(), Value::String(name.to_string()));
        row
    }

    #[tokio::test]
    async fn test_registered_function_returns_result() {
        let mut registry = ModuleRegistry::new();
        registry.register_fn("upper", |row: &Map<String, Value>| {
            let name = row.get("name").and_then(|v| v.as_str()).unwrap_or_default();
            Ok(Value::String(name.to_uppercase()))
        });
        let pool = InProcessPool::new(Arc::new(registry), 2);

        let out = pool
            .execute(&request(PathBuf::from("/s/upper.js"), row("ada")))
            .await
            .unwrap();
        assert_eq!(out.code, 0);
        assert_eq!(out.result, Some(Value::String("ADA".to_string())));
        assert_eq!(out.out, "\"ADA\"");
    }

    #[tokio::test]
    async fn test_structured_result_is_echoed_as_json() {
        let mut registry = ModuleRegistry::new();
        registry.register_fn("shape", |row: &Map<String, Value>| {
            Ok(serde_json::json!({ "input": row, "ok": true }))
        });
        let pool = InProcessPool::new(Arc::new(registry), 1);

        let out = pool
            .execute(&request(PathBuf::from("/s/shape.js"), row("ada")))
            .await
            .unwrap();
        let echoed: Value = serde_json::from_str(&out.out).unwrap();
        assert_eq!(Some(echoed), out.result);
        assert_eq!(out.err, "");
    }

    #[tokio::test]
    async fn test_panic_is_an_error() {
        let mut registry = ModuleRegistry::new();
        registry.register_fn("boom", |_row: &Map<String, Value>| -> Result<Value, String> {
            panic!("module blew up")
        });
        let pool = InProcessPool::new(Arc::new(registry), 1);

        let err = pool
            .execute(&request(PathBuf::from("/s/boom.js"), Map::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Panicked(_)));
    }

    #[tokio::test]
    async fn test_unregistered_script_is_not_loadable() {
        let pool = InProcessPool::new(Arc::new(ModuleRegistry::new()), 1);
        assert!(!pool.can_load(Path::new("/s/x.js")));
        let err = pool
            .execute(&request(PathBuf::from("/s/x.js"), Map::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotLoadable(_)));
    }

    #[tokio::test]
    async fn test_template_reloads_on_every_call() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("greet.tpl");
        std::fs::write(&script, "hello {{ name }}").unwrap();
        let pool = InProcessPool::new(Arc::new(ModuleRegistry::with_builtins()), 1);

        let out = pool
            .execute(&request(script.clone(), row("ada")))
            .await
            .unwrap();
        assert_eq!(out.result, Some(Value::String("hello ada".to_string())));

        std::fs::write(&script, "bye {{name}}").unwrap();
        let out = pool.execute(&request(script.clone(), row("ada"))).await.unwrap();
        assert_eq!(out.result, Some(Value::String("bye ada".to_string())));

        let err = pool
            .execute(&request(script, Map::new()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown column 'name'"));
    }

    #[tokio::test]
    async fn test_pool_caps_concurrency() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut registry = ModuleRegistry::new();
        {
            let running = running.clone();
            let peak = peak.clone();
            registry.register_fn("slow", move |_row: &Map<String, Value>| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(30));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Null)
            });
        }
        let pool = Arc::new(InProcessPool::new(Arc::new(registry), 2));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.execute(&request(PathBuf::from("/s/slow.js"), Map::new()))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
