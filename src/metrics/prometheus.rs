//! Prometheus metrics registration and export.
//!
//! Defines the engine's metrics as process-wide statics. Recording through
//! [`super::MetricsCollector`] is a no-op until [`init_metrics`] has run.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::{Mutex, OnceLock};

/// Global Prometheus registry for all rowforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Rows finalized, labeled by outcome (`success`, `failed`, `aborted`).
pub static ROWS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Row execution duration in seconds, labeled by backend.
pub static ROW_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Row executions currently in flight in this process.
pub static ACTIVE_EXECUTIONS: OnceLock<Gauge> = OnceLock::new();

/// In-process pool failures that were retried through a subprocess.
pub static BACKEND_FALLBACKS: OnceLock<Counter> = OnceLock::new();

/// Consolidation runs that finished.
pub static JOBS_COMPILED: OnceLock<Counter> = OnceLock::new();

/// Task queue depth, labeled by state (`pending`, `leased`, `delayed`, `dead_letter`).
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Calling again after success leaves the first
/// registration in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    // Serialize initializers so every static comes from the same registry
    let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let rows_total = CounterVec::new(
        Opts::new("rowforge_rows_total", "Total number of rows finalized"),
        &["outcome"],
    )?;

    let row_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "rowforge_row_duration_seconds",
            "Row execution duration in seconds",
        )
        .buckets(vec![0.05, 0.25, 1.0, 5.0, 30.0, 120.0, 600.0, 1800.0]),
        &["backend"],
    )?;

    let active_executions = Gauge::new(
        "rowforge_active_executions",
        "Number of row executions currently in flight",
    )?;

    let backend_fallbacks = Counter::new(
        "rowforge_backend_fallbacks_total",
        "In-process pool failures retried through a subprocess",
    )?;

    let jobs_compiled = Counter::new(
        "rowforge_jobs_compiled_total",
        "Total number of result compilations",
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("rowforge_queue_depth", "Number of row tasks per queue state"),
        &["state"],
    )?;

    registry.register(Box::new(rows_total.clone()))?;
    registry.register(Box::new(row_duration.clone()))?;
    registry.register(Box::new(active_executions.clone()))?;
    registry.register(Box::new(backend_fallbacks.clone()))?;
    registry.register(Box::new(jobs_compiled.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = ROWS_TOTAL.set(rows_total);
    let _ = ROW_DURATION.set(row_duration);
    let _ = ACTIVE_EXECUTIONS.set(active_executions);
    let _ = BACKEND_FALLBACKS.set(backend_fallbacks);
    let _ = JOBS_COMPILED.set(jobs_compiled);
    let _ = QUEUE_DEPTH.set(queue_depth);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        // Either this call registered them or an earlier test did
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(rows) = ROWS_TOTAL.get() {
            rows.with_label_values(&["success"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("rowforge_rows_total"));
    }
}
