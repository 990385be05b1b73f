//! High-level recording interface over the raw Prometheus statics.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_EXECUTIONS, BACKEND_FALLBACKS, JOBS_COMPILED, QUEUE_DEPTH, ROWS_TOTAL, ROW_DURATION,
};

/// Records engine metrics with consistent labels.
///
/// ```ignore
/// use rowforge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics()?;
/// let collector = MetricsCollector::new();
/// collector.record_row("success", "subprocess", Duration::from_millis(850));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a finalized row.
    ///
    /// # Arguments
    ///
    /// * `outcome` - `success`, `failed` or `aborted`
    /// * `backend` - backend that ran the row (`rpc`, `pool`, `subprocess`, `none`)
    /// * `duration` - time spent inside the backend
    pub fn record_row(&self, outcome: &str, backend: &str, duration: Duration) {
        if let Some(rows) = ROWS_TOTAL.get() {
            rows.with_label_values(&[outcome]).inc();
        }

        if let Some(hist) = ROW_DURATION.get() {
            hist.with_label_values(&[backend])
                .observe(duration.as_secs_f64());
        }

        tracing::trace!(outcome, backend, duration_ms = duration.as_millis() as u64, "Recorded row metric");
    }

    pub fn execution_started(&self) {
        if let Some(gauge) = ACTIVE_EXECUTIONS.get() {
            gauge.inc();
        }
    }

    pub fn execution_finished(&self) {
        if let Some(gauge) = ACTIVE_EXECUTIONS.get() {
            gauge.dec();
        }
    }

    pub fn record_fallback(&self) {
        if let Some(counter) = BACKEND_FALLBACKS.get() {
            counter.inc();
        }
    }

    pub fn record_compiled(&self) {
        if let Some(counter) = JOBS_COMPILED.get() {
            counter.inc();
        }
    }

    /// Set the current depth of one queue state.
    pub fn set_queue_depth(&self, state: &str, depth: u64) {
        if let Some(gauge) = QUEUE_DEPTH.get() {
            gauge.with_label_values(&[state]).set(depth as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_recording_after_init() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();

        collector.record_row("failed", "pool", Duration::from_millis(20));
        collector.record_fallback();
        collector.record_compiled();
        collector.set_queue_depth("pending", 4);

        let text = export_metrics();
        assert!(text.contains("rowforge_row_duration_seconds"));
        assert!(text.contains("rowforge_backend_fallbacks_total"));
        assert!(text.contains("rowforge_queue_depth"));
    }
}
