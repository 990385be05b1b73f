//! Prometheus metrics for the row engine.
//!
//! # Example
//!
//! ```ignore
//! use rowforge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! MetricsCollector::new().record_compiled();
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_EXECUTIONS, BACKEND_FALLBACKS, JOBS_COMPILED, QUEUE_DEPTH, REGISTRY, ROWS_TOTAL,
    ROW_DURATION,
};
