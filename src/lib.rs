//! rowforge: batch-row processing engine.
//!
//! This library splits a tabular input into per-row tasks, runs each row
//! through a user script on a bounded worker pool, tracks job counters
//! atomically and compiles row outputs into consolidated artifacts.

// Core modules
pub mod abort;
pub mod cache;
pub mod cli;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod ingest;
pub mod listing;
pub mod metrics;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types
pub use engine::{Engine, EngineError};
pub use error::{IngestError, SubmitError};
