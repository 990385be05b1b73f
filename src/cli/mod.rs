//! Command-line interface for rowforge.
//!
//! Provides commands for job submission, running workers, aborting jobs and
//! inspecting rows, logs and artifacts.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
