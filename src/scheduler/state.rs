//! Lifecycle of one leased row task.
//!
//! ```text
//! leased → abort-checked → executing → finalized(success | failed)
//!                 │             │
//!                 │             └──→ released (handed back for retry)
//!                 ├──→ finalized(failed, aborted)
//!                 └──→ released (no execution slot)
//! ```
//!
//! The abort check covers both the initial flag lookup and the re-check
//! after an execution slot is acquired.
//!
//! States only move forward. A task handed back to the queue starts a new
//! lifecycle on its next lease.

use std::fmt;

use thiserror::Error;

/// Outcome of a finalized row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    Succeeded,
    Failed,
    /// Skipped because the job was aborted; counted as a failure.
    Aborted,
}

impl RowOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowOutcome::Succeeded => "success",
            RowOutcome::Failed => "failed",
            RowOutcome::Aborted => "aborted",
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self, RowOutcome::Succeeded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowState {
    Leased,
    AbortChecked,
    Executing,
    Finalized(RowOutcome),
    Released,
}

impl RowState {
    fn rank(&self) -> u8 {
        match self {
            RowState::Leased => 0,
            RowState::AbortChecked => 1,
            RowState::Executing => 2,
            RowState::Finalized(_) | RowState::Released => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }
}

impl fmt::Display for RowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowState::Leased => write!(f, "leased"),
            RowState::AbortChecked => write!(f, "abort_checked"),
            RowState::Executing => write!(f, "executing"),
            RowState::Finalized(outcome) => write!(f, "finalized({})", outcome.as_str()),
            RowState::Released => write!(f, "released"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Illegal row transition {from} -> {to}")]
pub struct TransitionError {
    pub from: RowState,
    pub to: RowState,
}

/// Tracks one task through its lifecycle.
#[derive(Debug, Clone, Copy)]
pub struct RowLifecycle {
    state: RowState,
}

impl Default for RowLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl RowLifecycle {
    pub fn new() -> Self {
        Self {
            state: RowState::Leased,
        }
    }

    pub fn state(&self) -> RowState {
        self.state
    }

    /// Moves to `to`. Skipping ahead is allowed only where the diagram has
    /// an edge: abort-checked may finalize directly as aborted or be
    /// released.
    pub fn advance(&mut self, to: RowState) -> Result<(), TransitionError> {
        let allowed = match (self.state, to) {
            (RowState::Leased, RowState::AbortChecked) => true,
            (RowState::AbortChecked, RowState::Executing) => true,
            (RowState::AbortChecked, RowState::Finalized(RowOutcome::Aborted)) => true,
            (RowState::AbortChecked, RowState::Released) => true,
            (RowState::Executing, RowState::Finalized(outcome)) => {
                outcome != RowOutcome::Aborted
            }
            (RowState::Executing, RowState::Released) => true,
            _ => false,
        };
        if !allowed {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }
        debug_assert!(to.rank() > self.state.rank());
        self.state = to;
        Ok(())
    }
}
