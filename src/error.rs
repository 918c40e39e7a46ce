#![forbid(unsafe_code)]

use crate::graph::CellId;
use std::fmt;
use thiserror::Error;

/// The errors an atomic operation can fail with.
///
/// Any of these aborts the enclosing atomic block: the undo log is unwound
/// to the beginning of the block, commit hooks are discarded, and managers
/// exit with the error before it is surfaced from
/// [`try_atomically`](crate::try_atomically).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrellisError {
    /// Two writers set the same cell to different values in one pulse.
    #[error("conflicting writes in one pulse: kept {current}, rejected {attempted}")]
    InputConflict {
        /// Debug rendering of the value the cell already holds.
        current: String,
        /// Debug rendering of the rejected value.
        attempted: String,
    },

    /// Rules arranged in an infinite loop.
    #[error("circular dependency between rules: {routes}")]
    Circularity {
        /// For each rule on the cycle, the rules it re-triggered.
        routes: Routes,
    },

    /// A write was attempted during the commit phase, outside a modifier.
    #[error("cells cannot be changed during the commit phase")]
    ReadOnlyPhase,

    /// An atomic operation was started from within cleanup, or the undo log
    /// was manipulated from within a rollback.
    #[error("atomic operations cannot be nested into cleanup or rollback")]
    NoReentrantRun,

    /// A user rule panicked. Managers observe this in `exit`; the panic
    /// itself resumes once the block has been unwound.
    #[error("a rule panicked during the atomic operation")]
    RulePanicked,
}

/// The re-trigger paths that prove a circular dependency: each entry maps a
/// rule on the cycle to the rules it notified that are also on the cycle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Routes(pub Vec<(CellId, Vec<CellId>)>);

impl Routes {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for Routes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (from, to) in &self.0 {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write!(f, "{from:?} -> {to:?}")?;
        }
        Ok(())
    }
}
