//! Batch Lifecycle States

use std::fmt;

/// Orchestration state of one batch run
///
/// ```text
/// PENDING → RUNNING → COMPLETED
///              ↓
///            FAILED
/// ```
///
/// A cancelled run returns to PENDING; progress is kept in the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchState {
    /// Submitted or interrupted, not executing
    Pending,

    /// An orchestrator run owns the batch
    Running,

    /// Terminal for the run: all iterations finalized
    Completed,

    /// Terminal for the run: an iteration failed (resume may retry it)
    Failed,
}

impl BatchState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchState::Completed | BatchState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Pending => "PENDING",
            BatchState::Running => "RUNNING",
            BatchState::Completed => "COMPLETED",
            BatchState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
