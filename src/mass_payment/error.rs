//! Mass Payment Error Types
//!
//! Three layers: failures reported by one iteration's executor, failures of the
//! checkpoint store, and the errors a caller of the orchestrator sees.

use thiserror::Error;

use crate::money::MoneyError;

/// Failure of a single issue-and-pay iteration
///
/// Explicit failures mean the ledger did not commit the transaction. Timeout
/// and network failures leave the outcome unknown.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("Counterparty rejected the transfer: {0}")]
    CounterpartyRejected(String),

    #[error("Notary conflict, input already consumed: {0}")]
    NotaryConflict(String),

    #[error("Transaction validation failed: {0}")]
    ValidationFailed(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl ExecutorError {
    pub fn code(&self) -> &'static str {
        match self {
            ExecutorError::CounterpartyRejected(_) => "COUNTERPARTY_REJECTED",
            ExecutorError::NotaryConflict(_) => "NOTARY_CONFLICT",
            ExecutorError::ValidationFailed(_) => "VALIDATION_FAILED",
            ExecutorError::Timeout(_) => "TIMEOUT",
            ExecutorError::Network(_) => "NETWORK_ERROR",
        }
    }

    /// Ledger definitely did not commit
    #[inline]
    pub fn is_explicit_fail(&self) -> bool {
        matches!(
            self,
            ExecutorError::CounterpartyRejected(_)
                | ExecutorError::NotaryConflict(_)
                | ExecutorError::ValidationFailed(_)
        )
    }
}

/// Checkpoint store failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("Checkpoint not found: {0}")]
    NotFound(String),

    #[error("Checkpoint already exists: {0}")]
    AlreadyExists(String),

    #[error("Checkpoint {request_id} moved: expected {expected} completed, found {actual}")]
    Conflict {
        request_id: String,
        expected: u32,
        actual: u32,
    },

    #[error("Checkpoint {request_id} inconsistent: {detail}")]
    Inconsistent { request_id: String, detail: String },

    /// Transient; the write may be retried
    #[error("Checkpoint storage error: {0}")]
    Storage(String),

    #[error("Checkpoint data corrupted: {0}")]
    Corrupted(String),

    /// The store refused the record itself; retrying cannot help
    #[error("Checkpoint write rejected: {0}")]
    Rejected(String),

    /// Another process owns the store
    #[error("Checkpoint store locked: {0}")]
    Locked(String),
}

impl CheckpointError {
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, CheckpointError::Storage(_))
    }

    pub fn inconsistent(request_id: impl ToString, detail: impl Into<String>) -> Self {
        CheckpointError::Inconsistent {
            request_id: request_id.to_string(),
            detail: detail.into(),
        }
    }
}

impl From<sqlx::Error> for CheckpointError {
    fn from(e: sqlx::Error) -> Self {
        CheckpointError::Storage(e.to_string())
    }
}

impl From<std::io::Error> for CheckpointError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::InvalidInput => CheckpointError::Rejected(e.to_string()),
            _ => CheckpointError::Storage(e.to_string()),
        }
    }
}

impl From<bincode::Error> for CheckpointError {
    fn from(e: bincode::Error) -> Self {
        CheckpointError::Corrupted(e.to_string())
    }
}

/// Errors returned by the orchestrator
///
/// Iteration failures are not errors: they are reported as
/// `OrchestrationOutcome::Failed`.
#[derive(Error, Debug)]
pub enum BatchError {
    // === Validation Errors ===
    #[error("Iteration count must be at least 1")]
    InvalidIterationCount,

    #[error("Invalid amount: {0}")]
    InvalidAmount(#[from] MoneyError),

    #[error("Unknown party: {0}")]
    UnknownParty(String),

    #[error("Not a notary: {0}")]
    NotANotary(String),

    #[error("Invalid request id: {0}")]
    InvalidRequestId(String),

    // === Lifecycle Errors ===
    #[error("Batch not found: {0}")]
    NotFound(String),

    #[error("Batch already running: {0}")]
    AlreadyRunning(String),

    #[error("Batch {request_id} cancelled after {completed} iterations")]
    Cancelled { request_id: String, completed: u32 },

    // === Checkpoint Errors ===
    #[error("Checkpoint inconsistency: {0}")]
    CheckpointInconsistency(String),

    /// Iteration committed on the ledger but the checkpoint could not record it
    #[error("Checkpoint write failed for committed iteration {iteration} after {attempts} attempts: {source}")]
    CheckpointWrite {
        iteration: u32,
        attempts: u32,
        #[source]
        source: CheckpointError,
    },

    #[error("Iteration {iteration} outcome unknown: {cause}")]
    InDoubt { iteration: u32, cause: ExecutorError },

    #[error("Checkpoint error: {0}")]
    Checkpoint(CheckpointError),
}

impl BatchError {
    pub fn code(&self) -> &'static str {
        match self {
            BatchError::InvalidIterationCount => "INVALID_ITERATION_COUNT",
            BatchError::InvalidAmount(_) => "INVALID_AMOUNT",
            BatchError::UnknownParty(_) => "UNKNOWN_PARTY",
            BatchError::NotANotary(_) => "NOT_A_NOTARY",
            BatchError::InvalidRequestId(_) => "INVALID_REQUEST_ID",
            BatchError::NotFound(_) => "BATCH_NOT_FOUND",
            BatchError::AlreadyRunning(_) => "ALREADY_RUNNING",
            BatchError::Cancelled { .. } => "CANCELLED",
            BatchError::CheckpointInconsistency(_) => "CHECKPOINT_INCONSISTENCY",
            BatchError::CheckpointWrite { .. } => "CHECKPOINT_WRITE_FAILED",
            BatchError::InDoubt { .. } => "IN_DOUBT",
            BatchError::Checkpoint(_) => "CHECKPOINT_ERROR",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            BatchError::InvalidIterationCount
            | BatchError::InvalidAmount(_)
            | BatchError::InvalidRequestId(_) => 400,
            BatchError::NotFound(_) => 404,
            BatchError::AlreadyRunning(_) | BatchError::Cancelled { .. } => 409,
            BatchError::UnknownParty(_) | BatchError::NotANotary(_) => 422,
            BatchError::CheckpointInconsistency(_)
            | BatchError::CheckpointWrite { .. }
            | BatchError::InDoubt { .. } => 500,
            BatchError::Checkpoint(_) => 503,
        }
    }
}

impl From<CheckpointError> for BatchError {
    fn from(e: CheckpointError) -> Self {
        match e {
            CheckpointError::NotFound(id) => BatchError::NotFound(id),
            CheckpointError::Inconsistent { .. } | CheckpointError::Corrupted(_) => {
                BatchError::CheckpointInconsistency(e.to_string())
            }
            other => BatchError::Checkpoint(other),
        }
    }
}
