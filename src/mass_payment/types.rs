//! Mass Payment Core Types
//!
//! Type definitions shared by the orchestrator, executor and checkpoint stores.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::ExecutorError;
use crate::money::Amount;

/// Batch request ID - ULID-based unique identifier
///
/// Sortable by creation time and generated without coordination, so any node
/// may open a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchRequestId(ulid::Ulid);

impl BatchRequestId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for BatchRequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BatchRequestId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// Identity reference for a network participant
///
/// Well-known parties carry their legal name. Anonymous parties are transient
/// identities minted for a single transfer and are never resolvable by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Party {
    pub name: String,
    #[serde(default)]
    pub anonymous: bool,
}

impl Party {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            anonymous: false,
        }
    }

    pub fn anonymous(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            anonymous: true,
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.anonymous {
            write!(f, "Anonymous({})", self.name)
        } else {
            f.write_str(&self.name)
        }
    }
}

/// Reference placed on the cash issued by one iteration
///
/// Derived from `(request_id, iteration)` so a restarted orchestrator can ask
/// the ledger whether that iteration was finalized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IssueRef(String);

impl IssueRef {
    pub fn for_iteration(request_id: BatchRequestId, iteration: u32) -> Self {
        Self(format!("{}/{:06}", request_id, iteration))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for IssueRef {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for IssueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ledger transaction identifier, opaque to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable parameters of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Number of issue-and-pay iterations (>= 1)
    pub iteration_count: u32,
    /// Amount issued and paid on every iteration
    pub amount: Amount,
    /// Well-known recipient (also the negotiating counterparty)
    pub recipient: Party,
    /// Pay a fresh anonymous identity of the recipient on each iteration
    pub anonymize: bool,
    /// Notary set on every issued and transferred state
    pub notary: Party,
}

impl BatchRequest {
    pub fn new(
        iteration_count: u32,
        amount: Amount,
        recipient: Party,
        anonymize: bool,
        notary: Party,
    ) -> Self {
        Self {
            iteration_count,
            amount,
            recipient,
            anonymize,
            notary,
        }
    }

    /// Build the executor input for 1-based `iteration`
    pub fn iteration_context(&self, request_id: BatchRequestId, iteration: u32) -> IterationContext {
        IterationContext {
            request_id,
            iteration,
            amount: self.amount.clone(),
            recipient: self.recipient.clone(),
            anonymize: self.anonymize,
            notary: self.notary.clone(),
            issue_ref: IssueRef::for_iteration(request_id, iteration),
        }
    }
}

/// Everything one executor invocation needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationContext {
    pub request_id: BatchRequestId,
    /// 1-based
    pub iteration: u32,
    pub amount: Amount,
    pub recipient: Party,
    pub anonymize: bool,
    pub notary: Party,
    pub issue_ref: IssueRef,
}

/// Evidence of one finalized issue-and-pay transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationResult {
    pub iteration: u32,
    pub transaction_id: TransactionId,
    /// Identity that received the funds (anonymous when requested)
    pub recipient: Party,
}

/// Durable note that an iteration started but its outcome is not recorded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightIteration {
    pub iteration: u32,
    pub issue_ref: IssueRef,
}

/// Last failure of a batch, kept so recovery scans skip it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub iteration: u32,
    pub code: String,
    pub message: String,
    /// Ledger state unknown (timeout/network); the in-flight marker is kept
    pub outcome_unknown: bool,
}

impl FailureRecord {
    /// Longest message kept; a journal record is capped at 64 KiB
    pub const MAX_MESSAGE_LEN: usize = 4096;

    pub fn from_error(iteration: u32, cause: &ExecutorError) -> Self {
        let mut message = cause.to_string();
        if message.len() > Self::MAX_MESSAGE_LEN {
            let mut end = Self::MAX_MESSAGE_LEN;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }
        Self {
            iteration,
            code: cause.code().to_string(),
            message,
            outcome_unknown: !cause.is_explicit_fail(),
        }
    }
}

/// Terminal result of one orchestration run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationOutcome {
    /// All iterations finalized; carries the last iteration's result
    Completed(IterationResult),
    /// Iteration `iteration` (1-based) failed; earlier ones stay final
    Failed {
        iteration: u32,
        cause: ExecutorError,
    },
}

impl OrchestrationOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, OrchestrationOutcome::Completed(_))
    }

    pub fn failed_iteration(&self) -> Option<u32> {
        match self {
            OrchestrationOutcome::Failed { iteration, .. } => Some(*iteration),
            OrchestrationOutcome::Completed(_) => None,
        }
    }
}

impl fmt::Display for OrchestrationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestrationOutcome::Completed(result) => write!(
                f,
                "COMPLETED tx={} recipient={} iteration={}",
                result.transaction_id, result.recipient, result.iteration
            ),
            OrchestrationOutcome::Failed { iteration, cause } => {
                write!(f, "FAILED iteration={} cause={}", iteration, cause)
            }
        }
    }
}
