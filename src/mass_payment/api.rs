//! Mass Payment API Layer
//!
//! Wire DTOs for the gateway and CLI. Amounts travel as strings so no float
//! ever touches a monetary value.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::checkpoint::OrchestrationCheckpoint;
use super::error::BatchError;
use super::state::BatchState;
use super::types::{BatchRequest, BatchRequestId, FailureRecord, IterationResult, Party};
use crate::money::{Amount, parse_amount};

// ============================================================================
// API Request/Response Types
// ============================================================================

/// API request for a new batch
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct MassPaymentApiRequest {
    /// Number of issue-and-pay iterations
    #[schema(example = 3)]
    pub iteration_count: u32,
    /// Amount per iteration as string
    #[schema(example = "100.00")]
    pub amount: String,
    /// ISO-4217 style currency code
    #[schema(example = "USD")]
    pub currency: String,
    /// Legal name of the recipient
    #[schema(example = "O=Bank B, L=New York, C=US")]
    pub recipient: String,
    /// Pay a fresh anonymous identity on every iteration
    #[serde(default = "default_anonymize")]
    pub anonymize: bool,
    /// Legal name of the notary
    #[schema(example = "O=Notary, L=Zurich, C=CH")]
    pub notary: String,
}

fn default_anonymize() -> bool {
    true
}

impl MassPaymentApiRequest {
    pub fn into_batch_request(self) -> Result<BatchRequest, BatchError> {
        if self.iteration_count == 0 {
            return Err(BatchError::InvalidIterationCount);
        }
        let quantity = parse_amount(&self.amount)?;
        let amount = Amount::new(quantity, &self.currency)?;
        Ok(BatchRequest::new(
            self.iteration_count,
            amount,
            Party::new(self.recipient.trim()),
            self.anonymize,
            Party::new(self.notary.trim()),
        ))
    }
}

/// Returned when a batch is accepted for asynchronous execution
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BatchAcceptedResponse {
    /// Batch request ID (ULID)
    pub request_id: String,
    pub status: String,
}

impl BatchAcceptedResponse {
    pub fn new(request_id: BatchRequestId, state: BatchState) -> Self {
        Self {
            request_id: request_id.to_string(),
            status: state.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct IterationResultDto {
    pub iteration: u32,
    pub transaction_id: String,
    pub recipient: String,
    pub anonymous: bool,
}

impl From<&IterationResult> for IterationResultDto {
    fn from(r: &IterationResult) -> Self {
        Self {
            iteration: r.iteration,
            transaction_id: r.transaction_id.to_string(),
            recipient: r.recipient.name.clone(),
            anonymous: r.recipient.anonymous,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FailureDto {
    pub iteration: u32,
    pub code: String,
    pub message: String,
    /// Ledger outcome of the failed iteration is unknown
    pub outcome_unknown: bool,
}

impl From<&FailureRecord> for FailureDto {
    fn from(f: &FailureRecord) -> Self {
        Self {
            iteration: f.iteration,
            code: f.code.clone(),
            message: f.message.clone(),
            outcome_unknown: f.outcome_unknown,
        }
    }
}

/// Full batch status
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BatchStatusResponse {
    pub request_id: String,
    /// PENDING, RUNNING, COMPLETED or FAILED
    pub status: String,
    pub iteration_count: u32,
    pub completed_iterations: u32,
    pub amount: String,
    pub currency: String,
    pub recipient: String,
    pub anonymize: bool,
    pub notary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_flight_iteration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result: Option<IterationResultDto>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDto>,
    /// Timestamps (milliseconds)
    pub created_at: i64,
    pub updated_at: i64,
}

impl BatchStatusResponse {
    pub fn from_checkpoint(checkpoint: &OrchestrationCheckpoint, state: BatchState) -> Self {
        let request = &checkpoint.request;
        Self {
            request_id: checkpoint.request_id.to_string(),
            status: state.as_str().to_string(),
            iteration_count: request.iteration_count,
            completed_iterations: checkpoint.completed_iterations,
            amount: request.amount.quantity().normalize().to_string(),
            currency: request.amount.currency().as_str().to_string(),
            recipient: request.recipient.name.clone(),
            anonymize: request.anonymize,
            notary: request.notary.name.clone(),
            in_flight_iteration: checkpoint.in_flight.as_ref().map(|f| f.iteration),
            last_result: checkpoint.last_result.as_ref().map(IterationResultDto::from),
            failure: checkpoint.failure.as_ref().map(FailureDto::from),
            created_at: checkpoint.created_at,
            updated_at: checkpoint.updated_at,
        }
    }
}

// ============================================================================
// Error Codes
// ============================================================================

pub mod error_codes {
    pub const INVALID_PARAMETER: i32 = -1001;
    pub const INVALID_AMOUNT: i32 = -1002;
    pub const UNKNOWN_PARTY: i32 = -1003;
    pub const NOT_A_NOTARY: i32 = -1004;
    pub const BATCH_NOT_FOUND: i32 = -2001;
    pub const ALREADY_RUNNING: i32 = -3001;
    pub const CANCELLED: i32 = -3002;
    pub const CHECKPOINT_FAILURE: i32 = -5000;
    pub const SERVICE_UNAVAILABLE: i32 = -5001;
}

/// Map an orchestrator error to its API error code
pub fn error_code(e: &BatchError) -> i32 {
    use error_codes::*;
    match e {
        BatchError::InvalidIterationCount | BatchError::InvalidRequestId(_) => INVALID_PARAMETER,
        BatchError::InvalidAmount(_) => INVALID_AMOUNT,
        BatchError::UnknownParty(_) => UNKNOWN_PARTY,
        BatchError::NotANotary(_) => NOT_A_NOTARY,
        BatchError::NotFound(_) => BATCH_NOT_FOUND,
        BatchError::AlreadyRunning(_) => ALREADY_RUNNING,
        BatchError::Cancelled { .. } => CANCELLED,
        BatchError::CheckpointInconsistency(_)
        | BatchError::CheckpointWrite { .. }
        | BatchError::InDoubt { .. } => CHECKPOINT_FAILURE,
        BatchError::Checkpoint(_) => SERVICE_UNAVAILABLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mass_payment::types::{InFlightIteration, IssueRef, TransactionId};
    use rust_decimal::Decimal;

    fn api_request() -> MassPaymentApiRequest {
        serde_json::from_value(serde_json::json!({
            "iteration_count": 3,
            "amount": "12.50",
            "currency": "USD",
            "recipient": "O=Bank B, L=New York, C=US",
            "notary": "O=Notary, L=Zurich, C=CH"
        }))
        .unwrap()
    }

    #[test]
    fn test_anonymize_defaults_to_true() {
        assert!(api_request().anonymize);
    }

    #[test]
    fn test_into_batch_request() {
        let request = api_request().into_batch_request().unwrap();
        assert_eq!(request.iteration_count, 3);
        assert_eq!(request.amount.quantity(), Decimal::new(1250, 2));
        assert_eq!(request.amount.currency().as_str(), "USD");
        assert_eq!(request.recipient, Party::new("O=Bank B, L=New York, C=US"));
    }

    #[test]
    fn test_into_batch_request_rejects_bad_input() {
        let mut zero = api_request();
        zero.iteration_count = 0;
        assert!(matches!(
            zero.into_batch_request(),
            Err(BatchError::InvalidIterationCount)
        ));

        let mut negative = api_request();
        negative.amount = "-1".into();
        assert!(matches!(
            negative.into_batch_request(),
            Err(BatchError::InvalidAmount(_))
        ));

        let mut currency = api_request();
        currency.currency = "dollars".into();
        assert!(matches!(
            currency.into_batch_request(),
            Err(BatchError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_status_from_checkpoint() {
        let request = api_request().into_batch_request().unwrap();
        let id = BatchRequestId::new();
        let mut checkpoint = OrchestrationCheckpoint::new(id, request);
        checkpoint.completed_iterations = 1;
        checkpoint.last_result = Some(IterationResult {
            iteration: 1,
            transaction_id: TransactionId::new("tx-1"),
            recipient: Party::anonymous("key-1"),
        });
        checkpoint.in_flight = Some(InFlightIteration {
            iteration: 2,
            issue_ref: IssueRef::for_iteration(id, 2),
        });

        let status = BatchStatusResponse::from_checkpoint(&checkpoint, BatchState::Running);
        assert_eq!(status.status, "RUNNING");
        assert_eq!(status.amount, "12.5");
        assert_eq!(status.in_flight_iteration, Some(2));
        assert!(status.last_result.as_ref().unwrap().anonymous);

        let json = serde_json::to_value(&status).unwrap();
        assert!(json.get("failure").is_none());
    }

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            error_code(&BatchError::NotFound("x".into())),
            error_codes::BATCH_NOT_FOUND
        );
        assert_eq!(
            error_code(&BatchError::AlreadyRunning("x".into())),
            error_codes::ALREADY_RUNNING
        );
    }
}
