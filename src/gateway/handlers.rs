//! Mass payment HTTP handlers

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
};
use serde::Serialize;
use tracing::{info, warn};
use utoipa::ToSchema;

use super::state::AppState;
use super::types::{ApiError, ApiResult, accepted, ok};
use crate::mass_payment::{
    BatchAcceptedResponse, BatchError, BatchRequestId, BatchState, BatchStatusResponse,
    MassPaymentApiRequest, OrchestrationOutcome,
};

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    #[schema(example = 1703494800000_i64)]
    pub timestamp_ms: i64,
    /// Batches executing on this node
    pub running_batches: usize,
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, description = "Service healthy", body = HealthResponse, content_type = "application/json")
    ),
    tag = "System"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> ApiResult<HealthResponse> {
    ok(HealthResponse {
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
        running_batches: state.orchestrator.running_count(),
    })
}

/// Submit a batch
///
/// POST /api/v1/mass-payments
///
/// The batch is validated and checkpointed, then executed in the background.
#[utoipa::path(
    post,
    path = "/api/v1/mass-payments",
    request_body = MassPaymentApiRequest,
    responses(
        (status = 202, description = "Batch accepted", body = BatchAcceptedResponse),
        (status = 400, description = "Invalid parameters"),
        (status = 422, description = "Unknown recipient or notary"),
        (status = 503, description = "Checkpoint store unavailable")
    ),
    tag = "MassPayment"
)]
pub async fn create_mass_payment(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<MassPaymentApiRequest>, JsonRejection>,
) -> ApiResult<BatchAcceptedResponse> {
    let Json(req) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let request = req.into_batch_request()?;
    let request_id = state.orchestrator.submit(request).await?;

    run_in_background(&state, request_id).await;
    accepted(BatchAcceptedResponse::new(request_id, BatchState::Pending))
}

/// Get batch status
///
/// GET /api/v1/mass-payments/{request_id}
#[utoipa::path(
    get,
    path = "/api/v1/mass-payments/{request_id}",
    params(
        ("request_id" = String, Path, description = "Batch request ID (ULID format)")
    ),
    responses(
        (status = 200, description = "Batch status", body = BatchStatusResponse),
        (status = 400, description = "Invalid request ID format"),
        (status = 404, description = "Batch not found")
    ),
    tag = "MassPayment"
)]
pub async fn get_mass_payment(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> ApiResult<BatchStatusResponse> {
    let request_id = parse_request_id(&request_id)?;
    let checkpoint = state.orchestrator.checkpoint(request_id).await?;
    let status = state.orchestrator.state(request_id).await?;
    ok(BatchStatusResponse::from_checkpoint(&checkpoint, status))
}

/// Resume a pending or failed batch
///
/// POST /api/v1/mass-payments/{request_id}/resume
#[utoipa::path(
    post,
    path = "/api/v1/mass-payments/{request_id}/resume",
    params(
        ("request_id" = String, Path, description = "Batch request ID (ULID format)")
    ),
    responses(
        (status = 202, description = "Resume scheduled", body = BatchAcceptedResponse),
        (status = 404, description = "Batch not found"),
        (status = 409, description = "Batch already running")
    ),
    tag = "MassPayment"
)]
pub async fn resume_mass_payment(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> ApiResult<BatchAcceptedResponse> {
    let request_id = parse_request_id(&request_id)?;
    if state.orchestrator.is_running(request_id) {
        return Err(BatchError::AlreadyRunning(request_id.to_string()).into());
    }
    let status = state.orchestrator.state(request_id).await?;
    info!(request_id = %request_id, from = %status, "Resume requested");

    run_in_background(&state, request_id).await;
    accepted(BatchAcceptedResponse::new(request_id, status))
}

fn parse_request_id(s: &str) -> Result<BatchRequestId, ApiError> {
    s.parse()
        .map_err(|_| ApiError::from(BatchError::InvalidRequestId(s.to_string())))
}

async fn run_in_background(state: &Arc<AppState>, request_id: BatchRequestId) {
    let runner = Arc::clone(state);
    state
        .spawn_tracked(async move {
            match runner.orchestrator.run(request_id, &runner.shutdown).await {
                Ok(OrchestrationOutcome::Completed(result)) => {
                    info!(request_id = %request_id, tx_id = %result.transaction_id, "Batch run finished");
                }
                Ok(OrchestrationOutcome::Failed { iteration, cause }) => {
                    warn!(request_id = %request_id, iteration, error = %cause, "Batch run failed");
                }
                Err(e) => {
                    warn!(request_id = %request_id, code = e.code(), error = %e, "Batch run stopped");
                }
            }
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::router;
    use crate::mass_payment::{
        CancelSignal, CashPaymentExecutor, MemoryCheckpointStore, Party, PaymentBatchOrchestrator,
        SimulatedNetwork,
    };
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    const BOB: &str = "O=Bank B, L=New York, C=US";
    const NOTARY: &str = "O=Notary, L=Zurich, C=CH";

    fn app() -> (axum::Router, Arc<SimulatedNetwork>) {
        let (state, net) = app_state(SimulatedNetwork::new());
        (router(state), net)
    }

    fn app_state(net: SimulatedNetwork) -> (Arc<AppState>, Arc<SimulatedNetwork>) {
        let net = Arc::new(net);
        let me = net.register_party("O=Bank A, L=London, C=GB");
        net.register_party(BOB);
        net.register_notary(NOTARY);
        let executor =
            CashPaymentExecutor::new(me, net.clone(), net.clone(), net.clone(), net.clone());
        let orchestrator = PaymentBatchOrchestrator::new(
            Arc::new(MemoryCheckpointStore::new()),
            Arc::new(executor),
            net.clone(),
        );
        let state = AppState::new(Arc::new(orchestrator), Arc::new(CancelSignal::new()));
        (Arc::new(state), net)
    }

    async fn send(
        app: &axum::Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(json) => Body::from(json.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn payment(recipient: &str, amount: &str) -> serde_json::Value {
        serde_json::json!({
            "iteration_count": 3,
            "amount": amount,
            "currency": "USD",
            "recipient": recipient,
            "notary": NOTARY
        })
    }

    async fn wait_for(app: &axum::Router, id: &str, status: &str) -> serde_json::Value {
        for _ in 0..100 {
            let (_, body) = send(app, "GET", &format!("/api/v1/mass-payments/{}", id), None).await;
            if body["data"]["status"] == status {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("batch {} never reached {}", id, status);
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let (status, body) = send(&app, "GET", "/api/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], 0);
        assert_eq!(body["data"]["running_batches"], 0);
    }

    #[tokio::test]
    async fn test_create_then_poll_until_completed() {
        let (app, net) = app();
        let (status, body) = send(
            &app,
            "POST",
            "/api/v1/mass-payments",
            Some(payment(BOB, "25.00")),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["data"]["status"], "PENDING");
        let id = body["data"]["request_id"].as_str().unwrap().to_string();

        let done = wait_for(&app, &id, "COMPLETED").await;
        assert_eq!(done["data"]["completed_iterations"], 3);
        assert_eq!(done["data"]["amount"], "25");
        assert_eq!(done["data"]["last_result"]["iteration"], 3);
        assert_eq!(done["data"]["last_result"]["anonymous"], true);
        assert_eq!(net.finalized().len(), 3);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_input() {
        let (app, _) = app();

        let (status, body) = send(
            &app,
            "POST",
            "/api/v1/mass-payments",
            Some(payment(BOB, "0")),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], -1002);

        let (status, body) = send(
            &app,
            "POST",
            "/api/v1/mass-payments",
            Some(payment("O=Nobody, L=Nowhere, C=XX", "1")),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], -1003);

        let (status, _) = send(
            &app,
            "POST",
            "/api/v1/mass-payments",
            Some(serde_json::json!({ "amount": "1" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_unknown_and_malformed_ids() {
        let (app, _) = app();
        let (status, _) = send(&app, "GET", "/api/v1/mass-payments/not-a-ulid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let unknown = BatchRequestId::new();
        let (status, body) =
            send(&app, "GET", &format!("/api/v1/mass-payments/{}", unknown), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], -2001);
    }

    #[tokio::test]
    async fn test_resume_failed_batch() {
        let (app, net) = app();
        net.reject_proposal_at(2);

        let (_, body) = send(
            &app,
            "POST",
            "/api/v1/mass-payments",
            Some(payment(BOB, "1")),
        )
        .await;
        let id = body["data"]["request_id"].as_str().unwrap().to_string();

        let failed = wait_for(&app, &id, "FAILED").await;
        assert_eq!(failed["data"]["failure"]["iteration"], 2);
        assert_eq!(failed["data"]["completed_iterations"], 1);

        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/v1/mass-payments/{}/resume", id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["data"]["status"], "FAILED");

        wait_for(&app, &id, "COMPLETED").await;
        assert_eq!(net.finalized().len(), 3);
    }

    #[tokio::test]
    async fn test_openapi_document_served() {
        let (app, _) = app();
        let (status, body) = send(&app, "GET", "/api-docs/openapi.json", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["paths"]["/api/v1/mass-payments"].is_object());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_running_batch_to_checkpoint() {
        let (state, net) =
            app_state(SimulatedNetwork::new().with_latency(Duration::from_millis(20)));
        let app = router(state.clone());
        let mut big = payment(BOB, "2");
        big["iteration_count"] = serde_json::json!(50);

        let (status, body) = send(&app, "POST", "/api/v1/mass-payments", Some(big)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let id: BatchRequestId = body["data"]["request_id"].as_str().unwrap().parse().unwrap();
        wait_for(&app, &id.to_string(), "RUNNING").await;

        state.shutdown.cancel();
        state.drain().await;

        assert!(!state.orchestrator.is_running(id));
        let checkpoint = state.orchestrator.checkpoint(id).await.unwrap();
        assert!(checkpoint.in_flight.is_none());
        assert!(checkpoint.completed_iterations < 50);
        assert_eq!(net.finalized().len() as u32, checkpoint.completed_iterations);
    }
}
