//! OpenAPI documentation
//!
//! Served as JSON at `/api-docs/openapi.json`.

use utoipa::OpenApi;

use crate::gateway::handlers::HealthResponse;
use crate::mass_payment::api::{
    BatchAcceptedResponse, BatchStatusResponse, FailureDto, IterationResultDto,
    MassPaymentApiRequest,
};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Mass Payment API",
        version = "1.0.0",
        description = "Batched issue-and-pay with durable per-iteration checkpoints.",
        license(name = "MIT")
    ),
    servers(
        (url = "http://localhost:8080", description = "Development"),
    ),
    paths(
        crate::gateway::handlers::health_check,
        crate::gateway::handlers::create_mass_payment,
        crate::gateway::handlers::get_mass_payment,
        crate::gateway::handlers::resume_mass_payment,
    ),
    components(
        schemas(
            HealthResponse,
            MassPaymentApiRequest,
            BatchAcceptedResponse,
            BatchStatusResponse,
            IterationResultDto,
            FailureDto,
        )
    ),
    tags(
        (name = "System", description = "Service health"),
        (name = "MassPayment", description = "Batch submission and status"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_lists_all_routes() {
        let doc = ApiDoc::openapi();
        let paths: Vec<_> = doc.paths.paths.keys().cloned().collect();
        for expected in [
            "/api/v1/health",
            "/api/v1/mass-payments",
            "/api/v1/mass-payments/{request_id}",
            "/api/v1/mass-payments/{request_id}/resume",
        ] {
            assert!(paths.iter().any(|p| p == expected), "missing {}", expected);
        }
    }
}
