pub mod handlers;
pub mod openapi;
pub mod state;
pub mod types;

use anyhow::Context;
use axum::{
    Json, Router,
    routing::{get, post},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use utoipa::OpenApi;

use crate::config::GatewayConfig;
use state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(handlers::health_check))
        .route("/api/v1/mass-payments", post(handlers::create_mass_payment))
        .route(
            "/api/v1/mass-payments/{request_id}",
            get(handlers::get_mass_payment),
        )
        .route(
            "/api/v1/mass-payments/{request_id}/resume",
            post(handlers::resume_mass_payment),
        )
        .with_state(state)
        // Stateless, added after with_state
        .route(
            "/api-docs/openapi.json",
            get(|| async { Json(openapi::ApiDoc::openapi()) }),
        )
}

/// Serve until ctrl-c, then trip the shared cancel signal and wait for
/// background runs to finish their current iteration
pub async fn run_server(config: &GatewayConfig, state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    tracing::info!(addr = %addr, "Gateway listening");
    tracing::info!("API Docs: http://{}/api-docs/openapi.json", addr);

    let shutdown = state.shutdown.clone();
    let served = axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
            }
            tracing::info!("Shutdown requested, running batches stop after their current iteration");
            shutdown.cancel();
        })
        .await
        .context("Server error");

    state.shutdown.cancel();
    state.drain().await;
    served
}
