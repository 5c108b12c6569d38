//! # API REST
//!
//! REST API implementation for the triage service.
//!
//! Handles:
//! - HTTP endpoints with axum (`POST /assess`, `GET /health`)
//! - OpenAPI/Swagger documentation
//! - REST-specific concerns (JSON bodies, correlation id headers, CORS)
//!
//! Uses `api-shared` for DTOs and `triage-core` for the assessment itself.

#![warn(rust_2018_idioms)]

pub mod error;
mod handlers;

use api_shared::{AssessReq, AssessRes, ErrorBody, ErrorDetail, HealthRes, HealthService};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use triage_core::AssessmentOrchestrator;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use error::ApiError;

/// Application state for the REST API server.
///
/// Contains the orchestrator every turn is routed through and the health service describing
/// its backends.
#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<AssessmentOrchestrator>,
    health: HealthService,
}

impl AppState {
    pub fn new(orchestrator: AssessmentOrchestrator) -> Self {
        let backends = orchestrator.backends();
        Self {
            health: HealthService::new(backends.engine, backends.storage, backends.ledger),
            orchestrator: Arc::new(orchestrator),
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(handlers::health, handlers::assess),
    components(schemas(AssessReq, AssessRes, ErrorBody, ErrorDetail, HealthRes))
)]
pub struct ApiDoc;

/// Build the application router.
///
/// # Arguments
/// * `state` - Shared state handed to every handler
///
/// # Returns
/// The router with API routes, Swagger UI at `/swagger-ui` and the OpenAPI document at
/// `/api-docs/openapi.json`.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/assess", post(handlers::assess))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API on `addr` until the process is stopped.
///
/// # Errors
/// Returns an error if the address cannot be bound or the server fails while running.
pub async fn serve(addr: &str, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("-- Starting triage REST API on {}", addr);
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}
