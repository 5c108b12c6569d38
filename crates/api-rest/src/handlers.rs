use crate::error::ApiError;
use crate::AppState;
use api_shared::{AssessReq, AssessRes, ErrorBody, HealthRes, CORRELATION_ID_HEADER};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio_util::sync::CancellationToken;
use triage_core::{CallContext, ErrorCode, OrchestrationResult, TurnRequest};
use triage_types::CorrelationId;

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check response", body = HealthRes)
    )
)]
/// Health check endpoint for the REST API
///
/// Reports liveness and the configured engine, storage and ledger backends.
#[axum::debug_handler]
pub(crate) async fn health(State(state): State<AppState>) -> Json<HealthRes> {
    Json(state.health.check_health())
}

#[utoipa::path(
    post,
    path = "/assess",
    request_body = AssessReq,
    params(
        (
            "X-Correlation-Id" = Option<String>,
            Header,
            description = "Caller correlation id, echoed back"
        )
    ),
    responses(
        (status = 200, description = "Turn processed", body = AssessRes),
        (status = 400, description = "Invalid turn or unsafe content", body = ErrorBody),
        (status = 502, description = "Reasoning engine or record store failure", body = ErrorBody),
        (status = 504, description = "Reasoning engine timed out", body = ErrorBody),
        (status = 500, description = "Internal server error", body = ErrorBody)
    )
)]
/// Process one assessment turn
///
/// The turn runs in its own task. If the client goes away, the wait for the engine's reply is
/// cancelled; once a reply exists, records and ledger entries are still written.
///
/// # Errors
/// Returns the stable error code and HTTP status of the failure, with the correlation id.
#[axum::debug_handler]
pub(crate) async fn assess(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<AssessReq>, JsonRejection>,
) -> Result<Response, ApiError> {
    let correlation_id = CorrelationId::from_header_or_generate(
        headers
            .get(CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok()),
    );

    let Json(req) = body.map_err(|rejection| {
        ApiError::new(
            ErrorCode::ValidationError,
            format!("invalid request body: {}", rejection.body_text()),
            correlation_id.clone(),
        )
    })?;

    let cancel = CancellationToken::new();
    // Dropped with this handler future when the client disconnects.
    let _disconnect = cancel.clone().drop_guard();
    let ctx = CallContext::new(correlation_id.clone()).with_cancellation(cancel);

    let orchestrator = state.orchestrator.clone();
    let turn = TurnRequest {
        message: req.message,
        thread_id: req.thread_id,
        subject_id: req.subject_id,
        user_context: req.user_context,
    };
    let outcome = tokio::spawn(async move { orchestrator.assess(turn, &ctx).await })
        .await
        .map_err(|e| ApiError::internal(e, correlation_id.clone()))?;

    let result = outcome.map_err(|e| ApiError::from_assess(e, correlation_id.clone()))?;
    let res = to_assess_res(result).map_err(|e| ApiError::internal(e, correlation_id.clone()))?;

    let mut response = Json(res).into_response();
    if let Ok(value) = HeaderValue::from_str(correlation_id.as_str()) {
        response.headers_mut().insert(CORRELATION_ID_HEADER, value);
    }
    Ok(response)
}

fn to_assess_res(result: OrchestrationResult) -> serde_json::Result<AssessRes> {
    let resources = result
        .resources
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?;
    let ledger_receipt = result
        .ledger_receipt
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?;

    Ok(AssessRes {
        reply: result.reply_text,
        session_id: result.thread_id.to_string(),
        thread_id: result.thread_id.to_string(),
        subject_id: result.subject_id.to_string(),
        completion_status: result.completion_status.as_str().to_owned(),
        thread_forked: result.thread_forked,
        correlation_id: result.correlation_id.to_string(),
        resources,
        ledger_receipt,
        ledger_error: result.ledger_error,
    })
}
