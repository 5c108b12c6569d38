//! Mapping of failures to HTTP responses.

use api_shared::{ErrorBody, CORRELATION_ID_HEADER};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use triage_core::{AssessError, ErrorCode};
use triage_types::CorrelationId;

/// A failed request, rendered as `{"error": {code, message, correlationId}}`.
#[derive(Debug)]
pub struct ApiError {
    code: ErrorCode,
    message: String,
    correlation_id: CorrelationId,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>, correlation_id: CorrelationId) -> Self {
        Self {
            code,
            message: message.into(),
            correlation_id,
        }
    }

    /// Wrap a turn failure. Details are logged here; the caller only sees the public message.
    pub fn from_assess(err: AssessError, correlation_id: CorrelationId) -> Self {
        let code = err.code();
        match code {
            ErrorCode::ValidationError | ErrorCode::SafetyError => tracing::info!(
                correlation_id = %correlation_id,
                code = %code,
                error = %err,
                "turn rejected"
            ),
            _ => tracing::error!(
                correlation_id = %correlation_id,
                code = %code,
                error = %err,
                "turn failed"
            ),
        }
        Self::new(code, err.public_message(), correlation_id)
    }

    pub fn internal(reason: impl std::fmt::Display, correlation_id: CorrelationId) -> Self {
        tracing::error!(correlation_id = %correlation_id, error = %reason, "internal error");
        Self::new(
            ErrorCode::InternalError,
            "an internal error occurred",
            correlation_id,
        )
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody::new(
            self.code.as_str(),
            self.message,
            self.correlation_id.as_str(),
        );

        let mut response = (status, Json(body)).into_response();
        if let Ok(value) = HeaderValue::from_str(self.correlation_id.as_str()) {
            response.headers_mut().insert(CORRELATION_ID_HEADER, value);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triage_core::ValidationError;

    #[test]
    fn test_validation_error_maps_to_400() {
        let err = ApiError::from_assess(
            AssessError::Validation(ValidationError::new("message", "must not be empty")),
            CorrelationId::generate(),
        );
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().contains_key(CORRELATION_ID_HEADER));
    }

    #[test]
    fn test_internal_error_hides_reason() {
        let err = ApiError::internal("disk on fire", CorrelationId::generate());
        assert_eq!(err.code(), ErrorCode::InternalError);
        assert_eq!(err.message, "an internal error occurred");
    }
}
