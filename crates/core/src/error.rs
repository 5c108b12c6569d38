use crate::conversation::EngineError;
use crate::records::StoreError;
use crate::synthesizer::SynthesisError;
use crate::validation::ValidationError;
use serde::Serialize;
use std::fmt;

/// Errors that fail a whole turn.
///
/// Ledger failures never appear here; they are reported per item in the ledger receipt.
#[derive(Debug, thiserror::Error)]
pub enum AssessError {
    #[error("invalid turn: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("failed to persist clinical record: {0}")]
    Storage(#[from] StoreError),

    #[error("failed to synthesise clinical records: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type AssessResult<T> = Result<T, AssessError>;

/// Stable error code surfaced to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    SafetyError,
    EngineError,
    TimeoutError,
    StorageError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::SafetyError => "SAFETY_ERROR",
            ErrorCode::EngineError => "ENGINE_ERROR",
            ErrorCode::TimeoutError => "TIMEOUT_ERROR",
            ErrorCode::StorageError => "STORAGE_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// HTTP status the inbound API answers with.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::ValidationError | ErrorCode::SafetyError => 400,
            ErrorCode::EngineError | ErrorCode::StorageError => 502,
            ErrorCode::TimeoutError => 504,
            ErrorCode::InternalError => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AssessError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AssessError::Validation(_) => ErrorCode::ValidationError,
            AssessError::Engine(EngineError::SafetyFlagged(_)) => ErrorCode::SafetyError,
            AssessError::Engine(EngineError::Timeout { .. }) => ErrorCode::TimeoutError,
            AssessError::Engine(_) => ErrorCode::EngineError,
            AssessError::Storage(_) => ErrorCode::StorageError,
            AssessError::Synthesis(_) | AssessError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Message safe to return to callers.
    ///
    /// Validation and safety messages are passed through; everything else is summarised so
    /// upstream details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            AssessError::Validation(e) => e.to_string(),
            AssessError::Engine(EngineError::SafetyFlagged(_)) => {
                "the message was flagged as unsafe by the assessment service".into()
            }
            AssessError::Engine(EngineError::Timeout { .. }) => {
                "the assessment service did not respond in time".into()
            }
            AssessError::Engine(_) => "the assessment service failed to respond".into(),
            AssessError::Storage(_) => "the clinical record could not be stored".into(),
            AssessError::Synthesis(_) | AssessError::Internal(_) => {
                "an internal error occurred".into()
            }
        }
    }
}
