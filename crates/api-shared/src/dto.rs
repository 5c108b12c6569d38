//! Wire DTOs for the inbound API.
//!
//! Field names are camelCase on the wire. Clinical resources and ledger receipts are carried as
//! opaque JSON objects; their shapes are owned by the `fhir` crate and the ledger client.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

/// One conversational turn submitted by a caller.
///
/// `message` and `subjectId` default to empty so that a missing field is reported by turn
/// validation with a field name, rather than as a body decoding failure.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AssessReq {
    #[serde(default)]
    #[schema(example = "I have had a headache for three days")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default)]
    #[schema(example = "patient-abc")]
    pub subject_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_context: Option<BTreeMap<String, String>>,
}

/// Outcome of one turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AssessRes {
    /// Assistant reply with completion markers removed.
    pub reply: String,
    pub thread_id: String,
    pub subject_id: String,
    /// Same value as `threadId`; the engine thread is the triage session.
    pub session_id: String,
    /// `IN_PROGRESS`, `COMPLETE` or `ESCALATE`.
    #[schema(example = "IN_PROGRESS")]
    pub completion_status: String,
    pub thread_forked: bool,
    pub correlation_id: String,
    /// Persisted `observation` and `riskAssessment`, present once the assessment is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub resources: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub ledger_receipt: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger_error: Option<String>,
}

/// Error envelope: `{"error": {"code", "message", "correlationId"}}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    #[schema(example = "VALIDATION_ERROR")]
    pub code: String,
    pub message: String,
    pub correlation_id: String,
}

impl ErrorBody {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                correlation_id: correlation_id.into(),
            },
        }
    }
}

/// Liveness plus the backends the service was started with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthRes {
    pub ok: bool,
    pub message: String,
    pub engine: String,
    pub storage: String,
    /// Absent when ledger logging is disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_assess_req_accepts_minimal_body() {
        let req: AssessReq =
            serde_json::from_value(json!({"message": "hello", "subjectId": "patient-abc"}))
                .unwrap();
        assert_eq!(req.subject_id, "patient-abc");
        assert!(req.thread_id.is_none());
        assert!(req.user_context.is_none());
    }

    #[test]
    fn test_assess_req_missing_fields_default_to_empty() {
        let req: AssessReq = serde_json::from_value(json!({})).unwrap();
        assert!(req.message.is_empty());
        assert!(req.subject_id.is_empty());
    }

    #[test]
    fn test_error_body_shape() {
        let body = ErrorBody::new("VALIDATION_ERROR", "message: must not be empty", "abc");
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"error": {
                "code": "VALIDATION_ERROR",
                "message": "message: must not be empty",
                "correlationId": "abc"
            }})
        );
    }

    #[test]
    fn test_assess_res_omits_absent_optionals() {
        let res = AssessRes {
            reply: "How long?".into(),
            thread_id: "thread_1".into(),
            subject_id: "patient-abc".into(),
            session_id: "thread_1".into(),
            completion_status: "IN_PROGRESS".into(),
            thread_forked: false,
            correlation_id: "c".into(),
            resources: None,
            ledger_receipt: None,
            ledger_error: None,
        };
        let value = serde_json::to_value(&res).unwrap();
        assert!(value.get("resources").is_none());
        assert!(value.get("ledgerReceipt").is_none());
        assert_eq!(value["sessionId"], "thread_1");
    }
}
