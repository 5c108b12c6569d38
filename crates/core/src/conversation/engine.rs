//! The narrow interface to the external reasoning engine.
//!
//! Only five primitives are used: create a thread, post a message, start a run, read a run's
//! status, and fetch the latest assistant message. Conversation memory lives entirely in the
//! engine, keyed by the opaque [`ThreadId`].

use crate::context::CallContext;
use crate::retry::Retryable;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use triage_types::ThreadId;

/// Errors reported by a reasoning engine or by the driver while talking to it.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Connection failure, overload or server error. Safe to retry.
    #[error("reasoning engine unavailable: {0}")]
    Unavailable(String),

    /// Another run is still active on the thread.
    #[error("a run is already active on thread {thread_id}")]
    RunActive { thread_id: String },

    /// The engine refused the request for a semantic reason.
    #[error("reasoning engine rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The engine flagged the content as unsafe.
    #[error("content flagged by reasoning engine: {0}")]
    SafetyFlagged(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// The run reached a terminal state other than `completed`.
    #[error("run ended with status {status}: {detail}")]
    RunFailed { status: RunStatus, detail: String },

    #[error("no assistant message on thread {thread_id}")]
    NoAssistantMessage { thread_id: String },

    #[error("malformed engine response: {0}")]
    Malformed(String),

    #[error("{0} cancelled by caller")]
    Cancelled(&'static str),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl Retryable for EngineError {
    fn is_transient(&self) -> bool {
        matches!(self, EngineError::Unavailable(_))
    }

    fn is_timeout(&self) -> bool {
        matches!(self, EngineError::Timeout { .. })
    }

    fn timed_out(operation: &'static str, after: Duration) -> Self {
        EngineError::Timeout { operation, after }
    }

    fn cancelled(operation: &'static str) -> Self {
        EngineError::Cancelled(operation)
    }
}

/// Identifier of one reasoning pass over a thread.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a run as reported by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    Cancelling,
    RequiresAction,
    Completed,
    Failed,
    Cancelled,
    Expired,
    Incomplete,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    /// Whether polling can stop.
    ///
    /// `requires_action` counts as terminal: the driver never submits tool outputs, so such a
    /// run can make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed
                | RunStatus::Failed
                | RunStatus::Cancelled
                | RunStatus::Expired
                | RunStatus::Incomplete
                | RunStatus::RequiresAction
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::Cancelling => "cancelling",
            RunStatus::RequiresAction => "requires_action",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Expired => "expired",
            RunStatus::Incomplete => "incomplete",
            RunStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error detail attached to a failed run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub code: String,
    pub message: String,
}

impl RunFailure {
    /// Engine error codes that mean the content itself was refused.
    pub fn is_safety_flag(&self) -> bool {
        matches!(
            self.code.as_str(),
            "content_filter" | "content_policy_violation"
        )
    }
}

/// Snapshot of a run's state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunState {
    pub status: RunStatus,
    pub last_error: Option<RunFailure>,
}

impl RunState {
    pub fn new(status: RunStatus) -> Self {
        Self {
            status,
            last_error: None,
        }
    }
}

/// A user message to post on a thread.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct NewMessage {
    pub content: String,
    /// Forwarded to the engine verbatim (subject id, user context).
    pub metadata: BTreeMap<String, String>,
}

/// Core trait for reasoning engines.
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    /// Backend identifier for logs.
    fn id(&self) -> &str;

    async fn create_thread(&self, ctx: &CallContext) -> EngineResult<ThreadId>;

    async fn post_message(
        &self,
        thread: &ThreadId,
        message: &NewMessage,
        ctx: &CallContext,
    ) -> EngineResult<()>;

    /// Starts a reasoning pass. Fails with [`EngineError::RunActive`] if one is in progress.
    async fn start_run(&self, thread: &ThreadId, ctx: &CallContext) -> EngineResult<RunId>;

    async fn run_state(
        &self,
        thread: &ThreadId,
        run: &RunId,
        ctx: &CallContext,
    ) -> EngineResult<RunState>;

    /// Text of the most recent assistant message on the thread.
    async fn latest_assistant_message(
        &self,
        thread: &ThreadId,
        ctx: &CallContext,
    ) -> EngineResult<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_parses_unknown_values() {
        let status: RunStatus = serde_json::from_str("\"something_new\"").unwrap();
        assert_eq!(status, RunStatus::Unknown);
        assert!(!status.is_terminal());
    }

    #[test]
    fn test_terminal_statuses() {
        for s in [
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
            RunStatus::Expired,
        ] {
            assert!(s.is_terminal(), "{s} should be terminal");
        }
        for s in [RunStatus::Queued, RunStatus::InProgress, RunStatus::Cancelling] {
            assert!(!s.is_terminal(), "{s} should not be terminal");
        }
    }
}
