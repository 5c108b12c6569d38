//! Turn validation.
//!
//! A [`TurnRequest`] is untrusted caller input; [`TurnRequest::validate`] turns it into a
//! [`Turn`] whose fields are already checked. Validation happens before any external call.

use crate::constants::{
    MAX_USER_CONTEXT_ENTRIES, MAX_USER_CONTEXT_KEY_LEN, MAX_USER_CONTEXT_VALUE_LEN,
    SUBJECT_METADATA_KEY,
};
use std::collections::BTreeMap;
use triage_types::{SubjectId, TextError, ThreadId, UserText};

/// A field failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }

    fn text(field: &'static str, err: TextError) -> Self {
        Self::new(field, err.to_string())
    }
}

/// Raw input for one orchestration cycle.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub message: String,
    pub thread_id: Option<String>,
    pub subject_id: String,
    pub user_context: Option<BTreeMap<String, String>>,
}

/// A validated turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub subject_id: SubjectId,
    pub thread_id: Option<ThreadId>,
    pub user_text: UserText,
    pub user_context: BTreeMap<String, String>,
}

impl TurnRequest {
    /// Validate every field.
    ///
    /// # Arguments
    ///
    /// * `max_message_len` - Upper bound on the trimmed message, in characters.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] found, checking `subjectId`, `message`, `threadId`
    /// and `userContext` in that order.
    pub fn validate(self, max_message_len: usize) -> Result<Turn, ValidationError> {
        let subject_id =
            SubjectId::new(&self.subject_id).map_err(|e| ValidationError::text("subjectId", e))?;
        let user_text = UserText::new(&self.message, max_message_len)
            .map_err(|e| ValidationError::text("message", e))?;

        // An empty thread id from a form field means "no thread yet".
        let thread_id = match self.thread_id.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => {
                Some(ThreadId::new(raw).map_err(|e| ValidationError::text("threadId", e))?)
            }
        };

        let user_context = self.user_context.unwrap_or_default();
        validate_user_context(&user_context)?;

        Ok(Turn {
            subject_id,
            thread_id,
            user_text,
            user_context,
        })
    }
}

fn validate_user_context(context: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    if context.len() > MAX_USER_CONTEXT_ENTRIES {
        return Err(ValidationError::new(
            "userContext",
            format!("at most {MAX_USER_CONTEXT_ENTRIES} entries allowed"),
        ));
    }
    for (key, value) in context {
        if key.trim().is_empty() || key.chars().count() > MAX_USER_CONTEXT_KEY_LEN {
            return Err(ValidationError::new(
                "userContext",
                format!("keys must be 1-{MAX_USER_CONTEXT_KEY_LEN} characters"),
            ));
        }
        if key == SUBJECT_METADATA_KEY {
            return Err(ValidationError::new(
                "userContext",
                format!("'{SUBJECT_METADATA_KEY}' is reserved; use subjectId"),
            ));
        }
        if value.chars().count() > MAX_USER_CONTEXT_VALUE_LEN {
            return Err(ValidationError::new(
                "userContext",
                format!("value for '{key}' exceeds {MAX_USER_CONTEXT_VALUE_LEN} characters"),
            ));
        }
    }
    Ok(())
}
