//! Validated primitives shared across the triage workspace.
//!
//! Every value in this crate is checked once at construction and can be trusted afterwards:
//! - [`NonEmptyText`] guarantees trimmed, non-empty content
//! - [`SubjectId`] guarantees the subject identifier charset and length bounds
//! - [`UserText`] guarantees a trimmed, non-empty, length-bounded user utterance
//! - [`ThreadId`] wraps the reasoning engine's opaque conversation identifier
//! - [`CorrelationId`] is threaded through every external call for tracing

use serde::{Deserialize, Serialize};
use std::fmt;

/// Minimum length of a subject identifier, in characters.
pub const SUBJECT_ID_MIN_LEN: usize = 3;

/// Maximum length of a subject identifier, in characters.
pub const SUBJECT_ID_MAX_LEN: usize = 100;

/// Default upper bound on a single user message, in characters.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 4000;

/// Maximum length of an engine-issued thread identifier.
pub const THREAD_ID_MAX_LEN: usize = 200;

/// Errors that can occur when creating validated text types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TextError {
    /// The input text was empty or contained only whitespace
    #[error("Text cannot be empty")]
    Empty,

    /// The input exceeded the permitted length
    #[error("Text exceeds maximum length of {max} characters")]
    TooLong { max: usize },

    /// The input was shorter than permitted
    #[error("Text must be at least {min} characters")]
    TooShort { min: usize },

    /// The input contained characters outside the permitted set
    #[error("Text contains invalid characters: {0}")]
    InvalidCharacters(&'static str),
}

/// A string type that guarantees non-empty content.
///
/// This type wraps a `String` and ensures it contains at least one non-whitespace character.
/// The input is automatically trimmed of leading and trailing whitespace during construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NonEmptyText(String);

impl NonEmptyText {
    /// Creates a new `NonEmptyText` from the given input.
    ///
    /// The input is trimmed of leading and trailing whitespace. If the trimmed
    /// result is empty, an error is returned.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TextError::Empty);
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Returns the inner string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the wrapper and returns the owned string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

/// Identifier of the person being assessed.
///
/// Subject identifiers are supplied by callers and end up in storage paths, FHIR references
/// and ledger ownership fields, so they are restricted to `[A-Za-z0-9\-_@.]` and
/// 3 to 100 characters. Input is not trimmed: surrounding whitespace is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubjectId(String);

impl SubjectId {
    /// Validates and wraps a subject identifier.
    ///
    /// # Errors
    ///
    /// Returns [`TextError`] if the identifier is empty, outside the length bounds, or contains
    /// characters outside the permitted set.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let input = input.as_ref();
        if input.is_empty() {
            return Err(TextError::Empty);
        }

        let len = input.chars().count();
        if len < SUBJECT_ID_MIN_LEN {
            return Err(TextError::TooShort {
                min: SUBJECT_ID_MIN_LEN,
            });
        }
        if len > SUBJECT_ID_MAX_LEN {
            return Err(TextError::TooLong {
                max: SUBJECT_ID_MAX_LEN,
            });
        }

        let ok = input.bytes().all(|b| {
            matches!(b, b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' | b'-' | b'_' | b'@' | b'.')
        });
        if !ok {
            return Err(TextError::InvalidCharacters(
                "only alphanumeric, '-', '_', '@', '.' allowed",
            ));
        }

        Ok(Self(input.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A single user utterance, trimmed and bounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserText(NonEmptyText);

impl UserText {
    /// Trims `input` and checks it against `max_len` characters.
    ///
    /// # Errors
    ///
    /// Returns [`TextError::Empty`] for blank input and [`TextError::TooLong`] when the trimmed
    /// text has more than `max_len` characters.
    pub fn new(input: impl AsRef<str>, max_len: usize) -> Result<Self, TextError> {
        let text = NonEmptyText::new(input)?;
        if text.as_str().chars().count() > max_len {
            return Err(TextError::TooLong { max: max_len });
        }
        Ok(Self(text))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

/// Opaque conversation thread identifier issued by the reasoning engine.
///
/// The orchestrator never inspects the value; it is only forwarded between the caller
/// and the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThreadId(String);

impl ThreadId {
    /// Wraps an engine-issued thread identifier.
    ///
    /// # Errors
    ///
    /// Returns [`TextError`] if the identifier is blank, too long or contains whitespace.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TextError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(TextError::Empty);
        }
        if trimmed.len() > THREAD_ID_MAX_LEN {
            return Err(TextError::TooLong {
                max: THREAD_ID_MAX_LEN,
            });
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(TextError::InvalidCharacters("whitespace is not allowed"));
        }
        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Correlation identifier attached to every external call made on behalf of one turn.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generates a fresh correlation id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Accepts a caller-supplied correlation id if it is short and printable ASCII,
    /// otherwise generates a new one.
    pub fn from_header_or_generate(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v)
                if !v.is_empty()
                    && v.len() <= 128
                    && v.bytes().all(|b| b.is_ascii_graphic()) =>
            {
                Self(v.to_owned())
            }
            _ => Self::generate(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! string_newtype_impls {
    ($($ty:ident),* $(,)?) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.as_str())
                }
            }

            impl AsRef<str> for $ty {
                fn as_ref(&self) -> &str {
                    self.as_str()
                }
            }
        )*
    };
}

string_newtype_impls!(NonEmptyText, SubjectId, UserText, ThreadId, CorrelationId);

impl Serialize for NonEmptyText {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for NonEmptyText {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NonEmptyText::new(&s).map_err(serde::de::Error::custom)
    }
}

impl Serialize for SubjectId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SubjectId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        SubjectId::new(&s).map_err(serde::de::Error::custom)
    }
}

impl Serialize for ThreadId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ThreadId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ThreadId::new(&s).map_err(serde::de::Error::custom)
    }
}
