//! Clinical record store.
//!
//! Records are addressed by `(subject, resource type, resource id)`. Two interchangeable
//! backends implement [`RecordStore`]:
//! - [`LocalRecordStore`]: JSON files on disk, for development
//! - [`ManagedRecordStore`]: a FHIR REST server, for production
//!
//! The backend is chosen once at construction; callers only see the trait.
//!
//! ## Idempotency
//!
//! Every `put` carries an [`IdempotencyKey`], derived from the record address unless the caller
//! supplies one. Repeating a `put` with the same key and identical content is a no-op that
//! returns the original location. Changed content at the same address creates a new version.

pub mod local;
pub mod managed;

pub use local::LocalRecordStore;
pub use managed::ManagedRecordStore;

use crate::context::CallContext;
use crate::retry::Retryable;
use async_trait::async_trait;
use fhir::{FhirError, ResourceId, ResourceType, StructuredRecord};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use triage_types::SubjectId;

/// Maximum length of a caller-supplied idempotency key.
const IDEMPOTENCY_KEY_MAX_LEN: usize = 256;

/// Errors returned by record store backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{resource_type}/{id} not found")]
    NotFound {
        resource_type: ResourceType,
        id: String,
    },

    /// Connection failure, overload or server error. Safe to retry.
    #[error("record store unavailable: {0}")]
    Unavailable(String),

    #[error("record store rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("idempotency key {key} already used for {existing}")]
    KeyConflict { key: String, existing: String },

    #[error("invalid record address: {0}")]
    InvalidAddress(String),

    #[error("invalid idempotency key: {0}")]
    InvalidKey(String),

    #[error("corrupt stored record at {location}: {reason}")]
    Corrupt { location: String, reason: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("{0} cancelled by caller")]
    Cancelled(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Record(#[from] FhirError),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    fn is_timeout(&self) -> bool {
        matches!(self, StoreError::Timeout { .. })
    }

    fn timed_out(operation: &'static str, after: Duration) -> Self {
        StoreError::Timeout { operation, after }
    }

    fn cancelled(operation: &'static str) -> Self {
        StoreError::Cancelled(operation)
    }
}

/// Token that makes repeated writes of the same content collapse into one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Key derived from the record address: `<subject>/<ResourceType>/<id>`.
    pub fn derive(subject: &SubjectId, resource_type: ResourceType, id: &ResourceId) -> Self {
        Self(format!("{subject}/{resource_type}/{id}"))
    }

    /// Key derived from a record's own subject and address.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Record`] if the record's subject reference is not a patient.
    pub fn for_record(record: &StructuredRecord) -> StoreResult<Self> {
        let subject = record.subject_id()?;
        Ok(Self::derive(&subject, record.resource_type(), record.id()))
    }

    /// Caller-supplied key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidKey`] if the key is empty, too long or contains control
    /// characters.
    pub fn explicit(key: impl AsRef<str>) -> StoreResult<Self> {
        let key = key.as_ref().trim();
        if key.is_empty() {
            return Err(StoreError::InvalidKey("key cannot be empty".into()));
        }
        if key.chars().count() > IDEMPOTENCY_KEY_MAX_LEN {
            return Err(StoreError::InvalidKey(format!(
                "key longer than {IDEMPOTENCY_KEY_MAX_LEN} characters"
            )));
        }
        if key.chars().any(char::is_control) {
            return Err(StoreError::InvalidKey(
                "key contains control characters".into(),
            ));
        }
        Ok(Self(key.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercase hex SHA-256 of the key, safe to use as a file name.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a successful `put`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PutOutcome {
    pub id: ResourceId,
    pub resource_type: ResourceType,
    /// Version-specific location, `<ResourceType>/<id>/_history/<version>`.
    pub location: String,
    pub version_id: u64,
    /// False when the write was collapsed into an existing identical version.
    pub created: bool,
}

impl PutOutcome {
    pub(crate) fn new(record: &StructuredRecord, version_id: u64, created: bool) -> Self {
        Self {
            id: record.id().clone(),
            resource_type: record.resource_type(),
            location: record.location(version_id),
            version_id,
            created,
        }
    }
}

/// Records returned by a listing, with summaries of what they cover.
///
/// Only constructible through [`RecordListing::from_records`], so `count` always equals the
/// number of resources.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordListing {
    resources: Vec<StructuredRecord>,
    count: usize,
    resource_types: Vec<String>,
    patient_ids: Vec<String>,
}

impl RecordListing {
    /// Builds a listing ordered by creation time, then type, then id.
    pub fn from_records(mut resources: Vec<StructuredRecord>) -> Self {
        resources.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.resource_type().as_str().cmp(b.resource_type().as_str()))
                .then_with(|| a.id().cmp(b.id()))
        });

        let resource_types: BTreeSet<String> = resources
            .iter()
            .map(|r| r.resource_type().to_string())
            .collect();
        let patient_ids: BTreeSet<String> = resources
            .iter()
            .filter_map(|r| r.subject_id().ok())
            .map(|s| s.to_string())
            .collect();

        Self {
            count: resources.len(),
            resources,
            resource_types: resource_types.into_iter().collect(),
            patient_ids: patient_ids.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::from_records(Vec::new())
    }

    pub fn resources(&self) -> &[StructuredRecord] {
        &self.resources
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn resource_types(&self) -> &[String] {
        &self.resource_types
    }

    pub fn patient_ids(&self) -> &[String] {
        &self.patient_ids
    }

    pub fn into_resources(self) -> Vec<StructuredRecord> {
        self.resources
    }
}

/// Backend-agnostic clinical record store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Short backend name for health reporting and logs.
    fn backend(&self) -> &'static str;

    /// Persist `record`.
    ///
    /// With `key` absent the key is derived from the record address.
    async fn put(
        &self,
        record: &StructuredRecord,
        key: Option<&IdempotencyKey>,
        ctx: &CallContext,
    ) -> StoreResult<PutOutcome>;

    /// Latest version of a record, or [`StoreError::NotFound`].
    async fn get(
        &self,
        subject: &SubjectId,
        resource_type: ResourceType,
        id: &ResourceId,
        ctx: &CallContext,
    ) -> StoreResult<StructuredRecord>;

    /// Every stored version of a record, oldest first.
    async fn history(
        &self,
        subject: &SubjectId,
        resource_type: ResourceType,
        id: &ResourceId,
        ctx: &CallContext,
    ) -> StoreResult<Vec<StructuredRecord>>;

    /// Latest version of every record for `subject`. An unknown subject yields an empty listing.
    async fn list_by_subject(
        &self,
        subject: &SubjectId,
        ctx: &CallContext,
    ) -> StoreResult<RecordListing>;

    /// Latest version of every record of `resource_type`, across subjects.
    async fn list_by_type(
        &self,
        resource_type: ResourceType,
        ctx: &CallContext,
    ) -> StoreResult<RecordListing>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use fhir::Observation;

    fn observation(subject: &str, offset_secs: i64) -> StructuredRecord {
        let subject = SubjectId::new(subject).unwrap();
        Observation::assessment_narrative(
            ResourceId::generate(),
            &subject,
            "narrative",
            Utc::now() + ChronoDuration::seconds(offset_secs),
        )
        .into()
    }

    #[test]
    fn test_derived_key_uses_address() {
        let subject = SubjectId::new("patient-abc").unwrap();
        let id = ResourceId::parse("obs-1").unwrap();
        let key = IdempotencyKey::derive(&subject, ResourceType::Observation, &id);
        assert_eq!(key.as_str(), "patient-abc/Observation/obs-1");
        assert_eq!(key.digest().len(), 64);
    }

    #[test]
    fn test_explicit_key_validation() {
        assert!(IdempotencyKey::explicit("  ").is_err());
        assert!(IdempotencyKey::explicit("a\nb").is_err());
        assert!(IdempotencyKey::explicit("x".repeat(257)).is_err());
        assert_eq!(IdempotencyKey::explicit(" turn-42 ").unwrap().as_str(), "turn-42");
    }

    #[test]
    fn test_listing_count_matches_and_summaries_are_sorted() {
        let listing = RecordListing::from_records(vec![
            observation("zeta-patient", 2),
            observation("alpha-patient", 1),
            observation("alpha-patient", 0),
        ]);
        assert_eq!(listing.count(), listing.resources().len());
        assert_eq!(listing.count(), 3);
        assert_eq!(listing.patient_ids(), ["alpha-patient", "zeta-patient"]);
        assert_eq!(listing.resource_types(), ["Observation"]);
        assert!(listing.resources()[0].created_at() <= listing.resources()[1].created_at());
    }

    #[test]
    fn test_empty_listing_serialises_zero_count() {
        let value = serde_json::to_value(RecordListing::empty()).unwrap();
        assert_eq!(value["count"], 0);
        assert_eq!(value["resources"], serde_json::json!([]));
        assert_eq!(value["patientIds"], serde_json::json!([]));
    }
}
