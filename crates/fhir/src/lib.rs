//! FHIR wire/boundary support for structured triage records.
//!
//! This crate provides the **wire models** produced at the end of a symptom assessment and the
//! **canonical form** used to hash them for the audit ledger:
//! - [`Observation`]: the narrative outcome of an assessment
//! - [`RiskAssessment`]: the qualitative (and optionally numeric) risk derived from it
//! - [`StructuredRecord`]: the polymorphic carrier persisted by record stores
//! - [`canonical`]: deterministic JSON rendering and SHA-256 content hashing
//!
//! This crate focuses on:
//! - FHIR R4 semantic alignment of the JSON shape
//! - serialisation/deserialisation with useful error paths
//! - invariants every record must carry (fixed `final` status, subject binding)
//!
//! Transport (REST calls to a FHIR server) lives in the core crate.

pub mod canonical;
pub mod data_types;
pub mod observation;
pub mod record;
pub mod risk_assessment;

// Re-export facades
pub use canonical::{canonical_json, content_hash, ContentHash};
pub use data_types::{Annotation, CodeableConcept, Coding, Meta, RecordStatus, Reference};
pub use observation::Observation;
pub use record::{ResourceId, ResourceType, StructuredRecord};
pub use risk_assessment::{RiskAssessment, RiskLevel, RiskPrediction};

/// `meta.source` stamped on every record produced by the assessment orchestrator.
pub const RECORD_SOURCE: &str = "urn:triage:assessment-orchestrator";

/// Errors returned by the `fhir` boundary crate.
#[derive(Debug, thiserror::Error)]
pub enum FhirError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("translation error: {0}")]
    Translation(String),

    #[error("subject binding violated: record references {found}, expected {expected}")]
    SubjectMismatch { expected: String, found: String },
}

/// Type alias for Results that can fail with a [`FhirError`].
pub type FhirResult<T> = Result<T, FhirError>;
