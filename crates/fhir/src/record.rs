//! The polymorphic structured record and its addressing primitives.
//!
//! A [`StructuredRecord`] is addressed by `(subject, resource type, resource id)`. The JSON form
//! is internally tagged by `resourceType`, matching the FHIR convention, so a stored record can be
//! read back without knowing its variant in advance.

use crate::canonical::{content_hash, ContentHash};
use crate::{FhirError, FhirResult, Observation, Reference, RiskAssessment};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use triage_types::SubjectId;

/// Maximum length of a FHIR logical id.
const RESOURCE_ID_MAX_LEN: usize = 64;

/// FHIR logical id of a resource (`[A-Za-z0-9\-.]{1,64}`).
///
/// Freshly generated ids are hyphenated UUID v4 values, independent of the subject.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(String);

impl ResourceId {
    /// Generates a new globally unique resource id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Validates an externally supplied resource id.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::InvalidInput`] if `input` is not a valid FHIR logical id.
    pub fn parse(input: &str) -> FhirResult<Self> {
        if input.is_empty() || input.len() > RESOURCE_ID_MAX_LEN {
            return Err(FhirError::InvalidInput(format!(
                "resource id must be 1-{RESOURCE_ID_MAX_LEN} characters"
            )));
        }
        let ok = input
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' | b'-' | b'.'));
        if !ok {
            return Err(FhirError::InvalidInput(format!(
                "resource id contains invalid characters: {input}"
            )));
        }
        Ok(Self(input.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ResourceId {
    type Err = FhirError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ResourceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ResourceId::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Closed set of resource types the orchestrator produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    Observation,
    RiskAssessment,
}

impl ResourceType {
    pub const ALL: [ResourceType; 2] = [ResourceType::Observation, ResourceType::RiskAssessment];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Observation => "Observation",
            ResourceType::RiskAssessment => "RiskAssessment",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = FhirError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Observation" => Ok(ResourceType::Observation),
            "RiskAssessment" => Ok(ResourceType::RiskAssessment),
            other => Err(FhirError::InvalidInput(format!(
                "unsupported resource type: {other}"
            ))),
        }
    }
}

/// A standardised clinical resource synthesised from an assessment outcome.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resourceType")]
pub enum StructuredRecord {
    Observation(Observation),
    RiskAssessment(RiskAssessment),
}

impl StructuredRecord {
    /// Parse a record from JSON text.
    ///
    /// This uses `serde_path_to_error` to surface the path of the failing field
    /// (e.g. `prediction[0].probabilityDecimal`) when the JSON does not match the wire schema.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::Translation`] on any schema mismatch.
    pub fn parse_json(json_text: &str) -> FhirResult<Self> {
        let mut deserializer = serde_json::Deserializer::from_str(json_text);
        serde_path_to_error::deserialize::<_, StructuredRecord>(&mut deserializer).map_err(|err| {
            let path = err.path().to_string();
            let source = err.into_inner();
            let path = if path.is_empty() || path == "." {
                "<root>".to_owned()
            } else {
                path
            };
            FhirError::Translation(format!("record schema mismatch at {path}: {source}"))
        })
    }

    /// Parse a record from an already-decoded JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::InvalidJson`] if the value is not a supported record.
    pub fn from_value(value: serde_json::Value) -> FhirResult<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Render the record as pretty JSON for storage.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::InvalidJson`] if serialisation fails.
    pub fn to_json_pretty(&self) -> FhirResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn resource_type(&self) -> ResourceType {
        match self {
            StructuredRecord::Observation(_) => ResourceType::Observation,
            StructuredRecord::RiskAssessment(_) => ResourceType::RiskAssessment,
        }
    }

    pub fn id(&self) -> &ResourceId {
        match self {
            StructuredRecord::Observation(o) => &o.id,
            StructuredRecord::RiskAssessment(r) => &r.id,
        }
    }

    pub fn subject(&self) -> &Reference {
        match self {
            StructuredRecord::Observation(o) => &o.subject,
            StructuredRecord::RiskAssessment(r) => &r.subject,
        }
    }

    /// Timestamp at which the record was synthesised.
    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            StructuredRecord::Observation(o) => o.issued,
            StructuredRecord::RiskAssessment(r) => r.occurrence_date_time,
        }
    }

    /// Resolves the subject reference to a validated subject id.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::InvalidInput`] if the reference is not a `Patient/<id>` reference.
    pub fn subject_id(&self) -> FhirResult<SubjectId> {
        self.subject().subject_id()
    }

    /// Enforces the binding invariant: the record must reference `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::SubjectMismatch`] if the record references a different subject, or
    /// [`FhirError::InvalidInput`] if the reference does not resolve to a subject at all.
    pub fn ensure_subject(&self, expected: &SubjectId) -> FhirResult<()> {
        let found = self.subject_id()?;
        if &found != expected {
            return Err(FhirError::SubjectMismatch {
                expected: expected.to_string(),
                found: found.to_string(),
            });
        }
        Ok(())
    }

    /// Deterministic content hash of this record's canonical JSON form.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::InvalidJson`] if the record cannot be serialised.
    pub fn content_hash(&self) -> FhirResult<ContentHash> {
        content_hash(self)
    }

    /// Version-specific location, e.g. `Observation/<id>/_history/2`.
    pub fn location(&self, version: u64) -> String {
        format!("{}/{}/_history/{version}", self.resource_type(), self.id())
    }

    pub fn as_observation(&self) -> Option<&Observation> {
        match self {
            StructuredRecord::Observation(o) => Some(o),
            StructuredRecord::RiskAssessment(_) => None,
        }
    }

    pub fn as_risk_assessment(&self) -> Option<&RiskAssessment> {
        match self {
            StructuredRecord::RiskAssessment(r) => Some(r),
            StructuredRecord::Observation(_) => None,
        }
    }
}

impl From<Observation> for StructuredRecord {
    fn from(value: Observation) -> Self {
        StructuredRecord::Observation(value)
    }
}

impl From<RiskAssessment> for StructuredRecord {
    fn from(value: RiskAssessment) -> Self {
        StructuredRecord::RiskAssessment(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn subject() -> SubjectId {
        SubjectId::new("patient-abc").unwrap()
    }

    fn observation() -> StructuredRecord {
        let at = Utc.with_ymd_and_hms(2026, 1, 11, 14, 35, 22).unwrap();
        Observation::assessment_narrative(
            ResourceId::parse("obs-1").unwrap(),
            &subject(),
            "Chest pain radiating to the left arm.",
            at,
        )
        .into()
    }

    #[test]
    fn test_resource_id_generate_is_unique() {
        assert_ne!(ResourceId::generate(), ResourceId::generate());
        assert!(ResourceId::parse(ResourceId::generate().as_str()).is_ok());
    }

    #[test]
    fn test_resource_id_rejects_invalid() {
        assert!(ResourceId::parse("").is_err());
        assert!(ResourceId::parse("has/slash").is_err());
        assert!(ResourceId::parse(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_resource_type_parse() {
        assert_eq!(
            "RiskAssessment".parse::<ResourceType>().unwrap(),
            ResourceType::RiskAssessment
        );
        assert!("Patient".parse::<ResourceType>().is_err());
    }

    #[test]
    fn test_json_is_tagged_with_resource_type() {
        let value = serde_json::to_value(observation()).unwrap();
        assert_eq!(value["resourceType"], "Observation");
        assert_eq!(value["status"], "final");
        assert_eq!(value["subject"]["reference"], "Patient/patient-abc");
    }

    #[test]
    fn test_parse_json_reads_back_variant() {
        let record = observation();
        let text = record.to_json_pretty().unwrap();
        let parsed = StructuredRecord::parse_json(&text).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(parsed.resource_type(), ResourceType::Observation);
    }

    #[test]
    fn test_parse_json_reports_schema_mismatch() {
        let err = StructuredRecord::parse_json(r#"{"resourceType":"Patient","id":"x"}"#)
            .expect_err("unsupported type must fail");
        assert!(matches!(err, FhirError::Translation(msg) if msg.contains("schema mismatch")));
    }

    #[test]
    fn test_ensure_subject_detects_mismatch() {
        let record = observation();
        assert!(record.ensure_subject(&subject()).is_ok());

        let other = SubjectId::new("patient-xyz").unwrap();
        assert!(matches!(
            record.ensure_subject(&other),
            Err(FhirError::SubjectMismatch { .. })
        ));
    }

    #[test]
    fn test_location_is_version_specific() {
        assert_eq!(observation().location(3), "Observation/obs-1/_history/3");
    }
}
