//! Small FHIR datatypes shared by the record resources.

use crate::{FhirError, FhirResult};
use serde::{Deserialize, Serialize};
use triage_types::SubjectId;

/// Prefix of a FHIR reference to a patient resource.
const PATIENT_REFERENCE_PREFIX: &str = "Patient/";

/// Record status. Records are created `final` and never transition afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordStatus {
    Final,
    Amended,
    EnteredInError,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coding {
    pub system: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CodeableConcept {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coding: Vec<Coding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl CodeableConcept {
    /// A concept carrying only free text.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            coding: Vec::new(),
            text: Some(text.into()),
        }
    }

    /// A concept carrying a single coding.
    pub fn coded(system: &str, code: &str, display: Option<&str>) -> Self {
        Self {
            coding: vec![Coding {
                system: system.to_owned(),
                code: code.to_owned(),
                display: display.map(str::to_owned),
            }],
            text: None,
        }
    }
}

/// A literal FHIR reference (`<ResourceType>/<id>`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl Reference {
    /// Reference to the subject of an assessment.
    pub fn patient(subject: &SubjectId) -> Self {
        Self {
            reference: format!("{PATIENT_REFERENCE_PREFIX}{subject}"),
            display: None,
        }
    }

    /// Reference to another resource by type and id.
    pub fn to_resource(resource_type: &str, id: &str) -> Self {
        Self {
            reference: format!("{resource_type}/{id}"),
            display: None,
        }
    }

    /// Resolves a `Patient/<id>` reference back to a validated subject id.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::InvalidInput`] if the reference does not point at a patient or the
    /// id part is not a valid subject identifier.
    pub fn subject_id(&self) -> FhirResult<SubjectId> {
        let raw = self
            .reference
            .strip_prefix(PATIENT_REFERENCE_PREFIX)
            .ok_or_else(|| {
                FhirError::InvalidInput(format!(
                    "subject reference must start with {PATIENT_REFERENCE_PREFIX}: {}",
                    self.reference
                ))
            })?;
        SubjectId::new(raw)
            .map_err(|e| FhirError::InvalidInput(format!("invalid subject reference: {e}")))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub text: String,
}

/// Resource metadata. Only the fields the orchestrator sets are modelled; server-managed
/// fields such as `versionId` and `lastUpdated` are dropped on parse.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Meta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag: Vec<Coding>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patient_reference_round_trips_subject() {
        let subject = SubjectId::new("patient-abc").unwrap();
        let reference = Reference::patient(&subject);
        assert_eq!(reference.reference, "Patient/patient-abc");
        assert_eq!(reference.subject_id().unwrap(), subject);
    }

    #[test]
    fn test_non_patient_reference_is_rejected() {
        let reference = Reference::to_resource("Observation", "123");
        assert!(matches!(
            reference.subject_id(),
            Err(FhirError::InvalidInput(msg)) if msg.contains("Patient/")
        ));
    }

    #[test]
    fn test_record_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&RecordStatus::EnteredInError).unwrap(),
            "\"entered-in-error\""
        );
        assert_eq!(serde_json::to_string(&RecordStatus::Final).unwrap(), "\"final\"");
    }
}
