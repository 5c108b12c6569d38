//! FHIR-aligned Observation capturing the narrative outcome of a symptom assessment.

use crate::data_types::{Annotation, CodeableConcept, Coding, Meta, RecordStatus, Reference};
use crate::record::ResourceId;
use crate::RECORD_SOURCE;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use triage_types::SubjectId;

const OBSERVATION_CATEGORY_SYSTEM: &str =
    "http://terminology.hl7.org/CodeSystem/observation-category";

/// Tag system marking how a record was produced.
pub const SOURCE_TAG_SYSTEM: &str = "urn:triage:source";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub id: ResourceId,
    #[serde(default)]
    pub meta: Meta,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub category: Vec<CodeableConcept>,
    pub code: CodeableConcept,
    pub subject: Reference,
    pub effective_date_time: DateTime<Utc>,
    pub issued: DateTime<Utc>,
    pub value_string: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub note: Vec<Annotation>,
}

impl Observation {
    /// Builds a `final` survey observation holding the assessment narrative.
    pub fn assessment_narrative(
        id: ResourceId,
        subject: &SubjectId,
        narrative: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            meta: source_meta(),
            status: RecordStatus::Final,
            category: vec![CodeableConcept::coded(
                OBSERVATION_CATEGORY_SYSTEM,
                "survey",
                Some("Survey"),
            )],
            code: CodeableConcept::text("Symptom assessment"),
            subject: Reference::patient(subject),
            effective_date_time: at,
            issued: at,
            value_string: narrative.into(),
            note: Vec::new(),
        }
    }

    /// Adds a free-text note.
    pub fn with_note(mut self, text: impl Into<String>) -> Self {
        self.note.push(Annotation { text: text.into() });
        self
    }
}

/// Metadata stamped on every synthesised record.
pub(crate) fn source_meta() -> Meta {
    Meta {
        source: Some(RECORD_SOURCE.to_owned()),
        tag: vec![Coding {
            system: SOURCE_TAG_SYSTEM.to_owned(),
            code: "ai-assisted-triage".to_owned(),
            display: Some("AI-assisted symptom triage".to_owned()),
        }],
    }
}
