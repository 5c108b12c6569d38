//! FHIR-aligned RiskAssessment derived from an assessment outcome.
//!
//! The qualitative risk uses the HL7 `risk-probability` code system. Triage vocabulary that
//! does not appear in that system is mapped onto it when parsed (see [`RiskLevel::parse`]).

use crate::data_types::{CodeableConcept, Meta, RecordStatus, Reference};
use crate::observation::source_meta;
use crate::record::ResourceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use triage_types::SubjectId;

/// Code system for qualitative risk.
pub const RISK_PROBABILITY_SYSTEM: &str = "http://terminology.hl7.org/CodeSystem/risk-probability";

/// Qualitative risk level, one-to-one with the HL7 `risk-probability` codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Negligible,
    Low,
    Moderate,
    High,
    Certain,
}

impl RiskLevel {
    /// Parses a risk level word, accepting common triage synonyms.
    ///
    /// `critical` and `emergency` map to [`RiskLevel::Certain`]; `medium` maps to
    /// [`RiskLevel::Moderate`]; `severe` and `urgent` map to [`RiskLevel::High`].
    pub fn parse(word: &str) -> Option<Self> {
        match word.trim().to_ascii_lowercase().as_str() {
            "negligible" | "minimal" | "none" => Some(RiskLevel::Negligible),
            "low" => Some(RiskLevel::Low),
            "moderate" | "medium" => Some(RiskLevel::Moderate),
            "high" | "severe" | "urgent" => Some(RiskLevel::High),
            "certain" | "critical" | "emergency" => Some(RiskLevel::Certain),
            _ => None,
        }
    }

    /// Maps a probability in `[0, 1]` onto a qualitative level.
    pub fn from_probability(p: f64) -> Option<Self> {
        if !(0.0..=1.0).contains(&p) {
            return None;
        }
        Some(if p >= 0.7 {
            RiskLevel::High
        } else if p >= 0.3 {
            RiskLevel::Moderate
        } else {
            RiskLevel::Low
        })
    }

    pub fn code(&self) -> &'static str {
        match self {
            RiskLevel::Negligible => "negligible",
            RiskLevel::Low => "low",
            RiskLevel::Moderate => "moderate",
            RiskLevel::High => "high",
            RiskLevel::Certain => "certain",
        }
    }

    pub fn display(&self) -> &'static str {
        match self {
            RiskLevel::Negligible => "Negligible likelihood",
            RiskLevel::Low => "Low likelihood",
            RiskLevel::Moderate => "Moderate likelihood",
            RiskLevel::High => "High likelihood",
            RiskLevel::Certain => "Certain",
        }
    }

    /// True for levels that warrant urgent attention.
    pub fn is_high_risk(&self) -> bool {
        matches!(self, RiskLevel::High | RiskLevel::Certain)
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskPrediction {
    pub outcome: CodeableConcept,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probability_decimal: Option<f64>,
    pub qualitative_risk: CodeableConcept,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub id: ResourceId,
    #[serde(default)]
    pub meta: Meta,
    pub status: RecordStatus,
    pub subject: Reference,
    pub occurrence_date_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub basis: Vec<Reference>,
    pub prediction: Vec<RiskPrediction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mitigation: Option<String>,
}

impl RiskAssessment {
    /// Builds a `final` risk assessment with a single prediction.
    ///
    /// `probability` is dropped if it falls outside `[0, 1]`.
    pub fn from_outcome(
        id: ResourceId,
        subject: &SubjectId,
        level: RiskLevel,
        probability: Option<f64>,
        outcome_text: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            meta: source_meta(),
            status: RecordStatus::Final,
            subject: Reference::patient(subject),
            occurrence_date_time: at,
            basis: Vec::new(),
            prediction: vec![RiskPrediction {
                outcome: CodeableConcept::text(outcome_text),
                probability_decimal: probability.filter(|p| (0.0..=1.0).contains(p)),
                qualitative_risk: CodeableConcept::coded(
                    RISK_PROBABILITY_SYSTEM,
                    level.code(),
                    Some(level.display()),
                ),
            }],
            mitigation: None,
        }
    }

    /// Records the observation this assessment was derived from.
    pub fn with_basis(mut self, basis: Reference) -> Self {
        self.basis.push(basis);
        self
    }

    pub fn with_mitigation(mut self, mitigation: impl Into<String>) -> Self {
        self.mitigation = Some(mitigation.into());
        self
    }

    /// Qualitative level of the first prediction, if it carries a known code.
    pub fn risk_level(&self) -> Option<RiskLevel> {
        self.prediction
            .first()?
            .qualitative_risk
            .coding
            .iter()
            .filter(|c| c.system == RISK_PROBABILITY_SYSTEM)
            .find_map(|c| RiskLevel::parse(&c.code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_synonyms() {
        assert_eq!(RiskLevel::parse("HIGH"), Some(RiskLevel::High));
        assert_eq!(RiskLevel::parse(" medium "), Some(RiskLevel::Moderate));
        assert_eq!(RiskLevel::parse("emergency"), Some(RiskLevel::Certain));
        assert_eq!(RiskLevel::parse("unclear"), None);
    }

    #[test]
    fn test_from_probability_thresholds() {
        assert_eq!(RiskLevel::from_probability(0.85), Some(RiskLevel::High));
        assert_eq!(RiskLevel::from_probability(0.7), Some(RiskLevel::High));
        assert_eq!(RiskLevel::from_probability(0.3), Some(RiskLevel::Moderate));
        assert_eq!(RiskLevel::from_probability(0.1), Some(RiskLevel::Low));
        assert_eq!(RiskLevel::from_probability(1.5), None);
    }

    #[test]
    fn test_from_outcome_codes_qualitative_risk() {
        let subject = SubjectId::new("patient-abc").unwrap();
        let risk = RiskAssessment::from_outcome(
            ResourceId::parse("risk-1").unwrap(),
            &subject,
            RiskLevel::High,
            Some(2.0),
            "Possible acute coronary syndrome",
            Utc::now(),
        )
        .with_basis(Reference::to_resource("Observation", "obs-1"))
        .with_mitigation("Call emergency services");

        assert_eq!(risk.risk_level(), Some(RiskLevel::High));
        assert_eq!(risk.prediction[0].probability_decimal, None);

        let value = serde_json::to_value(&risk).unwrap();
        assert_eq!(
            value["prediction"][0]["qualitativeRisk"]["coding"][0]["code"],
            "high"
        );
        assert_eq!(value["basis"][0]["reference"], "Observation/obs-1");
        assert_eq!(value["mitigation"], "Call emergency services");
    }
}
