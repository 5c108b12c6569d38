//! Structured record synthesis.
//!
//! Turns a completed assessment reply into FHIR-aligned records:
//! - exactly one [`Observation`] carrying the narrative
//! - one [`RiskAssessment`] when a risk level can be determined, with `basis` pointing back at
//!   the observation
//!
//! No risk level means no `RiskAssessment`; the synthesiser never fabricates one. Every record is
//! checked against the subject before it is returned.

use crate::completion::{risk_level_from_text, ExtractedOutcome};
use chrono::{DateTime, SubsecRound, Utc};
use fhir::{FhirError, Observation, Reference, ResourceId, RiskAssessment, StructuredRecord};
use triage_types::SubjectId;

const DEFAULT_OUTCOME_TEXT: &str = "Symptom assessment outcome";

/// Errors returned while synthesising records.
#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error(transparent)]
    Record(#[from] FhirError),
}

pub type SynthesisResult<T> = Result<T, SynthesisError>;

/// Stateless record synthesiser.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecordSynthesizer;

impl RecordSynthesizer {
    pub fn new() -> Self {
        Self
    }

    /// Synthesise records for `subject` stamped with the current time.
    ///
    /// # Arguments
    ///
    /// * `subject` - Subject every record is bound to.
    /// * `reply_text` - Assistant reply with completion markers already stripped.
    /// * `outcome` - Structured outcome extracted from the reply, if any.
    ///
    /// # Returns
    ///
    /// The Observation first, followed by the RiskAssessment when one was produced.
    ///
    /// # Errors
    ///
    /// Returns [`SynthesisError::Record`] if a record fails the subject check.
    pub fn synthesize(
        &self,
        subject: &SubjectId,
        reply_text: &str,
        outcome: Option<&ExtractedOutcome>,
    ) -> SynthesisResult<Vec<StructuredRecord>> {
        self.synthesize_at(subject, reply_text, outcome, Utc::now())
    }

    /// As [`RecordSynthesizer::synthesize`] with an explicit timestamp.
    ///
    /// Output is fully determined by the inputs apart from the generated resource ids.
    pub fn synthesize_at(
        &self,
        subject: &SubjectId,
        reply_text: &str,
        outcome: Option<&ExtractedOutcome>,
        at: DateTime<Utc>,
    ) -> SynthesisResult<Vec<StructuredRecord>> {
        // Millisecond precision keeps timestamps stable through FHIR servers that truncate.
        let at = at.trunc_subsecs(3);

        let summary = outcome
            .and_then(|o| o.summary.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let level = outcome
            .and_then(ExtractedOutcome::risk_level)
            .or_else(|| risk_level_from_text(reply_text));

        // A reply made only of markers still yields exactly one Observation.
        let narrative = match (summary, reply_text.trim()) {
            (Some(summary), _) => summary.to_owned(),
            (None, text) if !text.is_empty() => text.to_owned(),
            (None, _) => match level {
                Some(level) => format!("{DEFAULT_OUTCOME_TEXT}: {} risk", level.code()),
                None => DEFAULT_OUTCOME_TEXT.to_owned(),
            },
        };

        let mut observation =
            Observation::assessment_narrative(ResourceId::generate(), subject, narrative, at);
        if let Some(conditions) = outcome
            .map(|o| o.conditions.as_slice())
            .filter(|c| !c.is_empty())
        {
            observation = observation.with_note(format!(
                "Conditions considered: {}",
                conditions.join(", ")
            ));
        }
        let basis = Reference::to_resource("Observation", observation.id.as_str());

        let mut records = vec![StructuredRecord::from(observation)];

        if let Some(level) = level {
            let mut risk = RiskAssessment::from_outcome(
                ResourceId::generate(),
                subject,
                level,
                outcome.and_then(|o| o.probability),
                summary.unwrap_or(DEFAULT_OUTCOME_TEXT),
                at,
            )
            .with_basis(basis);
            if let Some(recommendation) = outcome
                .and_then(|o| o.recommendation.as_deref())
                .map(str::trim)
                .filter(|r| !r.is_empty())
            {
                risk = risk.with_mitigation(recommendation);
            }
            records.push(StructuredRecord::from(risk));
        } else {
            tracing::debug!(
                subject_id = %subject,
                "no risk level determinable; omitting RiskAssessment"
            );
        }

        for record in &records {
            record.ensure_subject(subject)?;
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhir::{RecordStatus, ResourceType, RiskLevel};

    fn subject() -> SubjectId {
        SubjectId::new("patient-abc").unwrap()
    }

    fn outcome(risk: Option<&str>) -> ExtractedOutcome {
        ExtractedOutcome {
            status: Some("COMPLETE".into()),
            risk_level: risk.map(Into::into),
            probability: Some(0.82),
            summary: Some("Chest pain radiating to the left arm".into()),
            recommendation: Some("Call emergency services".into()),
            conditions: vec!["acute coronary syndrome".into(), "angina".into()],
        }
    }

    #[test]
    fn test_produces_observation_and_risk_assessment() {
        let out = outcome(Some("high"));
        let records = RecordSynthesizer::new()
            .synthesize(&subject(), "reply text", Some(&out))
            .unwrap();

        assert_eq!(records.len(), 2);
        let obs = records[0].as_observation().unwrap();
        assert_eq!(obs.value_string, "Chest pain radiating to the left arm");
        assert_eq!(obs.status, RecordStatus::Final);
        assert_eq!(
            obs.note[0].text,
            "Conditions considered: acute coronary syndrome, angina"
        );

        let risk = records[1].as_risk_assessment().unwrap();
        assert_eq!(risk.risk_level(), Some(RiskLevel::High));
        assert_eq!(risk.prediction[0].probability_decimal, Some(0.82));
        assert_eq!(risk.mitigation.as_deref(), Some("Call emergency services"));
        assert_eq!(
            risk.basis[0].reference,
            format!("Observation/{}", obs.id)
        );
    }

    #[test]
    fn test_omits_risk_assessment_without_level() {
        let records = RecordSynthesizer::new()
            .synthesize(&subject(), "Please rest and drink fluids.", None)
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].resource_type(), ResourceType::Observation);
        assert_eq!(
            records[0].as_observation().unwrap().value_string,
            "Please rest and drink fluids."
        );
    }

    #[test]
    fn test_risk_level_from_reply_text() {
        let records = RecordSynthesizer::new()
            .synthesize(&subject(), "Risk level: moderate. See your GP.", None)
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[1].as_risk_assessment().unwrap().risk_level(),
            Some(RiskLevel::Moderate)
        );
    }

    #[test]
    fn test_every_record_is_bound_to_subject() {
        let s = subject();
        let out = outcome(Some("low"));
        let records = RecordSynthesizer::new()
            .synthesize(&s, "text", Some(&out))
            .unwrap();
        for record in records {
            assert_eq!(record.subject_id().unwrap(), s);
        }
    }

    #[test]
    fn test_ids_are_fresh_per_call() {
        let at = Utc::now();
        let out = outcome(Some("high"));
        let synth = RecordSynthesizer::new();
        let first = synth.synthesize_at(&subject(), "t", Some(&out), at).unwrap();
        let second = synth.synthesize_at(&subject(), "t", Some(&out), at).unwrap();
        assert_ne!(first[0].id(), second[0].id());
        assert_ne!(first[1].id(), second[1].id());
        assert_eq!(
            first[0].as_observation().unwrap().value_string,
            second[0].as_observation().unwrap().value_string
        );
    }

    #[test]
    fn test_marker_only_reply_falls_back_to_default_narrative() {
        let out = ExtractedOutcome {
            status: Some("COMPLETE".into()),
            risk_level: Some("high".into()),
            ..ExtractedOutcome::default()
        };
        let records = RecordSynthesizer::new()
            .synthesize(&subject(), "   ", Some(&out))
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].as_observation().unwrap().value_string,
            "Symptom assessment outcome: high risk"
        );
        assert_eq!(
            records[1].as_risk_assessment().unwrap().risk_level(),
            Some(RiskLevel::High)
        );
    }

    #[test]
    fn test_blank_reply_without_outcome_still_yields_observation() {
        let records = RecordSynthesizer::new()
            .synthesize(&subject(), "", None)
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].as_observation().unwrap().value_string,
            "Symptom assessment outcome"
        );
    }
}
