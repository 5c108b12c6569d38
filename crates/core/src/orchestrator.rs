//! Assessment orchestration: the top-level use case.
//!
//! One call to [`AssessmentOrchestrator::assess`] processes one turn:
//!
//! 1. validate the turn (no external call is made for invalid input)
//! 2. advance the conversation through the [`ConversationDriver`]
//! 3. detect completion in the reply
//! 4. on `COMPLETE` or `ESCALATE`: synthesise records, persist each one, then log their hashes
//!    to the ledger
//!
//! Persistence failures fail the turn. Ledger failures do not: the persisted records are kept
//! and the receipt reports which submissions failed.

use crate::completion::{detect_completion, CompletionStatus};
use crate::config::{ConfigResult, CoreConfig};
use crate::constants::SUBJECT_METADATA_KEY;
use crate::context::CallContext;
use crate::conversation::{ConversationDriver, NewMessage, ReasoningEngine};
use crate::error::AssessResult;
use crate::ledger::{LedgerClient, LedgerReceipt};
use crate::records::{PutOutcome, RecordStore};
use crate::services;
use crate::synthesizer::RecordSynthesizer;
use crate::validation::{Turn, TurnRequest};
use fhir::{ResourceType, StructuredRecord};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use triage_types::{CorrelationId, SubjectId, ThreadId};

/// A record as persisted during a turn.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRecord {
    pub record: StructuredRecord,
    pub stored: PutOutcome,
}

/// Records produced by a completed turn.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedResources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation: Option<PersistedRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_assessment: Option<PersistedRecord>,
}

impl PersistedResources {
    fn insert(&mut self, persisted: PersistedRecord) {
        match persisted.record.resource_type() {
            ResourceType::Observation => self.observation = Some(persisted),
            ResourceType::RiskAssessment => self.risk_assessment = Some(persisted),
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &PersistedRecord> {
        self.observation.iter().chain(self.risk_assessment.iter())
    }
}

/// Result of one turn. Returned to the caller, never persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct OrchestrationResult {
    pub reply_text: String,
    pub thread_id: ThreadId,
    pub subject_id: SubjectId,
    pub completion_status: CompletionStatus,
    /// The caller's thread had an active run and the turn moved to a new thread.
    pub thread_forked: bool,
    pub correlation_id: CorrelationId,
    pub resources: Option<PersistedResources>,
    pub ledger_receipt: Option<LedgerReceipt>,
    /// Summary of ledger failures when the receipt is incomplete.
    pub ledger_error: Option<String>,
}

/// Names of the configured backends, for health reporting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSummary {
    pub engine: String,
    pub storage: &'static str,
    pub ledger: Option<&'static str>,
}

/// Coordinates the conversation driver, synthesiser, record store and ledger.
#[derive(Clone)]
pub struct AssessmentOrchestrator {
    engine: Arc<dyn ReasoningEngine>,
    driver: ConversationDriver,
    synthesizer: RecordSynthesizer,
    store: Arc<dyn RecordStore>,
    ledger: Option<LedgerClient>,
    max_message_len: usize,
}

impl AssessmentOrchestrator {
    /// Assemble an orchestrator from already-built collaborators.
    pub fn new(
        engine: Arc<dyn ReasoningEngine>,
        store: Arc<dyn RecordStore>,
        ledger: Option<LedgerClient>,
        cfg: &CoreConfig,
    ) -> Self {
        Self {
            driver: ConversationDriver::new(engine.clone(), cfg.driver_config()),
            engine,
            synthesizer: RecordSynthesizer::new(),
            store,
            ledger,
            max_message_len: cfg.max_message_len(),
        }
    }

    /// Build every backend named by `cfg`.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::ConfigError`] if a backend client cannot be created.
    pub fn from_config(cfg: &CoreConfig) -> ConfigResult<Self> {
        Ok(Self::new(
            services::build_engine(cfg)?,
            services::build_store(cfg)?,
            services::build_ledger(cfg)?,
            cfg,
        ))
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn ledger(&self) -> Option<&LedgerClient> {
        self.ledger.as_ref()
    }

    pub fn backends(&self) -> BackendSummary {
        BackendSummary {
            engine: self.engine.id().to_owned(),
            storage: self.store.backend(),
            ledger: self.ledger.as_ref().map(LedgerClient::backend),
        }
    }

    /// Process one turn.
    ///
    /// Cancelling `ctx` aborts the conversation wait. Once a reply has been obtained, record
    /// persistence and ledger submission run to completion regardless.
    ///
    /// # Errors
    ///
    /// - [`crate::AssessError::Validation`] for malformed input, before any external call
    /// - [`crate::AssessError::Engine`] if no reply could be obtained
    /// - [`crate::AssessError::Synthesis`] / [`crate::AssessError::Storage`] if a clinical
    ///   record could not be built or persisted
    pub async fn assess(
        &self,
        request: TurnRequest,
        ctx: &CallContext,
    ) -> AssessResult<OrchestrationResult> {
        let turn = request.validate(self.max_message_len)?;
        info!(
            correlation_id = %ctx.correlation_id,
            subject_id = %turn.subject_id,
            thread_id = turn.thread_id.as_ref().map(ThreadId::as_str).unwrap_or("<new>"),
            message_len = turn.user_text.as_str().len(),
            "assessment turn started"
        );

        let message = outbound_message(&turn);
        let reply = self
            .driver
            .advance(turn.thread_id.clone(), &turn.subject_id, message, ctx)
            .await?;

        let assistant = detect_completion(&reply.text);
        info!(
            correlation_id = %ctx.correlation_id,
            thread_id = %reply.thread_id,
            completion_status = %assistant.completion_status,
            forked = reply.forked,
            "assistant reply classified"
        );

        let mut result = OrchestrationResult {
            reply_text: assistant.text.clone(),
            thread_id: reply.thread_id,
            subject_id: turn.subject_id.clone(),
            completion_status: assistant.completion_status,
            thread_forked: reply.forked,
            correlation_id: ctx.correlation_id.clone(),
            resources: None,
            ledger_receipt: None,
            ledger_error: None,
        };

        if !assistant.completion_status.is_terminal() {
            return Ok(result);
        }

        // Clinical data is committed from here on; the caller going away must not abandon it.
        let commit_ctx = CallContext::new(ctx.correlation_id.clone());

        let records = self.synthesizer.synthesize(
            &turn.subject_id,
            &assistant.text,
            assistant.extracted_outcome.as_ref(),
        )?;

        let mut resources = PersistedResources::default();
        for record in &records {
            let stored = self.store.put(record, None, &commit_ctx).await?;
            resources.insert(PersistedRecord {
                record: record.clone(),
                stored,
            });
        }
        result.resources = Some(resources);

        if let Some(ledger) = &self.ledger {
            let receipt = ledger
                .log_records(&records, &turn.subject_id, &commit_ctx)
                .await;
            if !receipt.is_complete() {
                warn!(
                    correlation_id = %ctx.correlation_id,
                    failed = receipt.failed,
                    submitted = receipt.submitted,
                    "records persisted but ledger logging incomplete"
                );
                result.ledger_error = Some(format!(
                    "{} of {} ledger submissions failed",
                    receipt.failed, receipt.submitted
                ));
            }
            result.ledger_receipt = Some(receipt);
        }

        Ok(result)
    }
}

fn outbound_message(turn: &Turn) -> NewMessage {
    let mut metadata = turn.user_context.clone();
    metadata.insert(SUBJECT_METADATA_KEY.to_owned(), turn.subject_id.to_string());
    NewMessage {
        content: turn.user_text.as_str().to_owned(),
        metadata,
    }
}
