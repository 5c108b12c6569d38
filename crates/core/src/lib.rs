//! # Triage Core
//!
//! Core business logic for the symptom assessment pipeline.
//!
//! This crate drives a multi-turn conversation with an external reasoning engine, decides when
//! an assessment is complete, turns the outcome into structured clinical records, persists them
//! and logs their content hashes to an append-only audit ledger:
//! - [`conversation`]: reasoning engine trait, backends and the turn driver
//! - [`completion`]: completion markers in assistant replies
//! - [`synthesizer`]: Observation and RiskAssessment synthesis
//! - [`records`]: record store trait with local and managed FHIR backends
//! - [`ledger`]: ledger trait, backends and the batch client
//! - [`orchestrator`]: the `assess` use case tying the above together
//!
//! **No API concerns**: HTTP servers and DTOs belong in `api-rest` and `api-shared`.

pub mod completion;
pub mod config;
pub mod constants;
pub mod context;
pub mod conversation;
pub mod error;
pub mod ledger;
pub mod orchestrator;
pub mod records;
pub mod retry;
pub mod services;
pub mod synthesizer;
pub mod validation;

pub use completion::{detect_completion, AssistantReply, CompletionStatus, ExtractedOutcome};
pub use config::{ConfigError, ConfigResult, CoreConfig, EngineMode, LedgerMode, StorageMode};
pub use context::CallContext;
pub use error::{AssessError, AssessResult, ErrorCode};
pub use ledger::{AuditEntry, AuditEventKind, LedgerClient, LedgerReceipt};
pub use orchestrator::{
    AssessmentOrchestrator, BackendSummary, OrchestrationResult, PersistedRecord,
    PersistedResources,
};
pub use records::{IdempotencyKey, PutOutcome, RecordListing, RecordStore, StoreError};
pub use synthesizer::{RecordSynthesizer, SynthesisError};
pub use validation::{Turn, TurnRequest, ValidationError};
