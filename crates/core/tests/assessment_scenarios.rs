//! End-to-end turns through the orchestrator with the scripted engine, the local record store
//! and the in-memory ledger.

use async_trait::async_trait;
use chrono::Utc;
use fhir::{ContentHash, Observation, ResourceId, ResourceType, StructuredRecord};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use triage_core::conversation::ScriptedEngine;
use triage_core::ledger::{
    InMemoryLedger, Ledger, LedgerError, LedgerResult, OnChainRecord, TxReceipt,
};
use triage_core::records::LocalRecordStore;
use triage_core::{
    AssessError, AssessmentOrchestrator, AuditEventKind, CallContext, CompletionStatus,
    CoreConfig, IdempotencyKey, LedgerClient, RecordStore, TurnRequest,
};
use triage_types::{SubjectId, ThreadId};

const CHEST_PAIN: &str = "I'm a 45 year old male with sharp chest pain radiating to my arm";

const FOLLOW_UP_REPLY: &str =
    "I'm sorry you're going through this. How long have you had the pain, \
     and are you short of breath?";

const COMPLETE_REPLY: &str = "Chest pain spreading to the arm can be a sign of a heart attack. \
Please call emergency services now.\n\n\
```assessment\n\
{\"status\": \"COMPLETE\", \"risk_level\": \"high\", \"probability\": 0.85, \
\"summary\": \"Acute chest pain radiating to the left arm in a 45 year old male\", \
\"recommendation\": \"Call emergency services immediately\", \
\"conditions\": [\"acute coronary syndrome\"]}\n\
```\n\
[[STATUS: COMPLETE]]";

fn config(dir: &TempDir) -> CoreConfig {
    CoreConfig::offline(dir.path())
        .with_poll_interval(Duration::from_millis(5))
        .with_max_run_wait(Duration::from_secs(5))
        .with_retry_max_attempts(1)
}

fn build(
    dir: &TempDir,
    engine: ScriptedEngine,
    ledger: Arc<dyn Ledger>,
) -> (AssessmentOrchestrator, Arc<ScriptedEngine>) {
    let cfg = config(dir);
    let engine = Arc::new(engine);
    let orchestrator = AssessmentOrchestrator::new(
        engine.clone(),
        Arc::new(LocalRecordStore::new(dir.path())),
        Some(LedgerClient::new(ledger, cfg.call_policy())),
        &cfg,
    );
    (orchestrator, engine)
}

fn turn(message: &str, thread_id: Option<&ThreadId>) -> TurnRequest {
    TurnRequest {
        message: message.into(),
        thread_id: thread_id.map(ToString::to_string),
        subject_id: "patient-abc".into(),
        user_context: None,
    }
}

fn subject() -> SubjectId {
    SubjectId::new("patient-abc").unwrap()
}

fn observation(narrative: &str) -> StructuredRecord {
    StructuredRecord::Observation(Observation::assessment_narrative(
        ResourceId::generate(),
        &subject(),
        narrative,
        Utc::now(),
    ))
}

/// Rejects every second `create_record`, whichever record it carries.
struct AlternatingLedger {
    inner: InMemoryLedger,
    creates: AtomicU32,
}

#[async_trait]
impl Ledger for AlternatingLedger {
    fn backend(&self) -> &'static str {
        "alternating"
    }

    async fn create_record(
        &self,
        resource_id: &str,
        data_hash: &ContentHash,
        owner: &str,
        ctx: &CallContext,
    ) -> LedgerResult<TxReceipt> {
        if self.creates.fetch_add(1, Ordering::SeqCst) % 2 == 1 {
            return Err(LedgerError::Rejected {
                code: 3,
                message: "execution reverted".into(),
            });
        }
        self.inner.create_record(resource_id, data_hash, owner, ctx).await
    }

    async fn update_record(
        &self,
        resource_id: &str,
        data_hash: &ContentHash,
        owner: &str,
        ctx: &CallContext,
    ) -> LedgerResult<TxReceipt> {
        self.inner.update_record(resource_id, data_hash, owner, ctx).await
    }

    async fn get_record(
        &self,
        resource_id: &str,
        owner: &str,
        ctx: &CallContext,
    ) -> LedgerResult<Option<OnChainRecord>> {
        self.inner.get_record(resource_id, owner, ctx).await
    }

    async fn record_exists(
        &self,
        resource_id: &str,
        owner: &str,
        ctx: &CallContext,
    ) -> LedgerResult<bool> {
        self.inner.record_exists(resource_id, owner, ctx).await
    }

    async fn query_events(
        &self,
        kind: AuditEventKind,
        resource_id: &str,
        owner: &str,
        ctx: &CallContext,
    ) -> LedgerResult<Vec<serde_json::Value>> {
        self.inner.query_events(kind, resource_id, owner, ctx).await
    }
}

#[tokio::test]
async fn test_chest_pain_assessment_reaches_complete_with_high_risk() {
    let dir = TempDir::new().unwrap();
    let (orchestrator, engine) = build(
        &dir,
        ScriptedEngine::new().with_replies([FOLLOW_UP_REPLY, COMPLETE_REPLY]),
        Arc::new(InMemoryLedger::new()),
    );
    let ctx = CallContext::detached();

    let first = orchestrator.assess(turn(CHEST_PAIN, None), &ctx).await.unwrap();
    assert!(!first.thread_id.as_str().is_empty());
    assert_eq!(first.completion_status, CompletionStatus::InProgress);
    assert!(first.resources.is_none());
    assert!(first.ledger_receipt.is_none());

    let second = orchestrator
        .assess(
            turn("About 20 minutes, and yes I'm breathless", Some(&first.thread_id)),
            &ctx,
        )
        .await
        .unwrap();
    assert_eq!(second.thread_id, first.thread_id);
    assert!(!second.thread_forked);
    assert_eq!(second.completion_status, CompletionStatus::Complete);
    assert!(!second.reply_text.contains("[[STATUS"));
    assert!(!second.reply_text.contains("```assessment"));
    assert!(second.reply_text.contains("emergency services"));
    assert_eq!(engine.threads_created(), 1);
    assert_eq!(engine.user_messages(&first.thread_id).len(), 2);

    let resources = second.resources.expect("completed turn persists resources");
    let observation = resources.observation.expect("observation persisted");
    let risk = resources.risk_assessment.expect("risk assessment persisted");
    let assessment = risk.record.as_risk_assessment().unwrap();
    assert!(assessment.risk_level().unwrap().is_high_risk());
    assert_eq!(
        assessment.basis[0].reference,
        format!("Observation/{}", observation.record.id())
    );
    assert!(observation.stored.created);
    assert_eq!(risk.stored.version_id, 1);

    let receipt = second.ledger_receipt.expect("ledger receipt present");
    assert_eq!(receipt.submitted, 2);
    assert_eq!(receipt.succeeded, 2);
    assert!(second.ledger_error.is_none());

    let listing = orchestrator
        .store()
        .list_by_subject(&subject(), &ctx)
        .await
        .unwrap();
    assert_eq!(listing.count(), 2);
    assert_eq!(listing.count(), listing.resources().len());
    assert_eq!(listing.resource_types(), ["Observation", "RiskAssessment"]);
    assert_eq!(listing.patient_ids(), ["patient-abc"]);
}

#[tokio::test]
async fn test_busy_thread_forks_and_still_completes() {
    let dir = TempDir::new().unwrap();
    let (orchestrator, engine) = build(
        &dir,
        ScriptedEngine::new().with_replies([FOLLOW_UP_REPLY, COMPLETE_REPLY]),
        Arc::new(InMemoryLedger::new()),
    );
    let ctx = CallContext::detached();

    let opening = orchestrator.assess(turn(CHEST_PAIN, None), &ctx).await.unwrap();
    engine.queue_active_run_conflicts(1);

    let next = orchestrator
        .assess(turn("It still hurts", Some(&opening.thread_id)), &ctx)
        .await
        .unwrap();
    assert!(next.thread_forked);
    assert_ne!(next.thread_id, opening.thread_id);
    assert_eq!(next.completion_status, CompletionStatus::Complete);
    assert_eq!(engine.threads_created(), 2);
    assert_eq!(engine.user_messages(&next.thread_id), ["It still hurts"]);
}

#[tokio::test]
async fn test_partial_ledger_failure_keeps_both_records() {
    let dir = TempDir::new().unwrap();
    let ledger = Arc::new(AlternatingLedger {
        inner: InMemoryLedger::new(),
        creates: AtomicU32::new(0),
    });
    let (orchestrator, _) = build(
        &dir,
        ScriptedEngine::new().with_replies([COMPLETE_REPLY]),
        ledger,
    );
    let ctx = CallContext::detached();

    let result = orchestrator.assess(turn(CHEST_PAIN, None), &ctx).await.unwrap();

    assert_eq!(result.completion_status, CompletionStatus::Complete);
    let resources = result.resources.expect("records persisted despite ledger failure");
    assert_eq!(resources.records().count(), 2);

    let receipt = result.ledger_receipt.unwrap();
    assert_eq!(receipt.submitted, 2);
    assert_eq!(receipt.succeeded, 1);
    assert_eq!(receipt.failed, 1);
    let failed = receipt.items.iter().find(|i| !i.success).unwrap();
    assert!(failed.error.as_deref().unwrap().contains("execution reverted"));
    assert!(result.ledger_error.is_some());

    let listing = orchestrator
        .store()
        .list_by_subject(&subject(), &ctx)
        .await
        .unwrap();
    assert_eq!(listing.count(), 2);
}

#[tokio::test]
async fn test_blank_message_rejected_before_any_engine_call() {
    let dir = TempDir::new().unwrap();
    let (orchestrator, engine) = build(
        &dir,
        ScriptedEngine::new(),
        Arc::new(InMemoryLedger::new()),
    );

    let err = orchestrator
        .assess(turn("   ", None), &CallContext::detached())
        .await
        .unwrap_err();

    assert!(matches!(err, AssessError::Validation(_)));
    assert_eq!(engine.threads_created(), 0);
    assert_eq!(engine.runs_started(), 0);
}

#[tokio::test]
async fn test_repeated_put_with_same_key_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = LocalRecordStore::new(dir.path());
    let ctx = CallContext::detached();
    let record = observation("Mild headache for two days");
    let key = IdempotencyKey::for_record(&record).unwrap();

    let first = store.put(&record, Some(&key), &ctx).await.unwrap();
    let second = store.put(&record, Some(&key), &ctx).await.unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.id, second.id);
    assert_eq!(first.version_id, second.version_id);

    let listing = store.list_by_subject(&subject(), &ctx).await.unwrap();
    assert_eq!(listing.count(), 1);
    let history = store
        .history(&subject(), ResourceType::Observation, record.id(), &ctx)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_unknown_subject_lists_nothing() {
    let dir = TempDir::new().unwrap();
    let store = LocalRecordStore::new(dir.path());
    let unknown = SubjectId::new("unknown-patient").unwrap();

    let listing = store
        .list_by_subject(&unknown, &CallContext::detached())
        .await
        .unwrap();

    assert_eq!(listing.count(), 0);
    assert!(listing.resources().is_empty());
    assert!(listing.resource_types().is_empty());
    assert!(listing.patient_ids().is_empty());
}

#[tokio::test]
async fn test_audit_trail_shows_creation_then_update() {
    let dir = TempDir::new().unwrap();
    let store = LocalRecordStore::new(dir.path());
    let client = LedgerClient::new(Arc::new(InMemoryLedger::new()), config(&dir).call_policy());
    let ctx = CallContext::detached();

    let original = observation("Sore throat, no fever");
    store.put(&original, None, &ctx).await.unwrap();
    let first = client
        .log_records(std::slice::from_ref(&original), &subject(), &ctx)
        .await;
    assert!(first.is_complete());

    let StructuredRecord::Observation(mut amended) = original.clone() else {
        unreachable!()
    };
    amended.value_string = "Sore throat, fever of 38.5C since this morning".into();
    let amended = StructuredRecord::Observation(amended);
    let stored = store.put(&amended, None, &ctx).await.unwrap();
    assert_eq!(stored.version_id, 2);
    let second = client
        .log_records(std::slice::from_ref(&amended), &subject(), &ctx)
        .await;
    assert!(second.is_complete());

    let trail = client
        .get_audit_trail(original.id().as_str(), &subject(), &ctx)
        .await
        .unwrap();
    let kinds: Vec<_> = trail.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, [AuditEventKind::Created, AuditEventKind::Updated]);
    assert!(trail[0].block_number < trail[1].block_number);

    let current = amended.content_hash().unwrap();
    assert!(client
        .verify_integrity(original.id().as_str(), &subject(), current.as_str(), &ctx)
        .await
        .unwrap());
    let stale = original.content_hash().unwrap();
    assert!(!client
        .verify_integrity(original.id().as_str(), &subject(), stale.as_str(), &ctx)
        .await
        .unwrap());
}
