//! Ledger client: batch hash logging, audit trails and integrity checks.

use super::{AuditEntry, AuditEventKind, Ledger, LedgerError, LedgerResult, TxReceipt};
use crate::context::CallContext;
use crate::retry::{call_with_retry, CallClass, CallPolicy};
use fhir::{ContentHash, ResourceType, StructuredRecord};
use futures::future::{join_all, try_join_all};
use serde::Serialize;
use std::sync::Arc;
use triage_types::SubjectId;

/// Which contract call was used for an item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerOperation {
    Create,
    Update,
}

/// Per-record outcome of a ledger submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerItem {
    pub resource_id: String,
    pub resource_type: ResourceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_hash: Option<ContentHash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<LedgerOperation>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LedgerItem {
    fn pending(record: &StructuredRecord) -> Self {
        Self {
            resource_id: record.id().to_string(),
            resource_type: record.resource_type(),
            data_hash: None,
            operation: None,
            success: false,
            transaction_hash: None,
            block_number: None,
            error: None,
        }
    }

    fn succeeded(mut self, receipt: TxReceipt) -> Self {
        self.success = true;
        self.transaction_hash = Some(receipt.transaction_hash);
        self.block_number = Some(receipt.block_number);
        self
    }

    fn failed(mut self, err: impl std::fmt::Display) -> Self {
        self.success = false;
        self.error = Some(err.to_string());
        self
    }
}

/// Aggregate outcome of one batch. Counts always agree with `items`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerReceipt {
    pub items: Vec<LedgerItem>,
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl LedgerReceipt {
    pub fn from_items(items: Vec<LedgerItem>) -> Self {
        let succeeded = items.iter().filter(|i| i.success).count();
        Self {
            submitted: items.len(),
            failed: items.len() - succeeded,
            succeeded,
            items,
        }
    }

    /// True when every item was recorded.
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

/// High-level operations over any [`Ledger`] backend.
#[derive(Clone)]
pub struct LedgerClient {
    ledger: Arc<dyn Ledger>,
    policy: CallPolicy,
}

impl LedgerClient {
    pub fn new(ledger: Arc<dyn Ledger>, policy: CallPolicy) -> Self {
        Self { ledger, policy }
    }

    pub fn backend(&self) -> &'static str {
        self.ledger.backend()
    }

    /// Log the content hash of every record, owned by `owner`.
    ///
    /// Records are submitted concurrently. One failing record never stops the others; each
    /// item in the receipt carries its own outcome. The call returns only after every
    /// submission has finished.
    pub async fn log_records(
        &self,
        records: &[StructuredRecord],
        owner: &SubjectId,
        ctx: &CallContext,
    ) -> LedgerReceipt {
        let items = join_all(records.iter().map(|r| self.log_record(r, owner, ctx))).await;
        let receipt = LedgerReceipt::from_items(items);

        if receipt.is_complete() {
            tracing::info!(
                correlation_id = %ctx.correlation_id,
                subject_id = %owner,
                submitted = receipt.submitted,
                "ledger batch recorded"
            );
        } else {
            tracing::warn!(
                correlation_id = %ctx.correlation_id,
                subject_id = %owner,
                submitted = receipt.submitted,
                failed = receipt.failed,
                "ledger batch partially failed"
            );
        }
        receipt
    }

    async fn log_record(
        &self,
        record: &StructuredRecord,
        owner: &SubjectId,
        ctx: &CallContext,
    ) -> LedgerItem {
        let mut item = LedgerItem::pending(record);

        let data_hash = match record.content_hash() {
            Ok(hash) => hash,
            Err(e) => return item.failed(e),
        };
        item.data_hash = Some(data_hash.clone());

        let resource_id = record.id().as_str();
        let owner = owner.as_str();

        let exists = call_with_retry(
            &self.policy,
            CallClass::Read,
            "ledger recordExists",
            ctx,
            || self.ledger.record_exists(resource_id, owner, ctx),
        )
        .await;
        let operation = match exists {
            Ok(true) => LedgerOperation::Update,
            Ok(false) => LedgerOperation::Create,
            Err(e) => return item.failed(e),
        };
        item.operation = Some(operation);

        let mut result = self.submit(operation, resource_id, &data_hash, owner, ctx).await;
        if operation == LedgerOperation::Create
            && matches!(result, Err(LedgerError::AlreadyExists { .. }))
        {
            // Another turn created the entry between the existence check and our call.
            item.operation = Some(LedgerOperation::Update);
            result = self
                .submit(LedgerOperation::Update, resource_id, &data_hash, owner, ctx)
                .await;
        }

        match result {
            Ok(receipt) => {
                tracing::debug!(
                    correlation_id = %ctx.correlation_id,
                    resource_id,
                    block_number = receipt.block_number,
                    "ledger entry written"
                );
                item.succeeded(receipt)
            }
            Err(e) => {
                tracing::warn!(
                    correlation_id = %ctx.correlation_id,
                    resource_id,
                    error = %e,
                    "ledger submission failed"
                );
                item.failed(e)
            }
        }
    }

    async fn submit(
        &self,
        operation: LedgerOperation,
        resource_id: &str,
        data_hash: &ContentHash,
        owner: &str,
        ctx: &CallContext,
    ) -> LedgerResult<TxReceipt> {
        match operation {
            LedgerOperation::Create => {
                call_with_retry(
                    &self.policy,
                    CallClass::Write,
                    "ledger createRecord",
                    ctx,
                    || self.ledger.create_record(resource_id, data_hash, owner, ctx),
                )
                .await
            }
            LedgerOperation::Update => {
                call_with_retry(
                    &self.policy,
                    CallClass::Write,
                    "ledger updateRecord",
                    ctx,
                    || self.ledger.update_record(resource_id, data_hash, owner, ctx),
                )
                .await
            }
        }
    }

    /// Every audit event for a `(resource, owner)` pair, oldest first.
    ///
    /// All six event kinds are queried. Malformed events, and events for another resource or
    /// owner, are skipped.
    ///
    /// # Errors
    ///
    /// Returns the first [`LedgerError`] from an event query once retries are exhausted.
    pub async fn get_audit_trail(
        &self,
        resource_id: &str,
        owner: &SubjectId,
        ctx: &CallContext,
    ) -> LedgerResult<Vec<AuditEntry>> {
        let owner = owner.as_str();
        let batches = try_join_all(AuditEventKind::ALL.into_iter().map(|kind| {
            call_with_retry(
                &self.policy,
                CallClass::Read,
                "ledger getEvents",
                ctx,
                move || self.ledger.query_events(kind, resource_id, owner, ctx),
            )
        }))
        .await?;

        let mut entries: Vec<AuditEntry> = batches
            .into_iter()
            .flatten()
            .filter_map(|raw| match AuditEntry::from_raw(raw) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(
                        correlation_id = %ctx.correlation_id,
                        resource_id,
                        error = %e,
                        "skipping malformed ledger event"
                    );
                    None
                }
            })
            .filter(|e| e.resource_id == resource_id && e.owner == owner)
            .collect();

        entries.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.block_number.cmp(&b.block_number))
                .then(a.log_index.cmp(&b.log_index))
        });
        Ok(entries)
    }

    /// True only if the ledger's current hash for the entry equals `expected_hash` exactly.
    ///
    /// The comparison is byte-for-byte and case-sensitive. A missing entry is `false`.
    ///
    /// # Errors
    ///
    /// Returns a [`LedgerError`] if the ledger cannot be read.
    pub async fn verify_integrity(
        &self,
        resource_id: &str,
        owner: &SubjectId,
        expected_hash: &str,
        ctx: &CallContext,
    ) -> LedgerResult<bool> {
        let owner = owner.as_str();
        let record = call_with_retry(
            &self.policy,
            CallClass::Read,
            "ledger getRecord",
            ctx,
            || self.ledger.get_record(resource_id, owner, ctx),
        )
        .await?;
        Ok(record.is_some_and(|r| r.data_hash.as_str() == expected_hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use chrono::Utc;
    use fhir::{Observation, ResourceId};
    use serde_json::json;
    use std::time::Duration;

    fn policy() -> CallPolicy {
        CallPolicy {
            call_timeout: Duration::from_secs(5),
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter_factor: 0.0,
        }
    }

    fn subject() -> SubjectId {
        SubjectId::new("patient-abc").unwrap()
    }

    fn observation(id: &str, text: &str) -> StructuredRecord {
        Observation::assessment_narrative(
            ResourceId::parse(id).unwrap(),
            &subject(),
            text,
            Utc::now(),
        )
        .into()
    }

    #[tokio::test]
    async fn test_first_log_creates_then_updates() {
        let client = LedgerClient::new(Arc::new(InMemoryLedger::new()), policy());
        let ctx = CallContext::detached();

        let first = client
            .log_records(&[observation("obs-1", "a")], &subject(), &ctx)
            .await;
        assert!(first.is_complete());
        assert_eq!(first.items[0].operation, Some(LedgerOperation::Create));

        let second = client
            .log_records(&[observation("obs-1", "b")], &subject(), &ctx)
            .await;
        assert_eq!(second.items[0].operation, Some(LedgerOperation::Update));
        assert!(second.items[0].transaction_hash.is_some());
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_others() {
        let ledger = InMemoryLedger::new().reject_writes_for("obs-bad");
        let client = LedgerClient::new(Arc::new(ledger), policy());

        let receipt = client
            .log_records(
                &[observation("obs-bad", "a"), observation("obs-good", "b")],
                &subject(),
                &CallContext::detached(),
            )
            .await;

        assert_eq!(receipt.submitted, 2);
        assert_eq!(receipt.succeeded, 1);
        assert_eq!(receipt.failed, 1);
        let bad = receipt.items.iter().find(|i| i.resource_id == "obs-bad").unwrap();
        assert!(!bad.success);
        assert!(bad.error.is_some());
        assert!(bad.data_hash.is_some());
    }

    #[tokio::test]
    async fn test_transient_write_failure_is_retried() {
        let ledger = InMemoryLedger::new().with_unavailable_writes(1);
        let client = LedgerClient::new(Arc::new(ledger), policy());
        let receipt = client
            .log_records(&[observation("obs-1", "a")], &subject(), &CallContext::detached())
            .await;
        assert!(receipt.is_complete());
    }

    #[tokio::test]
    async fn test_audit_trail_is_ordered_and_skips_malformed() {
        let ledger = Arc::new(InMemoryLedger::new());
        let client = LedgerClient::new(ledger.clone(), policy());
        let ctx = CallContext::detached();

        client
            .log_records(&[observation("obs-1", "a")], &subject(), &ctx)
            .await;
        client
            .log_records(&[observation("obs-1", "b")], &subject(), &ctx)
            .await;
        ledger.append_raw_event(json!({
            "event": "RecordAccessed",
            "resourceId": "obs-1",
            "owner": "patient-abc"
        }));

        let trail = client
            .get_audit_trail("obs-1", &subject(), &ctx)
            .await
            .unwrap();
        let kinds: Vec<_> = trail.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![AuditEventKind::Created, AuditEventKind::Updated]);
        assert!(trail[0].block_number < trail[1].block_number);
    }

    #[tokio::test]
    async fn test_verify_integrity_is_exact() {
        let client = LedgerClient::new(Arc::new(InMemoryLedger::new()), policy());
        let ctx = CallContext::detached();
        let record = observation("obs-1", "a");
        let hash = record.content_hash().unwrap();

        assert!(!client
            .verify_integrity("obs-1", &subject(), hash.as_str(), &ctx)
            .await
            .unwrap());

        client.log_records(&[record], &subject(), &ctx).await;

        assert!(client
            .verify_integrity("obs-1", &subject(), hash.as_str(), &ctx)
            .await
            .unwrap());
        assert!(!client
            .verify_integrity("obs-1", &subject(), &hash.as_str().to_uppercase(), &ctx)
            .await
            .unwrap());
    }
}
