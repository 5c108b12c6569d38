//! Emulated ledger held in process memory.
//!
//! Behaves like the deployed contract: one entry per `(resource, owner)`, `create` on an
//! existing entry and `update` on a missing one revert, and every state change appends an
//! event. Each transaction is mined into its own block.

use super::{
    AuditEventKind, Ledger, LedgerError, LedgerResult, OnChainRecord, RawEvent, TxReceipt,
};
use crate::context::CallContext;
use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use fhir::ContentHash;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Default)]
struct ChainState {
    block_number: u64,
    records: HashMap<(String, String), OnChainRecord>,
    events: Vec<serde_json::Value>,
    rejected_resources: HashSet<String>,
    unavailable_writes: u32,
}

/// In-memory ledger backend.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<ChainState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes touching `resource_id` revert.
    pub fn reject_writes_for(self, resource_id: impl Into<String>) -> Self {
        self.lock().rejected_resources.insert(resource_id.into());
        self
    }

    /// The next `n` writes fail with a transient error.
    pub fn with_unavailable_writes(self, n: u32) -> Self {
        self.lock().unavailable_writes = n;
        self
    }

    /// Appends an event without touching record state, for example an access log entry
    /// emitted by another system. Accepts anything, including malformed values.
    pub fn append_raw_event(&self, event: serde_json::Value) {
        self.lock().events.push(event);
    }

    /// Emits an access-style event (`accessed`, `shared`, `revoked`, `deleted`) for an entry.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] if the entry does not exist.
    pub fn log_event(
        &self,
        kind: AuditEventKind,
        resource_id: &str,
        owner: &str,
    ) -> LedgerResult<TxReceipt> {
        let mut state = self.lock();
        let data_hash = state
            .records
            .get(&(resource_id.to_owned(), owner.to_owned()))
            .map(|r| r.data_hash.clone())
            .ok_or_else(|| LedgerError::NotFound {
                resource_id: resource_id.to_owned(),
            })?;
        Ok(mine(&mut state, kind, resource_id, owner, &data_hash))
    }

    /// Number of events emitted so far, malformed ones included.
    pub fn event_count(&self) -> usize {
        self.lock().events.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_write(state: &mut ChainState, resource_id: &str) -> LedgerResult<()> {
        if state.unavailable_writes > 0 {
            state.unavailable_writes -= 1;
            return Err(LedgerError::Unavailable("emulated gateway outage".into()));
        }
        if state.rejected_resources.contains(resource_id) {
            return Err(LedgerError::Rejected {
                code: 3,
                message: format!("execution reverted for {resource_id}"),
            });
        }
        Ok(())
    }
}

/// Mines a one-transaction block and records its event.
fn mine(
    state: &mut ChainState,
    kind: AuditEventKind,
    resource_id: &str,
    owner: &str,
    data_hash: &ContentHash,
) -> TxReceipt {
    state.block_number += 1;
    let block_number = state.block_number;
    let transaction_hash = ContentHash::of_bytes(
        format!("{block_number}:{kind}:{resource_id}:{owner}:{data_hash}").as_bytes(),
    )
    .to_string();

    let event = RawEvent {
        event: kind.event_name().to_owned(),
        resource_id: resource_id.to_owned(),
        owner: owner.to_owned(),
        data_hash: Some(data_hash.to_string()),
        transaction_hash: transaction_hash.clone(),
        block_number,
        log_index: 0,
        timestamp: Utc::now().timestamp(),
    };
    match serde_json::to_value(&event) {
        Ok(value) => state.events.push(value),
        Err(e) => tracing::error!(error = %e, "failed to encode emulated ledger event"),
    }

    TxReceipt {
        transaction_hash,
        block_number,
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn create_record(
        &self,
        resource_id: &str,
        data_hash: &ContentHash,
        owner: &str,
        _ctx: &CallContext,
    ) -> LedgerResult<TxReceipt> {
        let mut state = self.lock();
        Self::check_write(&mut state, resource_id)?;

        let key = (resource_id.to_owned(), owner.to_owned());
        if state.records.contains_key(&key) {
            return Err(LedgerError::AlreadyExists {
                resource_id: resource_id.to_owned(),
            });
        }
        let now = Utc::now().trunc_subsecs(0);
        state.records.insert(
            key,
            OnChainRecord {
                resource_id: resource_id.to_owned(),
                owner: owner.to_owned(),
                data_hash: data_hash.clone(),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(mine(&mut state, AuditEventKind::Created, resource_id, owner, data_hash))
    }

    async fn update_record(
        &self,
        resource_id: &str,
        data_hash: &ContentHash,
        owner: &str,
        _ctx: &CallContext,
    ) -> LedgerResult<TxReceipt> {
        let mut state = self.lock();
        Self::check_write(&mut state, resource_id)?;

        let record = state
            .records
            .get_mut(&(resource_id.to_owned(), owner.to_owned()))
            .ok_or_else(|| LedgerError::NotFound {
                resource_id: resource_id.to_owned(),
            })?;
        record.data_hash = data_hash.clone();
        record.updated_at = Utc::now().trunc_subsecs(0);
        Ok(mine(&mut state, AuditEventKind::Updated, resource_id, owner, data_hash))
    }

    async fn get_record(
        &self,
        resource_id: &str,
        owner: &str,
        _ctx: &CallContext,
    ) -> LedgerResult<Option<OnChainRecord>> {
        Ok(self
            .lock()
            .records
            .get(&(resource_id.to_owned(), owner.to_owned()))
            .cloned())
    }

    async fn record_exists(
        &self,
        resource_id: &str,
        owner: &str,
        _ctx: &CallContext,
    ) -> LedgerResult<bool> {
        Ok(self
            .lock()
            .records
            .contains_key(&(resource_id.to_owned(), owner.to_owned())))
    }

    async fn query_events(
        &self,
        kind: AuditEventKind,
        resource_id: &str,
        owner: &str,
        _ctx: &CallContext,
    ) -> LedgerResult<Vec<serde_json::Value>> {
        let state = self.lock();
        Ok(state
            .events
            .iter()
            .filter(|e| {
                e.get("event").and_then(|v| v.as_str()) == Some(kind.event_name())
                    && e.get("resourceId").and_then(|v| v.as_str()) == Some(resource_id)
                    && e.get("owner").and_then(|v| v.as_str()) == Some(owner)
            })
            .cloned()
            .collect())
    }
}
