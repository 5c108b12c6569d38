//! Audit ledger.
//!
//! The ledger is an append-only, hash-addressed store: it records content hashes of clinical
//! records and the events that touched them, never the clinical content itself.
//!
//! - [`Ledger`]: the contract surface (`createRecord`, `updateRecord`, `getRecord`,
//!   `recordExists`, event queries)
//! - [`InMemoryLedger`]: emulated chain for development and tests
//! - [`JsonRpcLedger`]: JSON-RPC 2.0 gateway in front of the deployed contract
//! - [`LedgerClient`]: batch logging, audit trails and integrity checks on top of a backend

pub mod client;
pub mod memory;
pub mod rpc;

pub use client::{LedgerClient, LedgerItem, LedgerOperation, LedgerReceipt};
pub use memory::InMemoryLedger;
pub use rpc::JsonRpcLedger;

use crate::context::CallContext;
use crate::retry::Retryable;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fhir::ContentHash;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Errors returned by ledger backends.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Connection failure, overload or gateway error. Safe to retry.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// The contract or gateway refused the call.
    #[error("ledger rejected call ({code}): {message}")]
    Rejected { code: i64, message: String },

    #[error("ledger record {resource_id} already exists")]
    AlreadyExists { resource_id: String },

    #[error("ledger record {resource_id} not found")]
    NotFound { resource_id: String },

    #[error("malformed ledger response: {0}")]
    Malformed(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("{0} cancelled by caller")]
    Cancelled(&'static str),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

impl Retryable for LedgerError {
    fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_))
    }

    fn is_timeout(&self) -> bool {
        matches!(self, LedgerError::Timeout { .. })
    }

    fn timed_out(operation: &'static str, after: Duration) -> Self {
        LedgerError::Timeout { operation, after }
    }

    fn cancelled(operation: &'static str) -> Self {
        LedgerError::Cancelled(operation)
    }
}

/// The six event kinds the contract emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditEventKind {
    Created,
    Updated,
    Accessed,
    Shared,
    Revoked,
    Deleted,
}

impl AuditEventKind {
    pub const ALL: [AuditEventKind; 6] = [
        AuditEventKind::Created,
        AuditEventKind::Updated,
        AuditEventKind::Accessed,
        AuditEventKind::Shared,
        AuditEventKind::Revoked,
        AuditEventKind::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventKind::Created => "created",
            AuditEventKind::Updated => "updated",
            AuditEventKind::Accessed => "accessed",
            AuditEventKind::Shared => "shared",
            AuditEventKind::Revoked => "revoked",
            AuditEventKind::Deleted => "deleted",
        }
    }

    /// Contract event name, e.g. `RecordCreated`.
    pub fn event_name(&self) -> &'static str {
        match self {
            AuditEventKind::Created => "RecordCreated",
            AuditEventKind::Updated => "RecordUpdated",
            AuditEventKind::Accessed => "RecordAccessed",
            AuditEventKind::Shared => "RecordShared",
            AuditEventKind::Revoked => "AccessRevoked",
            AuditEventKind::Deleted => "RecordDeleted",
        }
    }

    pub fn from_event_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.event_name() == name)
    }
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditEventKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s) || k.event_name() == s)
            .ok_or_else(|| LedgerError::Malformed(format!("unknown audit event kind: {s}")))
    }
}

/// Receipt of a mined ledger transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub transaction_hash: String,
    pub block_number: u64,
}

/// State the contract currently holds for one `(resource, owner)` pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnChainRecord {
    pub resource_id: String,
    pub owner: String,
    pub data_hash: ContentHash,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub updated_at: DateTime<Utc>,
}

/// One parsed, immutable audit event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Unique id of the event: `<transactionHash>:<logIndex>`.
    pub record_id: String,
    pub resource_id: String,
    pub owner: String,
    pub kind: AuditEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_hash: Option<ContentHash>,
    pub transaction_hash: String,
    pub block_number: u64,
    pub log_index: u32,
    pub timestamp: DateTime<Utc>,
}

/// Wire form of an event as returned by a backend's event query.
///
/// `timestamp` is the block time in Unix seconds.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawEvent {
    pub event: String,
    pub resource_id: String,
    pub owner: String,
    #[serde(default)]
    pub data_hash: Option<String>,
    pub transaction_hash: String,
    pub block_number: u64,
    #[serde(default)]
    pub log_index: u32,
    pub timestamp: i64,
}

impl AuditEntry {
    /// Parse a raw event value.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Malformed`] if any field is missing or invalid.
    pub fn from_raw(value: serde_json::Value) -> LedgerResult<Self> {
        let raw: RawEvent =
            serde_json::from_value(value).map_err(|e| LedgerError::Malformed(e.to_string()))?;
        let kind = AuditEventKind::from_event_name(&raw.event)
            .ok_or_else(|| LedgerError::Malformed(format!("unknown event {}", raw.event)))?;
        let data_hash = raw
            .data_hash
            .as_deref()
            .map(ContentHash::parse)
            .transpose()
            .map_err(|e| LedgerError::Malformed(e.to_string()))?;
        let timestamp = DateTime::from_timestamp(raw.timestamp, 0)
            .ok_or_else(|| LedgerError::Malformed(format!("bad timestamp {}", raw.timestamp)))?;

        Ok(Self {
            record_id: format!("{}:{}", raw.transaction_hash, raw.log_index),
            resource_id: raw.resource_id,
            owner: raw.owner,
            kind,
            data_hash,
            transaction_hash: raw.transaction_hash,
            block_number: raw.block_number,
            log_index: raw.log_index,
            timestamp,
        })
    }
}

/// The ledger contract surface.
#[async_trait]
pub trait Ledger: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Register a new `(resource, owner)` entry with its first hash.
    async fn create_record(
        &self,
        resource_id: &str,
        data_hash: &ContentHash,
        owner: &str,
        ctx: &CallContext,
    ) -> LedgerResult<TxReceipt>;

    /// Replace the hash of an existing entry.
    async fn update_record(
        &self,
        resource_id: &str,
        data_hash: &ContentHash,
        owner: &str,
        ctx: &CallContext,
    ) -> LedgerResult<TxReceipt>;

    async fn get_record(
        &self,
        resource_id: &str,
        owner: &str,
        ctx: &CallContext,
    ) -> LedgerResult<Option<OnChainRecord>>;

    async fn record_exists(
        &self,
        resource_id: &str,
        owner: &str,
        ctx: &CallContext,
    ) -> LedgerResult<bool>;

    /// Raw events of one kind for a `(resource, owner)` pair, unparsed.
    async fn query_events(
        &self,
        kind: AuditEventKind,
        resource_id: &str,
        owner: &str,
        ctx: &CallContext,
    ) -> LedgerResult<Vec<serde_json::Value>>;
}
