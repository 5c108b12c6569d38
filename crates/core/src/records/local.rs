//! Filesystem-backed record store for development.
//!
//! Layout under the data directory:
//!
//! ```text
//! <data_dir>/
//!   <subject>/<ResourceType>/<id>/<version>.json
//!   .idempotency/<sha256(key)>.json
//! ```
//!
//! Writes go to a temporary file first and are renamed into place, so a reader never sees a
//! partially written record. A single async mutex serialises writers for the duration of one
//! `put`; reads take no lock. Every call is bounded by the configured call timeout.

use super::{IdempotencyKey, PutOutcome, RecordListing, RecordStore, StoreError, StoreResult};
use crate::constants::{DEFAULT_CALL_TIMEOUT, IDEMPOTENCY_DIR_NAME};
use crate::context::CallContext;
use async_trait::async_trait;
use fhir::{ContentHash, ResourceId, ResourceType, StructuredRecord};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use triage_types::SubjectId;

/// Entry in the idempotency index.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyEntry {
    key: String,
    subject_id: String,
    resource_type: ResourceType,
    id: ResourceId,
    version_id: u64,
    data_hash: ContentHash,
}

impl KeyEntry {
    fn address(&self) -> String {
        format!("{}/{}/{}", self.subject_id, self.resource_type, self.id)
    }
}

/// Record store writing JSON files under a data directory.
pub struct LocalRecordStore {
    root: PathBuf,
    write_lock: Mutex<()>,
    call_timeout: Duration,
}

impl LocalRecordStore {
    /// Create a store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Bound on each store call, including time spent waiting for the write lock.
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    operation,
                    after = ?self.call_timeout,
                    "record store call timed out"
                );
                Err(StoreError::Timeout {
                    operation,
                    after: self.call_timeout,
                })
            }
        }
    }

    fn subject_dir(&self, subject: &SubjectId) -> StoreResult<PathBuf> {
        // Subject ids may contain '.', which must not address the index or a parent directory.
        if subject.as_str().starts_with('.') {
            return Err(StoreError::InvalidAddress(format!(
                "subject id cannot start with '.': {subject}"
            )));
        }
        Ok(self.root.join(subject.as_str()))
    }

    fn record_dir(
        &self,
        subject: &SubjectId,
        resource_type: ResourceType,
        id: &ResourceId,
    ) -> StoreResult<PathBuf> {
        Ok(self
            .subject_dir(subject)?
            .join(resource_type.as_str())
            .join(id.as_str()))
    }

    fn key_path(&self, key: &IdempotencyKey) -> PathBuf {
        self.root
            .join(IDEMPOTENCY_DIR_NAME)
            .join(format!("{}.json", key.digest()))
    }

    async fn read_key_entry(&self, key: &IdempotencyKey) -> StoreResult<Option<KeyEntry>> {
        let path = self.key_path(key);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| corrupt(&path, e)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the latest version and its record.
    async fn read_latest(&self, dir: &Path) -> StoreResult<Option<(u64, StructuredRecord)>> {
        let versions = list_versions(dir).await?;
        match versions.last() {
            Some(&version) => {
                let record = read_record(&version_path(dir, version)).await?;
                Ok(Some((version, record)))
            }
            None => Ok(None),
        }
    }

    /// Latest version of every record under `<subject>/<ResourceType>/`.
    async fn collect_type_dir(
        &self,
        type_dir: &Path,
        out: &mut Vec<StructuredRecord>,
    ) -> StoreResult<()> {
        for id_dir in list_subdirs(type_dir).await? {
            if let Some((_, record)) = self.read_latest(&id_dir).await? {
                out.push(record);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for LocalRecordStore {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn put(
        &self,
        record: &StructuredRecord,
        key: Option<&IdempotencyKey>,
        ctx: &CallContext,
    ) -> StoreResult<PutOutcome> {
        self.bounded("store put", async {
            let subject = record.subject_id()?;
            let data_hash = record.content_hash()?;
            let key = match key {
                Some(key) => key.clone(),
                None => IdempotencyKey::derive(&subject, record.resource_type(), record.id()),
            };
            let dir = self.record_dir(&subject, record.resource_type(), record.id())?;
            let address = format!("{subject}/{}/{}", record.resource_type(), record.id());

            let _guard = self.write_lock.lock().await;

            if let Some(entry) = self.read_key_entry(&key).await? {
                if entry.address() != address {
                    return Err(StoreError::KeyConflict {
                        key: key.to_string(),
                        existing: entry.address(),
                    });
                }
                if entry.data_hash == data_hash {
                    tracing::debug!(
                        correlation_id = %ctx.correlation_id,
                        resource_id = %record.id(),
                        version_id = entry.version_id,
                        "idempotent put; content unchanged"
                    );
                    return Ok(PutOutcome::new(record, entry.version_id, false));
                }
            }

            let (version_id, created) = match self.read_latest(&dir).await? {
                Some((latest, stored)) if stored.content_hash()? == data_hash => (latest, false),
                Some((latest, _)) => (latest + 1, true),
                None => (1, true),
            };

            if created {
                fs::create_dir_all(&dir).await?;
                write_atomic(&version_path(&dir, version_id), record.to_json_pretty()?.as_bytes())
                    .await?;
            }

            let entry = KeyEntry {
                key: key.to_string(),
                subject_id: subject.to_string(),
                resource_type: record.resource_type(),
                id: record.id().clone(),
                version_id,
                data_hash,
            };
            let index_path = self.key_path(&key);
            if let Some(parent) = index_path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let entry_json =
                serde_json::to_vec_pretty(&entry).map_err(|e| corrupt(&index_path, e))?;
            write_atomic(&index_path, &entry_json).await?;

            tracing::info!(
                correlation_id = %ctx.correlation_id,
                subject_id = %subject,
                resource_id = %record.id(),
                resource_type = %record.resource_type(),
                version_id,
                created,
                "record stored"
            );
            Ok(PutOutcome::new(record, version_id, created))
        })
        .await
    }

    async fn get(
        &self,
        subject: &SubjectId,
        resource_type: ResourceType,
        id: &ResourceId,
        _ctx: &CallContext,
    ) -> StoreResult<StructuredRecord> {
        self.bounded("store get", async {
            let dir = self.record_dir(subject, resource_type, id)?;
            self.read_latest(&dir)
                .await?
                .map(|(_, record)| record)
                .ok_or_else(|| StoreError::NotFound {
                    resource_type,
                    id: id.to_string(),
                })
        })
        .await
    }

    async fn history(
        &self,
        subject: &SubjectId,
        resource_type: ResourceType,
        id: &ResourceId,
        _ctx: &CallContext,
    ) -> StoreResult<Vec<StructuredRecord>> {
        self.bounded("store history", async {
            let dir = self.record_dir(subject, resource_type, id)?;
            let versions = list_versions(&dir).await?;
            if versions.is_empty() {
                return Err(StoreError::NotFound {
                    resource_type,
                    id: id.to_string(),
                });
            }
            let mut records = Vec::with_capacity(versions.len());
            for version in versions {
                records.push(read_record(&version_path(&dir, version)).await?);
            }
            Ok(records)
        })
        .await
    }

    async fn list_by_subject(
        &self,
        subject: &SubjectId,
        _ctx: &CallContext,
    ) -> StoreResult<RecordListing> {
        self.bounded("store list", async {
            let subject_dir = self.subject_dir(subject)?;
            let mut records = Vec::new();
            for resource_type in ResourceType::ALL {
                self.collect_type_dir(&subject_dir.join(resource_type.as_str()), &mut records)
                    .await?;
            }
            Ok(RecordListing::from_records(records))
        })
        .await
    }

    async fn list_by_type(
        &self,
        resource_type: ResourceType,
        _ctx: &CallContext,
    ) -> StoreResult<RecordListing> {
        self.bounded("store list", async {
            let mut records = Vec::new();
            for subject_dir in list_subdirs(&self.root).await? {
                let hidden = subject_dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'));
                if hidden {
                    continue;
                }
                self.collect_type_dir(&subject_dir.join(resource_type.as_str()), &mut records)
                    .await?;
            }
            Ok(RecordListing::from_records(records))
        })
        .await
    }
}

fn version_path(dir: &Path, version: u64) -> PathBuf {
    dir.join(format!("{version}.json"))
}

fn corrupt(path: &Path, err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt {
        location: path.display().to_string(),
        reason: err.to_string(),
    }
}

async fn read_record(path: &Path) -> StoreResult<StructuredRecord> {
    let text = fs::read_to_string(path).await?;
    StructuredRecord::parse_json(&text).map_err(|e| corrupt(path, e))
}

/// Version numbers stored in `dir`, ascending. A missing directory has no versions.
async fn list_versions(dir: &Path) -> StoreResult<Vec<u64>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut versions = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(version) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            versions.push(version);
        }
    }
    versions.sort_unstable();
    Ok(versions)
}

/// Immediate subdirectories of `dir`, sorted. A missing directory has none.
async fn list_subdirs(dir: &Path) -> StoreResult<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StoreError::InvalidAddress(path.display().to_string()))?;
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));

    fs::write(&tmp, bytes).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fhir::{Observation, RiskAssessment, RiskLevel};
    use tempfile::TempDir;

    fn subject() -> SubjectId {
        SubjectId::new("patient-abc").unwrap()
    }

    fn observation(subject: &SubjectId, text: &str) -> StructuredRecord {
        Observation::assessment_narrative(ResourceId::generate(), subject, text, Utc::now()).into()
    }

    fn store() -> (TempDir, LocalRecordStore) {
        let dir = TempDir::new().unwrap();
        let store = LocalRecordStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (_dir, store) = store();
        let ctx = CallContext::detached();
        let record = observation(&subject(), "chest pain");

        let outcome = store.put(&record, None, &ctx).await.unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.version_id, 1);
        assert_eq!(
            outcome.location,
            format!("Observation/{}/_history/1", record.id())
        );

        let fetched = store
            .get(&subject(), ResourceType::Observation, record.id(), &ctx)
            .await
            .unwrap();
        assert_eq!(fetched, record);
    }

    #[tokio::test]
    async fn test_repeated_put_is_idempotent() {
        let (_dir, store) = store();
        let ctx = CallContext::detached();
        let record = observation(&subject(), "chest pain");

        let first = store.put(&record, None, &ctx).await.unwrap();
        let second = store.put(&record, None, &ctx).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.location, second.location);
        assert!(!second.created);

        let listing = store.list_by_subject(&subject(), &ctx).await.unwrap();
        assert_eq!(listing.count(), 1);
        assert_eq!(listing.resources().len(), 1);
    }

    #[tokio::test]
    async fn test_changed_content_creates_new_version() {
        let (_dir, store) = store();
        let ctx = CallContext::detached();
        let record = observation(&subject(), "first");
        store.put(&record, None, &ctx).await.unwrap();

        let mut changed = record.clone();
        if let StructuredRecord::Observation(obs) = &mut changed {
            obs.value_string = "second".into();
        }
        let outcome = store.put(&changed, None, &ctx).await.unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.version_id, 2);

        let latest = store
            .get(&subject(), ResourceType::Observation, record.id(), &ctx)
            .await
            .unwrap();
        assert_eq!(latest, changed);

        let history = store
            .history(&subject(), ResourceType::Observation, record.id(), &ctx)
            .await
            .unwrap();
        assert_eq!(history, vec![record, changed]);
    }

    #[tokio::test]
    async fn test_explicit_key_reused_for_other_record_conflicts() {
        let (_dir, store) = store();
        let ctx = CallContext::detached();
        let key = IdempotencyKey::explicit("turn-1").unwrap();

        store
            .put(&observation(&subject(), "a"), Some(&key), &ctx)
            .await
            .unwrap();
        let err = store
            .put(&observation(&subject(), "b"), Some(&key), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::KeyConflict { .. }));
    }

    #[tokio::test]
    async fn test_put_waiting_past_call_timeout_is_timeout() {
        let (_dir, store) = store();
        let store = store.with_call_timeout(Duration::from_millis(20));
        let record = observation(&subject(), "chest pain");

        let held = store.write_lock.lock().await;
        let err = store
            .put(&record, None, &CallContext::detached())
            .await
            .unwrap_err();
        drop(held);

        match err {
            StoreError::Timeout { operation, after } => {
                assert_eq!(operation, "store put");
                assert_eq!(after, Duration::from_millis(20));
            }
            other => panic!("unexpected error: {other}"),
        }
        // Nothing was written, and the lock is free again.
        let outcome = store
            .put(&record, None, &CallContext::detached())
            .await
            .unwrap();
        assert_eq!(outcome.version_id, 1);
        assert!(outcome.created);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (_dir, store) = store();
        let err = store
            .get(
                &subject(),
                ResourceType::RiskAssessment,
                &ResourceId::generate(),
                &CallContext::detached(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_unknown_subject_lists_empty() {
        let (_dir, store) = store();
        let listing = store
            .list_by_subject(
                &SubjectId::new("unknown-patient").unwrap(),
                &CallContext::detached(),
            )
            .await
            .unwrap();
        assert_eq!(listing.count(), 0);
        assert!(listing.resources().is_empty());
    }

    #[tokio::test]
    async fn test_list_by_type_spans_subjects() {
        let (_dir, store) = store();
        let ctx = CallContext::detached();
        let other = SubjectId::new("patient-xyz").unwrap();

        store.put(&observation(&subject(), "a"), None, &ctx).await.unwrap();
        store.put(&observation(&other, "b"), None, &ctx).await.unwrap();
        let risk: StructuredRecord = RiskAssessment::from_outcome(
            ResourceId::generate(),
            &other,
            RiskLevel::Low,
            None,
            "outcome",
            Utc::now(),
        )
        .into();
        store.put(&risk, None, &ctx).await.unwrap();

        let listing = store
            .list_by_type(ResourceType::Observation, &ctx)
            .await
            .unwrap();
        assert_eq!(listing.count(), 2);
        assert_eq!(listing.patient_ids(), ["patient-abc", "patient-xyz"]);
        assert_eq!(listing.resource_types(), ["Observation"]);
    }

    #[tokio::test]
    async fn test_dot_prefixed_subject_is_rejected() {
        let (_dir, store) = store();
        let err = store
            .list_by_subject(&SubjectId::new("...").unwrap(), &CallContext::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let (dir, store) = store();
        let id = ResourceId::generate();
        let record_dir = dir
            .path()
            .join("patient-abc")
            .join("Observation")
            .join(id.as_str());
        std::fs::create_dir_all(&record_dir).unwrap();
        std::fs::write(record_dir.join("1.json"), "{not json").unwrap();

        let err = store
            .get(&subject(), ResourceType::Observation, &id, &CallContext::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }
}
