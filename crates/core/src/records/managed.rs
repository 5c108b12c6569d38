//! Record store backed by a managed FHIR R4 REST server.
//!
//! Interactions used:
//! - read: `GET {base}/{type}/{id}`
//! - update-as-create: `PUT {base}/{type}/{id}`
//! - history: `GET {base}/{type}/{id}/_history`
//! - search: `GET {base}/{type}?subject=Patient/{subject}`, following `next` links
//!
//! Every write is preceded by a read; identical content skips the PUT entirely, which keeps
//! retried turns from minting new server versions.
//!
//! Explicit idempotency keys are remembered per process, and reusing one for a different address
//! fails with [`StoreError::KeyConflict`] before any request is sent. Across processes the
//! `Idempotency-Key` header is the server's to enforce.

use super::{IdempotencyKey, PutOutcome, RecordListing, RecordStore, StoreError, StoreResult};
use crate::constants::{CORRELATION_ID_HEADER, IDEMPOTENCY_KEY_HEADER, MAX_BUNDLE_PAGES};
use crate::context::CallContext;
use crate::retry::{call_with_retry, CallClass, CallPolicy};
use async_trait::async_trait;
use fhir::{ResourceId, ResourceType, StructuredRecord};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use triage_types::SubjectId;

const FHIR_JSON: &str = "application/fhir+json";

/// Record store talking to a FHIR server.
pub struct ManagedRecordStore {
    client: Client,
    base_url: String,
    access_token: Option<String>,
    policy: CallPolicy,
    /// Explicit key -> record address it was first used for.
    explicit_keys: Mutex<HashMap<IdempotencyKey, String>>,
}

#[derive(Deserialize)]
struct Bundle {
    #[serde(default)]
    link: Vec<BundleLink>,
    #[serde(default)]
    entry: Vec<BundleEntry>,
}

#[derive(Deserialize)]
struct BundleLink {
    relation: String,
    url: String,
}

#[derive(Deserialize)]
struct BundleEntry {
    #[serde(default)]
    resource: Option<Value>,
}

impl ManagedRecordStore {
    /// Create a client for the FHIR server at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        access_token: Option<String>,
        policy: CallPolicy,
    ) -> StoreResult<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static(FHIR_JSON));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(policy.call_timeout)
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            access_token: access_token.filter(|t| !t.is_empty()),
            policy,
            explicit_keys: Mutex::new(HashMap::new()),
        })
    }

    /// Remembers `key` for `address`, or fails if it already belongs to another address.
    fn claim_key(&self, key: &IdempotencyKey, address: &str) -> StoreResult<()> {
        let mut keys = self
            .explicit_keys
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match keys.get(key) {
            Some(existing) if existing != address => Err(StoreError::KeyConflict {
                key: key.to_string(),
                existing: existing.clone(),
            }),
            Some(_) => Ok(()),
            None => {
                keys.insert(key.clone(), address.to_owned());
                Ok(())
            }
        }
    }

    fn resource_url(&self, resource_type: ResourceType, id: &ResourceId) -> String {
        format!("{}/{resource_type}/{id}", self.base_url)
    }

    fn authorised(&self, builder: RequestBuilder, ctx: &CallContext) -> RequestBuilder {
        let builder = builder.header(CORRELATION_ID_HEADER, ctx.correlation_id.as_str());
        match &self.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// GET a JSON resource; 404 and 410 yield `None`.
    async fn fetch(&self, url: &str, ctx: &CallContext) -> StoreResult<Option<Value>> {
        call_with_retry(&self.policy, CallClass::Read, "fhir read", ctx, || async {
            let response = self
                .authorised(self.client.get(url), ctx)
                .send()
                .await
                .map_err(|e| map_transport_error(e, self.policy.call_timeout))?;
            if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::GONE) {
                return Ok(None);
            }
            let response = check_status(response).await?;
            let value = response
                .json::<Value>()
                .await
                .map_err(|e| map_transport_error(e, self.policy.call_timeout))?;
            Ok(Some(value))
        })
        .await
    }

    /// Fetches every page of a search or history bundle, starting at `url`.
    async fn fetch_bundle(
        &self,
        url: String,
        query: &[(&str, String)],
        ctx: &CallContext,
    ) -> StoreResult<Vec<Value>> {
        let mut resources = Vec::new();
        let mut next = Some(url);
        let mut pages = 0usize;

        while let Some(page_url) = next.take() {
            if pages >= MAX_BUNDLE_PAGES {
                tracing::warn!(
                    correlation_id = %ctx.correlation_id,
                    pages,
                    "bundle page limit reached; listing truncated"
                );
                break;
            }
            let query: &[(&str, String)] = if pages == 0 { query } else { &[] };
            pages += 1;

            let bundle: Bundle =
                call_with_retry(&self.policy, CallClass::Read, "fhir search", ctx, || async {
                    let response = self
                        .authorised(self.client.get(&page_url).query(query), ctx)
                        .send()
                        .await
                        .map_err(|e| map_transport_error(e, self.policy.call_timeout))?;
                    check_status(response)
                        .await?
                        .json::<Bundle>()
                        .await
                        .map_err(|e| map_transport_error(e, self.policy.call_timeout))
                })
                .await?;

            resources.extend(bundle.entry.into_iter().filter_map(|e| e.resource));
            next = bundle
                .link
                .into_iter()
                .find(|l| l.relation == "next")
                .map(|l| l.url);
        }

        Ok(resources)
    }

    async fn search(
        &self,
        resource_type: ResourceType,
        subject: Option<&SubjectId>,
        ctx: &CallContext,
    ) -> StoreResult<Vec<StructuredRecord>> {
        let query: Vec<(&str, String)> = subject
            .map(|s| vec![("subject", format!("Patient/{s}"))])
            .unwrap_or_default();
        let values = self
            .fetch_bundle(format!("{}/{resource_type}", self.base_url), &query, ctx)
            .await?;

        Ok(values
            .into_iter()
            .filter_map(|value| parse_entry(value).map(|(_, record)| record))
            .filter(|record| match subject {
                Some(s) => record.ensure_subject(s).is_ok(),
                None => true,
            })
            .collect())
    }
}

/// Parses a bundle entry, logging and skipping anything that is not one of our records.
fn parse_entry(value: Value) -> Option<(u64, StructuredRecord)> {
    let version = version_of(&value).unwrap_or(1);
    match StructuredRecord::from_value(value) {
        Ok(record) => Some((version, record)),
        Err(e) => {
            tracing::warn!(error = %e, "skipping unparseable bundle entry");
            None
        }
    }
}

/// `meta.versionId` of a FHIR resource.
fn version_of(value: &Value) -> Option<u64> {
    value
        .pointer("/meta/versionId")
        .and_then(Value::as_str)
        .and_then(|v| v.parse().ok())
}

/// Version from a weak ETag such as `W/"3"`.
fn version_from_etag(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(header::ETAG)?
        .to_str()
        .ok()?
        .trim_start_matches("W/")
        .trim_matches('"')
        .parse()
        .ok()
}

fn map_transport_error(err: reqwest::Error, after: Duration) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout {
            operation: "fhir request",
            after,
        }
    } else if err.is_decode() {
        StoreError::Corrupt {
            location: err.url().map(|u| u.to_string()).unwrap_or_default(),
            reason: err.to_string(),
        }
    } else {
        StoreError::Unavailable(err.to_string())
    }
}

async fn check_status(response: Response) -> StoreResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| {
            v.pointer("/issue/0/diagnostics")
                .and_then(Value::as_str)
                .map(str::to_owned)
        })
        .unwrap_or(text);

    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        return Err(StoreError::Unavailable(format!("{status}: {message}")));
    }
    Err(StoreError::Rejected {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl RecordStore for ManagedRecordStore {
    fn backend(&self) -> &'static str {
        "managed"
    }

    async fn put(
        &self,
        record: &StructuredRecord,
        key: Option<&IdempotencyKey>,
        ctx: &CallContext,
    ) -> StoreResult<PutOutcome> {
        let subject = record.subject_id()?;
        let data_hash = record.content_hash()?;
        let key = match key {
            Some(key) => {
                let address = format!("{subject}/{}/{}", record.resource_type(), record.id());
                self.claim_key(key, &address)?;
                key.clone()
            }
            None => IdempotencyKey::derive(&subject, record.resource_type(), record.id()),
        };
        let url = self.resource_url(record.resource_type(), record.id());

        let mut current_version = 0;
        if let Some(value) = self.fetch(&url, ctx).await? {
            if let Some((version, existing)) = parse_entry(value) {
                if existing.ensure_subject(&subject).is_err() {
                    return Err(StoreError::InvalidAddress(format!(
                        "{}/{} belongs to another subject",
                        record.resource_type(),
                        record.id()
                    )));
                }
                if existing.content_hash()? == data_hash {
                    tracing::debug!(
                        correlation_id = %ctx.correlation_id,
                        resource_id = %record.id(),
                        version_id = version,
                        "idempotent put; content unchanged"
                    );
                    return Ok(PutOutcome::new(record, version, false));
                }
                current_version = version;
            }
        }

        let body = serde_json::to_vec(record).map_err(fhir::FhirError::from)?;
        let version_id =
            call_with_retry(&self.policy, CallClass::Write, "fhir update", ctx, || async {
                let response = self
                    .authorised(self.client.put(&url), ctx)
                    .header(header::CONTENT_TYPE, FHIR_JSON)
                    .header(IDEMPOTENCY_KEY_HEADER, key.as_str())
                    .body(body.clone())
                    .send()
                    .await
                    .map_err(|e| map_transport_error(e, self.policy.call_timeout))?;
                let response = check_status(response).await?;
                let from_etag = version_from_etag(&response);
                let from_body = response
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|v| version_of(&v));
                Ok::<u64, StoreError>(from_body.or(from_etag).unwrap_or(current_version + 1))
            })
            .await?;

        tracing::info!(
            correlation_id = %ctx.correlation_id,
            subject_id = %subject,
            resource_id = %record.id(),
            resource_type = %record.resource_type(),
            version_id,
            "record stored"
        );
        Ok(PutOutcome::new(record, version_id, true))
    }

    async fn get(
        &self,
        subject: &SubjectId,
        resource_type: ResourceType,
        id: &ResourceId,
        ctx: &CallContext,
    ) -> StoreResult<StructuredRecord> {
        let not_found = || StoreError::NotFound {
            resource_type,
            id: id.to_string(),
        };
        let value = self
            .fetch(&self.resource_url(resource_type, id), ctx)
            .await?
            .ok_or_else(not_found)?;
        let record = StructuredRecord::from_value(value)?;
        if record.resource_type() != resource_type || record.ensure_subject(subject).is_err() {
            return Err(not_found());
        }
        Ok(record)
    }

    async fn history(
        &self,
        subject: &SubjectId,
        resource_type: ResourceType,
        id: &ResourceId,
        ctx: &CallContext,
    ) -> StoreResult<Vec<StructuredRecord>> {
        let url = format!("{}/_history", self.resource_url(resource_type, id));
        let mut versions: Vec<(u64, StructuredRecord)> = self
            .fetch_bundle(url, &[], ctx)
            .await?
            .into_iter()
            .filter_map(parse_entry)
            .filter(|(_, record)| record.ensure_subject(subject).is_ok())
            .collect();
        if versions.is_empty() {
            return Err(StoreError::NotFound {
                resource_type,
                id: id.to_string(),
            });
        }
        versions.sort_by_key(|(version, _)| *version);
        Ok(versions.into_iter().map(|(_, record)| record).collect())
    }

    async fn list_by_subject(
        &self,
        subject: &SubjectId,
        ctx: &CallContext,
    ) -> StoreResult<RecordListing> {
        let mut records = Vec::new();
        for resource_type in ResourceType::ALL {
            records.extend(self.search(resource_type, Some(subject), ctx).await?);
        }
        Ok(RecordListing::from_records(records))
    }

    async fn list_by_type(
        &self,
        resource_type: ResourceType,
        ctx: &CallContext,
    ) -> StoreResult<RecordListing> {
        let records = self.search(resource_type, None, ctx).await?;
        Ok(RecordListing::from_records(records))
    }
}
