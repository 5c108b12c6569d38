//! JSON-RPC 2.0 ledger backend.
//!
//! Talks to a gateway that fronts the deployed audit contract and handles signing. Methods:
//!
//! | Method                | Params                                        | Result            |
//! |-----------------------|-----------------------------------------------|-------------------|
//! | `ledger_createRecord` | `resourceId`, `dataHash`, `owner`             | `TxReceipt`       |
//! | `ledger_updateRecord` | `resourceId`, `dataHash`, `owner`             | `TxReceipt`       |
//! | `ledger_getRecord`    | `resourceId`, `owner`                         | record or `null`  |
//! | `ledger_recordExists` | `resourceId`, `owner`                         | `bool`            |
//! | `ledger_getEvents`    | `event`, `resourceId`, `owner`                | raw event array   |
//!
//! Every call also carries `contract` and `from` when configured.

use super::{AuditEventKind, Ledger, LedgerError, LedgerResult, OnChainRecord, TxReceipt};
use crate::constants::CORRELATION_ID_HEADER;
use crate::context::CallContext;
use async_trait::async_trait;
use fhir::ContentHash;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// JSON-RPC "limit exceeded", used by gateways for rate limiting.
const RPC_LIMIT_EXCEEDED: i64 = -32005;

#[derive(Debug, Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: &'a Value,
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Ledger reached through a JSON-RPC gateway.
pub struct JsonRpcLedger {
    client: Client,
    url: String,
    contract_address: Option<String>,
    account: Option<String>,
    request_timeout: Duration,
    next_id: AtomicU64,
}

impl JsonRpcLedger {
    /// # Errors
    ///
    /// Returns [`LedgerError::Unavailable`] if the HTTP client cannot be built.
    pub fn new(
        url: impl Into<String>,
        contract_address: Option<String>,
        account: Option<String>,
        request_timeout: Duration,
    ) -> LedgerResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LedgerError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            contract_address,
            account,
            request_timeout,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        mut params: Value,
        ctx: &CallContext,
    ) -> LedgerResult<T> {
        if let Some(obj) = params.as_object_mut() {
            if let Some(contract) = &self.contract_address {
                obj.insert("contract".into(), json!(contract));
            }
            if let Some(account) = &self.account {
                obj.insert("from".into(), json!(account));
            }
        }
        let request = Request {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params: &params,
        };

        let response = self
            .client
            .post(&self.url)
            .header(CORRELATION_ID_HEADER, ctx.correlation_id.as_str())
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e, method))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(LedgerError::Unavailable(format!("{method}: HTTP {status}")));
        }
        if !status.is_success() {
            return Err(LedgerError::Rejected {
                code: i64::from(status.as_u16()),
                message: format!("{method}: HTTP {status}"),
            });
        }

        let body: Response = response
            .json()
            .await
            .map_err(|e| self.map_transport_error(e, method))?;
        if let Some(err) = body.error {
            return Err(map_rpc_error(err));
        }
        serde_json::from_value(body.result.unwrap_or(Value::Null))
            .map_err(|e| LedgerError::Malformed(format!("{method}: {e}")))
    }

    fn map_transport_error(&self, err: reqwest::Error, operation: &'static str) -> LedgerError {
        if err.is_timeout() {
            LedgerError::Timeout {
                operation,
                after: self.request_timeout,
            }
        } else if err.is_decode() {
            LedgerError::Malformed(format!("{operation}: {err}"))
        } else {
            LedgerError::Unavailable(format!("{operation}: {err}"))
        }
    }
}

fn map_rpc_error(err: RpcError) -> LedgerError {
    let lowered = err.message.to_ascii_lowercase();
    if err.code == RPC_LIMIT_EXCEEDED {
        return LedgerError::Unavailable(err.message);
    }
    if lowered.contains("already exists") {
        return LedgerError::AlreadyExists {
            resource_id: err.message,
        };
    }
    if lowered.contains("does not exist") || lowered.contains("not found") {
        return LedgerError::NotFound {
            resource_id: err.message,
        };
    }
    LedgerError::Rejected {
        code: err.code,
        message: err.message,
    }
}

#[async_trait]
impl Ledger for JsonRpcLedger {
    fn backend(&self) -> &'static str {
        "rpc"
    }

    async fn create_record(
        &self,
        resource_id: &str,
        data_hash: &ContentHash,
        owner: &str,
        ctx: &CallContext,
    ) -> LedgerResult<TxReceipt> {
        self.call(
            "ledger_createRecord",
            json!({ "resourceId": resource_id, "dataHash": data_hash, "owner": owner }),
            ctx,
        )
        .await
    }

    async fn update_record(
        &self,
        resource_id: &str,
        data_hash: &ContentHash,
        owner: &str,
        ctx: &CallContext,
    ) -> LedgerResult<TxReceipt> {
        self.call(
            "ledger_updateRecord",
            json!({ "resourceId": resource_id, "dataHash": data_hash, "owner": owner }),
            ctx,
        )
        .await
    }

    async fn get_record(
        &self,
        resource_id: &str,
        owner: &str,
        ctx: &CallContext,
    ) -> LedgerResult<Option<OnChainRecord>> {
        self.call(
            "ledger_getRecord",
            json!({ "resourceId": resource_id, "owner": owner }),
            ctx,
        )
        .await
    }

    async fn record_exists(
        &self,
        resource_id: &str,
        owner: &str,
        ctx: &CallContext,
    ) -> LedgerResult<bool> {
        self.call(
            "ledger_recordExists",
            json!({ "resourceId": resource_id, "owner": owner }),
            ctx,
        )
        .await
    }

    async fn query_events(
        &self,
        kind: AuditEventKind,
        resource_id: &str,
        owner: &str,
        ctx: &CallContext,
    ) -> LedgerResult<Vec<Value>> {
        self.call(
            "ledger_getEvents",
            json!({ "event": kind.event_name(), "resourceId": resource_id, "owner": owner }),
            ctx,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ledger(server: &MockServer) -> JsonRpcLedger {
        JsonRpcLedger::new(
            server.uri(),
            Some("0xcontract".into()),
            Some("0xaccount".into()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_record_sends_contract_call() {
        let server = MockServer::start().await;
        let hash = ContentHash::of_bytes(b"record");
        Mock::given(method("POST"))
            .and(header("x-correlation-id", "corr-1"))
            .and(body_partial_json(json!({
                "jsonrpc": "2.0",
                "method": "ledger_createRecord",
                "params": {
                    "resourceId": "obs-1",
                    "dataHash": hash.as_str(),
                    "owner": "patient-abc",
                    "contract": "0xcontract",
                    "from": "0xaccount"
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {"transactionHash": "0xtx", "blockNumber": 42}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = CallContext::new(triage_types::CorrelationId::from_header_or_generate(Some(
            "corr-1",
        )));
        let receipt = ledger(&server)
            .create_record("obs-1", &hash, "patient-abc", &ctx)
            .await
            .unwrap();
        assert_eq!(
            receipt,
            TxReceipt {
                transaction_hash: "0xtx".into(),
                block_number: 42
            }
        );
    }

    #[tokio::test]
    async fn test_get_record_null_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "ledger_getRecord"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": null})),
            )
            .mount(&server)
            .await;

        let record = ledger(&server)
            .get_record("obs-1", "patient-abc", &CallContext::detached())
            .await
            .unwrap();
        assert!(record.is_none());
    }

    #[tokio::test]
    async fn test_rpc_errors_are_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "ledger_createRecord"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": 3, "message": "execution reverted: record already exists"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "ledger_updateRecord"})))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let ctx = CallContext::detached();
        let hash = ContentHash::of_bytes(b"x");
        let l = ledger(&server);

        let err = l.create_record("obs-1", &hash, "p", &ctx).await.unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyExists { .. }));

        let err = l.update_record("obs-1", &hash, "p", &ctx).await.unwrap_err();
        assert!(matches!(err, LedgerError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_get_events_returns_raw_values() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "method": "ledger_getEvents",
                "params": {"event": "RecordUpdated"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": [{"event": "RecordUpdated"}, {"garbage": true}]
            })))
            .mount(&server)
            .await;

        let events = ledger(&server)
            .query_events(
                AuditEventKind::Updated,
                "obs-1",
                "patient-abc",
                &CallContext::detached(),
            )
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
    }
}
