//! Assistants-style REST reasoning engine.
//!
//! Works with any service exposing the thread/message/run resource model:
//! - `POST /threads`
//! - `POST /threads/{thread}/messages`
//! - `POST /threads/{thread}/runs`
//! - `GET  /threads/{thread}/runs/{run}`
//! - `GET  /threads/{thread}/messages?order=desc&limit=10`

use super::engine::*;
use crate::constants::CORRELATION_ID_HEADER;
use crate::context::CallContext;
use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use triage_types::ThreadId;

/// Phrases the engine uses when a thread already has an active run.
const ACTIVE_RUN_MARKERS: &[&str] = &["active run", "while a run", "run is active"];

/// Reasoning engine reached over an assistants-style REST API.
pub struct AssistantsEngine {
    client: Client,
    base_url: String,
    api_key: String,
    assistant_id: String,
    request_timeout: Duration,
}

impl AssistantsEngine {
    /// Create a new engine client.
    ///
    /// `request_timeout` bounds each HTTP exchange at the transport level; the driver applies
    /// its own per-call deadline on top.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Unavailable`] if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        assistant_id: impl Into<String>,
        request_timeout: Duration,
    ) -> EngineResult<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        headers.insert("openai-beta", header::HeaderValue::from_static("assistants=v2"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(request_timeout)
            .build()
            .map_err(|e| EngineError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key: api_key.into(),
            assistant_id: assistant_id.into(),
            request_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorised(&self, builder: RequestBuilder, ctx: &CallContext) -> RequestBuilder {
        builder
            .bearer_auth(&self.api_key)
            .header(CORRELATION_ID_HEADER, ctx.correlation_id.as_str())
    }

    async fn send(&self, builder: RequestBuilder, ctx: &CallContext) -> EngineResult<Response> {
        let response = self
            .authorised(builder, ctx)
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.request_timeout))?;
        check_status(response).await
    }
}

#[derive(Deserialize)]
struct IdBody {
    id: String,
}

#[derive(Deserialize)]
struct RunBody {
    status: RunStatus,
    #[serde(default)]
    last_error: Option<RunFailure>,
}

#[derive(Deserialize)]
struct MessageList {
    data: Vec<MessageBody>,
}

#[derive(Deserialize)]
struct MessageBody {
    role: String,
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Deserialize)]
struct ContentPart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<TextPart>,
}

#[derive(Deserialize)]
struct TextPart {
    value: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<String>,
}

fn map_transport_error(err: reqwest::Error, after: Duration) -> EngineError {
    if err.is_timeout() {
        EngineError::Timeout {
            operation: "engine request",
            after,
        }
    } else if err.is_decode() {
        EngineError::Malformed(err.to_string())
    } else {
        EngineError::Unavailable(err.to_string())
    }
}

/// Map a non-success response to an [`EngineError`].
async fn check_status(response: Response) -> EngineResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let (message, code) = match serde_json::from_str::<ErrorEnvelope>(&text) {
        Ok(env) => (env.error.message, env.error.code),
        Err(_) => (text, None),
    };

    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        return Err(EngineError::Unavailable(format!("{status}: {message}")));
    }

    if matches!(
        code.as_deref(),
        Some("content_policy_violation") | Some("content_filter")
    ) {
        return Err(EngineError::SafetyFlagged(message));
    }

    let lowered = message.to_ascii_lowercase();
    if (status == StatusCode::BAD_REQUEST || status == StatusCode::CONFLICT)
        && ACTIVE_RUN_MARKERS.iter().any(|m| lowered.contains(m))
    {
        return Err(EngineError::RunActive {
            thread_id: String::new(),
        });
    }

    Err(EngineError::Rejected {
        status: status.as_u16(),
        message,
    })
}

fn with_thread(err: EngineError, thread: &ThreadId) -> EngineError {
    match err {
        EngineError::RunActive { .. } => EngineError::RunActive {
            thread_id: thread.to_string(),
        },
        other => other,
    }
}

#[async_trait]
impl ReasoningEngine for AssistantsEngine {
    fn id(&self) -> &str {
        &self.assistant_id
    }

    async fn create_thread(&self, ctx: &CallContext) -> EngineResult<ThreadId> {
        let response = self
            .send(self.client.post(self.url("/threads")).json(&json!({})), ctx)
            .await?;
        let body: IdBody = response
            .json()
            .await
            .map_err(|e| map_transport_error(e, self.request_timeout))?;
        ThreadId::new(&body.id)
            .map_err(|e| EngineError::Malformed(format!("invalid thread id from engine: {e}")))
    }

    async fn post_message(
        &self,
        thread: &ThreadId,
        message: &NewMessage,
        ctx: &CallContext,
    ) -> EngineResult<()> {
        let body = json!({
            "role": "user",
            "content": message.content,
            "metadata": message.metadata,
        });
        self.send(
            self.client
                .post(self.url(&format!("/threads/{thread}/messages")))
                .json(&body),
            ctx,
        )
        .await
        .map_err(|e| with_thread(e, thread))?;
        Ok(())
    }

    async fn start_run(&self, thread: &ThreadId, ctx: &CallContext) -> EngineResult<RunId> {
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("/threads/{thread}/runs")))
                    .json(&json!({ "assistant_id": self.assistant_id })),
                ctx,
            )
            .await
            .map_err(|e| with_thread(e, thread))?;
        let body: IdBody = response
            .json()
            .await
            .map_err(|e| map_transport_error(e, self.request_timeout))?;
        Ok(RunId(body.id))
    }

    async fn run_state(
        &self,
        thread: &ThreadId,
        run: &RunId,
        ctx: &CallContext,
    ) -> EngineResult<RunState> {
        let response = self
            .send(
                self.client
                    .get(self.url(&format!("/threads/{thread}/runs/{run}"))),
                ctx,
            )
            .await?;
        let body: RunBody = response
            .json()
            .await
            .map_err(|e| map_transport_error(e, self.request_timeout))?;
        Ok(RunState {
            status: body.status,
            last_error: body.last_error,
        })
    }

    async fn latest_assistant_message(
        &self,
        thread: &ThreadId,
        ctx: &CallContext,
    ) -> EngineResult<String> {
        let response = self
            .send(
                self.client
                    .get(self.url(&format!("/threads/{thread}/messages")))
                    .query(&[("order", "desc"), ("limit", "10")]),
                ctx,
            )
            .await?;
        let list: MessageList = response
            .json()
            .await
            .map_err(|e| map_transport_error(e, self.request_timeout))?;

        let message = list
            .data
            .into_iter()
            .find(|m| m.role == "assistant")
            .ok_or_else(|| EngineError::NoAssistantMessage {
                thread_id: thread.to_string(),
            })?;

        let text = message
            .content
            .into_iter()
            .filter(|p| p.kind == "text")
            .filter_map(|p| p.text.map(|t| t.value))
            .collect::<Vec<_>>()
            .join("\n");

        Ok(text)
    }
}
