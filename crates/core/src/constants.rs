//! Constants used throughout the triage core crate.
//!
//! Defaults for configuration values live here so the binary, the CLI and tests agree on them.

use std::time::Duration;

/// Default directory for the local record store when no explicit directory is configured.
pub const DEFAULT_RECORD_DATA_DIR: &str = "record_data";

/// Directory (under the record data dir) holding the idempotency index.
pub const IDEMPOTENCY_DIR_NAME: &str = ".idempotency";

/// Default reasoning engine endpoint (assistants-style REST API).
pub const DEFAULT_ENGINE_BASE_URL: &str = "https://api.openai.com/v1";

/// Default interval between run status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default upper bound on waiting for a single run to reach a terminal state.
pub const DEFAULT_MAX_RUN_WAIT: Duration = Duration::from_secs(60);

/// Default timeout applied to every individual external call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of attempts (initial call included) for retryable calls.
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;

/// Upper bound on Bundle pages followed by the managed store when listing.
pub const MAX_BUNDLE_PAGES: usize = 50;

/// Header carrying the idempotency key on store writes.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Header carrying the correlation id on every outbound call.
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-Id";

/// Metadata entries the engine accepts on one message.
pub const MAX_MESSAGE_METADATA_ENTRIES: usize = 16;

/// Metadata key carrying the subject id on posted messages. Reserved in user context.
pub const SUBJECT_METADATA_KEY: &str = "subject_id";

/// Maximum number of entries accepted in a caller-supplied user context. One metadata slot is
/// taken by [`SUBJECT_METADATA_KEY`].
pub const MAX_USER_CONTEXT_ENTRIES: usize = MAX_MESSAGE_METADATA_ENTRIES - 1;

/// Maximum key length in a caller-supplied user context.
pub const MAX_USER_CONTEXT_KEY_LEN: usize = 64;

/// Maximum value length in a caller-supplied user context.
pub const MAX_USER_CONTEXT_VALUE_LEN: usize = 512;
