//! Core runtime configuration.
//!
//! Configuration is resolved once at process startup and passed into core services. Nothing
//! in the request path reads process-wide environment variables, which keeps behaviour
//! consistent across threads and lets tests inject their own values.

use crate::constants::{
    DEFAULT_CALL_TIMEOUT, DEFAULT_ENGINE_BASE_URL, DEFAULT_MAX_RUN_WAIT, DEFAULT_POLL_INTERVAL,
    DEFAULT_RECORD_DATA_DIR, DEFAULT_RETRY_MAX_ATTEMPTS,
};
use crate::conversation::DriverConfig;
use crate::retry::CallPolicy;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use triage_types::DEFAULT_MAX_MESSAGE_LEN;

/// Errors raised while resolving configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("failed to initialise {component}: {reason}")]
    Backend {
        component: &'static str,
        reason: String,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// How the reasoning engine is reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineMode {
    Assistants {
        base_url: String,
        api_key: String,
        assistant_id: String,
    },
    /// In-process scripted engine, for offline development.
    Scripted,
}

/// Which record store backend is used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageMode {
    Local {
        data_dir: PathBuf,
    },
    Managed {
        base_url: String,
        access_token: Option<String>,
    },
}

/// Which ledger backend is used, if any.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerMode {
    Memory,
    Rpc {
        url: String,
        contract_address: Option<String>,
        account: Option<String>,
    },
    Disabled,
}

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    engine: EngineMode,
    storage: StorageMode,
    ledger: LedgerMode,
    poll_interval: Duration,
    max_run_wait: Duration,
    call_timeout: Duration,
    retry_max_attempts: u32,
    max_message_len: usize,
}

impl CoreConfig {
    /// Create a configuration with default timing limits.
    pub fn new(engine: EngineMode, storage: StorageMode, ledger: LedgerMode) -> Self {
        Self {
            engine,
            storage,
            ledger,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_run_wait: DEFAULT_MAX_RUN_WAIT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            retry_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        }
    }

    /// Scripted engine, local store under `data_dir`, in-memory ledger.
    pub fn offline(data_dir: impl Into<PathBuf>) -> Self {
        Self::new(
            EngineMode::Scripted,
            StorageMode::Local {
                data_dir: data_dir.into(),
            },
            LedgerMode::Memory,
        )
    }

    /// Resolve configuration from a key lookup, typically the process environment.
    ///
    /// # Arguments
    ///
    /// * `lookup` - Returns the raw value for a key, or `None` when unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when a setting required by the selected mode is unset,
    /// or [`ConfigError::Invalid`] when a value cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let engine = match get("ENGINE_MODE").as_deref().unwrap_or("assistants") {
            "assistants" => EngineMode::Assistants {
                base_url: get("ENGINE_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_ENGINE_BASE_URL.to_owned()),
                api_key: require("ENGINE_API_KEY")?,
                assistant_id: require("ENGINE_ASSISTANT_ID")?,
            },
            "scripted" => EngineMode::Scripted,
            other => return Err(invalid("ENGINE_MODE", other, "expected assistants or scripted")),
        };

        let storage = match get("STORAGE_MODE").as_deref().unwrap_or("local") {
            "local" => StorageMode::Local {
                data_dir: get("RECORD_DATA_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_RECORD_DATA_DIR)),
            },
            "managed" => StorageMode::Managed {
                base_url: require("FHIR_BASE_URL")?,
                access_token: get("FHIR_ACCESS_TOKEN"),
            },
            other => return Err(invalid("STORAGE_MODE", other, "expected local or managed")),
        };

        let ledger = match get("LEDGER_MODE").as_deref().unwrap_or("memory") {
            "memory" => LedgerMode::Memory,
            "rpc" => LedgerMode::Rpc {
                url: require("LEDGER_RPC_URL")?,
                contract_address: get("LEDGER_CONTRACT_ADDRESS"),
                account: get("LEDGER_ACCOUNT"),
            },
            "disabled" => LedgerMode::Disabled,
            other => {
                return Err(invalid(
                    "LEDGER_MODE",
                    other,
                    "expected memory, rpc or disabled",
                ))
            }
        };

        let mut cfg = Self::new(engine, storage, ledger);
        let poll_ms = get("ENGINE_POLL_INTERVAL_MS");
        if let Some(ms) = parse_positive::<u64>("ENGINE_POLL_INTERVAL_MS", poll_ms)? {
            cfg.poll_interval = Duration::from_millis(ms);
        }
        let max_wait_secs = get("ENGINE_MAX_WAIT_SECS");
        if let Some(secs) = parse_positive::<u64>("ENGINE_MAX_WAIT_SECS", max_wait_secs)? {
            cfg.max_run_wait = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_positive::<u64>("CALL_TIMEOUT_SECS", get("CALL_TIMEOUT_SECS"))? {
            cfg.call_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse_positive::<u32>("RETRY_MAX_ATTEMPTS", get("RETRY_MAX_ATTEMPTS"))? {
            cfg.retry_max_attempts = n;
        }
        if let Some(n) = parse_positive::<usize>("MAX_MESSAGE_LEN", get("MAX_MESSAGE_LEN"))? {
            cfg.max_message_len = n;
        }
        Ok(cfg)
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_run_wait(mut self, max_run_wait: Duration) -> Self {
        self.max_run_wait = max_run_wait;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn with_retry_max_attempts(mut self, attempts: u32) -> Self {
        self.retry_max_attempts = attempts.max(1);
        self
    }

    pub fn with_max_message_len(mut self, max_message_len: usize) -> Self {
        self.max_message_len = max_message_len;
        self
    }

    pub fn engine(&self) -> &EngineMode {
        &self.engine
    }

    pub fn storage(&self) -> &StorageMode {
        &self.storage
    }

    pub fn ledger(&self) -> &LedgerMode {
        &self.ledger
    }

    pub fn max_message_len(&self) -> usize {
        self.max_message_len
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Timeout and retry policy applied to every external call.
    pub fn call_policy(&self) -> CallPolicy {
        CallPolicy {
            call_timeout: self.call_timeout,
            max_attempts: self.retry_max_attempts,
            ..CallPolicy::default()
        }
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            poll_interval: self.poll_interval,
            max_run_wait: self.max_run_wait,
            calls: self.call_policy(),
        }
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: format!("{value:?}: {reason}"),
    }
}

fn parse_positive<T>(key: &'static str, value: Option<String>) -> ConfigResult<Option<T>>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let Some(raw) = value else {
        return Ok(None);
    };
    let parsed = raw
        .parse::<T>()
        .map_err(|e| invalid(key, &raw, &e.to_string()))?;
    if parsed <= T::default() {
        return Err(invalid(key, &raw, "must be greater than zero"));
    }
    Ok(Some(parsed))
}
