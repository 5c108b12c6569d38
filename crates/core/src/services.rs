//! Construction of backends from configuration.
//!
//! Each backend is picked once here; nothing downstream branches on the configured mode.

use crate::config::{ConfigError, ConfigResult, CoreConfig, EngineMode, LedgerMode, StorageMode};
use crate::conversation::{AssistantsEngine, ReasoningEngine, ScriptedEngine};
use crate::ledger::{InMemoryLedger, JsonRpcLedger, LedgerClient};
use crate::records::{LocalRecordStore, ManagedRecordStore, RecordStore};
use std::sync::Arc;

/// Build the reasoning engine selected by `cfg`.
///
/// # Errors
///
/// Returns [`ConfigError::Backend`] if the HTTP client cannot be created.
pub fn build_engine(cfg: &CoreConfig) -> ConfigResult<Arc<dyn ReasoningEngine>> {
    match cfg.engine() {
        EngineMode::Assistants {
            base_url,
            api_key,
            assistant_id,
        } => {
            let engine = AssistantsEngine::new(
                base_url.as_str(),
                api_key.as_str(),
                assistant_id.as_str(),
                cfg.call_timeout(),
            )
            .map_err(|e| backend("reasoning engine", e))?;
            Ok(Arc::new(engine))
        }
        EngineMode::Scripted => Ok(Arc::new(ScriptedEngine::new())),
    }
}

/// Build the record store selected by `cfg`.
///
/// # Errors
///
/// Returns [`ConfigError::Backend`] if the HTTP client cannot be created.
pub fn build_store(cfg: &CoreConfig) -> ConfigResult<Arc<dyn RecordStore>> {
    match cfg.storage() {
        StorageMode::Local { data_dir } => Ok(Arc::new(
            LocalRecordStore::new(data_dir.clone()).with_call_timeout(cfg.call_timeout()),
        )),
        StorageMode::Managed {
            base_url,
            access_token,
        } => {
            let store =
                ManagedRecordStore::new(base_url.as_str(), access_token.clone(), cfg.call_policy())
                    .map_err(|e| backend("record store", e))?;
            Ok(Arc::new(store))
        }
    }
}

/// Build the ledger client selected by `cfg`; `None` when the ledger is disabled.
///
/// # Errors
///
/// Returns [`ConfigError::Backend`] if the HTTP client cannot be created.
pub fn build_ledger(cfg: &CoreConfig) -> ConfigResult<Option<LedgerClient>> {
    let ledger: Arc<dyn crate::ledger::Ledger> = match cfg.ledger() {
        LedgerMode::Disabled => return Ok(None),
        LedgerMode::Memory => Arc::new(InMemoryLedger::new()),
        LedgerMode::Rpc {
            url,
            contract_address,
            account,
        } => Arc::new(
            JsonRpcLedger::new(
                url.as_str(),
                contract_address.clone(),
                account.clone(),
                cfg.call_timeout(),
            )
            .map_err(|e| backend("ledger", e))?,
        ),
    };
    Ok(Some(LedgerClient::new(ledger, cfg.call_policy())))
}

fn backend(component: &'static str, err: impl std::fmt::Display) -> ConfigError {
    ConfigError::Backend {
        component,
        reason: err.to_string(),
    }
}
