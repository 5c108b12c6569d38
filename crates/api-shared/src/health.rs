use crate::dto::HealthRes;

/// Health service shared by the REST API and the CLI.
///
/// Holds the names of the backends chosen at startup, so a health check reports how the
/// service is wired as well as that it is alive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthService {
    engine: String,
    storage: String,
    ledger: Option<String>,
}

impl HealthService {
    /// Creates a new instance of HealthService.
    ///
    /// # Arguments
    /// * `engine` - Identifier of the reasoning engine backend
    /// * `storage` - Name of the record store backend
    /// * `ledger` - Name of the ledger backend, `None` when disabled
    pub fn new(
        engine: impl Into<String>,
        storage: impl Into<String>,
        ledger: Option<impl Into<String>>,
    ) -> Self {
        Self {
            engine: engine.into(),
            storage: storage.into(),
            ledger: ledger.map(Into::into),
        }
    }

    /// Check health.
    ///
    /// # Returns
    /// A `HealthRes` indicating the service is healthy, with its backends.
    pub fn check_health(&self) -> HealthRes {
        HealthRes {
            ok: true,
            message: "Triage service is alive".into(),
            engine: self.engine.clone(),
            storage: self.storage.clone(),
            ledger: self.ledger.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_health_reports_backends() {
        let res = HealthService::new("scripted", "local", Some("memory")).check_health();
        assert!(res.ok);
        assert_eq!(res.storage, "local");
        assert_eq!(res.ledger.as_deref(), Some("memory"));
    }

    #[test]
    fn test_disabled_ledger_is_absent() {
        let res = HealthService::new("assistants", "managed", None::<String>).check_health();
        assert!(res.ledger.is_none());
    }
}
