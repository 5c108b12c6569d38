use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_rest::AppState;
use triage_core::{AssessmentOrchestrator, CoreConfig};

/// Main entry point for the triage service
///
/// Resolves configuration once, builds the engine, record store and ledger backends, and serves
/// the REST API (default port 3000, configurable via TRIAGE_REST_ADDR).
///
/// # Environment Variables
/// - `TRIAGE_REST_ADDR`: REST server address (default: "0.0.0.0:3000")
/// - `ENGINE_MODE`, `ENGINE_BASE_URL`, `ENGINE_API_KEY`, `ENGINE_ASSISTANT_ID`: reasoning engine
/// - `STORAGE_MODE`, `RECORD_DATA_DIR`, `FHIR_BASE_URL`, `FHIR_ACCESS_TOKEN`: record store
/// - `LEDGER_MODE`, `LEDGER_RPC_URL`, `LEDGER_CONTRACT_ADDRESS`, `LEDGER_ACCOUNT`: audit ledger
///
/// # Returns
/// * `Ok(())` - If the server starts and runs successfully
/// * `Err(anyhow::Error)` - If configuration is invalid or the server fails
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("triage_run=info".parse()?)
                .add_directive("triage_core=info".parse()?)
                .add_directive("api_rest=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rest_addr = std::env::var("TRIAGE_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());

    let cfg = CoreConfig::from_lookup(|key| std::env::var(key).ok())?;
    let orchestrator = AssessmentOrchestrator::from_config(&cfg)?;

    let backends = orchestrator.backends();
    tracing::info!(
        engine = %backends.engine,
        storage = backends.storage,
        ledger = backends.ledger.unwrap_or("disabled"),
        "++ Backends configured"
    );

    api_rest::serve(&rest_addr, AppState::new(orchestrator)).await
}
