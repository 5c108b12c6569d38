use anyhow::Context;
use api_shared::HealthService;
use clap::{Parser, Subcommand};
use fhir::{ResourceId, ResourceType};
use std::collections::BTreeMap;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use triage_core::{AssessmentOrchestrator, CallContext, CoreConfig, LedgerClient, TurnRequest};
use triage_types::SubjectId;

#[derive(Parser, Debug)]
#[command(name = "triage")]
#[command(about = "Symptom assessment pipeline CLI")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the configured backends
    Health,
    /// Send one turn and print the result as JSON
    Assess {
        /// Subject (patient) identifier
        #[arg(long)]
        subject: String,
        /// Existing conversation thread to continue
        #[arg(long)]
        thread: Option<String>,
        /// Context forwarded to the engine, as key=value (repeatable)
        #[arg(long = "context", value_parser = parse_key_value)]
        context: Vec<(String, String)>,
        /// The user's message
        message: String,
    },
    /// Read stored clinical records
    Records {
        #[command(subcommand)]
        command: RecordsCommand,
    },
    /// Inspect the audit ledger
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
}

#[derive(Subcommand, Debug)]
enum RecordsCommand {
    /// List the latest version of records for a subject or of a resource type
    List {
        #[arg(long, conflicts_with = "resource_type", required_unless_present = "resource_type")]
        subject: Option<String>,
        #[arg(long = "type")]
        resource_type: Option<String>,
    },
    /// Print the latest version of one record
    Get {
        subject: String,
        resource_type: String,
        id: String,
    },
    /// Print every stored version of one record, oldest first
    History {
        subject: String,
        resource_type: String,
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum AuditCommand {
    /// Print the audit trail of a record
    Trail { resource_id: String, owner: String },
    /// Check a content hash against the ledger
    Verify {
        resource_id: String,
        owner: String,
        /// Expected hash, `0x` followed by 64 lowercase hex digits
        hash: String,
    },
}

fn parse_key_value(arg: &str) -> Result<(String, String), String> {
    arg.split_once('=')
        .map(|(k, v)| (k.trim().to_owned(), v.to_owned()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{arg}'"))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn require_ledger(orchestrator: &AssessmentOrchestrator) -> anyhow::Result<&LedgerClient> {
    orchestrator
        .ledger()
        .context("ledger is disabled (LEDGER_MODE=disabled)")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Logs go to stderr so JSON output on stdout stays parseable.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("triage_core=warn".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let Some(command) = cli.command else {
        println!("Use 'triage --help' for commands");
        return Ok(());
    };

    let cfg = CoreConfig::from_lookup(|key| std::env::var(key).ok())?;
    let orchestrator = AssessmentOrchestrator::from_config(&cfg)?;
    let ctx = CallContext::detached();

    match command {
        Commands::Health => {
            let backends = orchestrator.backends();
            let health = HealthService::new(backends.engine, backends.storage, backends.ledger);
            print_json(&health.check_health())?;
        }
        Commands::Assess {
            subject,
            thread,
            context,
            message,
        } => {
            let turn = TurnRequest {
                message,
                thread_id: thread,
                subject_id: subject,
                user_context: (!context.is_empty())
                    .then(|| context.into_iter().collect::<BTreeMap<_, _>>()),
            };
            let result = orchestrator.assess(turn, &ctx).await?;
            eprintln!("thread: {}", result.thread_id);
            println!("{}", result.reply_text);
            eprintln!("status: {}", result.completion_status);
            if let Some(resources) = &result.resources {
                print_json(resources)?;
            }
            if let Some(receipt) = &result.ledger_receipt {
                print_json(receipt)?;
            }
            if let Some(error) = &result.ledger_error {
                eprintln!("ledger: {error}");
            }
        }
        Commands::Records { command } => match command {
            RecordsCommand::List {
                subject,
                resource_type,
            } => {
                let listing = match (subject, resource_type) {
                    (Some(subject), _) => {
                        orchestrator
                            .store()
                            .list_by_subject(&SubjectId::new(subject)?, &ctx)
                            .await?
                    }
                    (None, Some(resource_type)) => {
                        orchestrator
                            .store()
                            .list_by_type(resource_type.parse::<ResourceType>()?, &ctx)
                            .await?
                    }
                    (None, None) => anyhow::bail!("either --subject or --type is required"),
                };
                print_json(&listing)?;
            }
            RecordsCommand::Get {
                subject,
                resource_type,
                id,
            } => {
                let record = orchestrator
                    .store()
                    .get(
                        &SubjectId::new(subject)?,
                        resource_type.parse()?,
                        &ResourceId::parse(&id)?,
                        &ctx,
                    )
                    .await?;
                print_json(&record)?;
            }
            RecordsCommand::History {
                subject,
                resource_type,
                id,
            } => {
                let versions = orchestrator
                    .store()
                    .history(
                        &SubjectId::new(subject)?,
                        resource_type.parse()?,
                        &ResourceId::parse(&id)?,
                        &ctx,
                    )
                    .await?;
                print_json(&versions)?;
            }
        },
        Commands::Audit { command } => {
            let ledger = require_ledger(&orchestrator)?;
            match command {
                AuditCommand::Trail { resource_id, owner } => {
                    let trail = ledger
                        .get_audit_trail(&resource_id, &SubjectId::new(owner)?, &ctx)
                        .await?;
                    print_json(&trail)?;
                }
                AuditCommand::Verify {
                    resource_id,
                    owner,
                    hash,
                } => {
                    let verified = ledger
                        .verify_integrity(&resource_id, &SubjectId::new(owner)?, &hash, &ctx)
                        .await?;
                    println!("{}", if verified { "verified" } else { "mismatch" });
                    if !verified {
                        std::process::exit(1);
                    }
                }
            }
        }
    }

    Ok(())
}
