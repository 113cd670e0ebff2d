//! `metascan` -- submit metadata extraction jobs and collect their results.
//!
//! Configuration comes from the environment (see
//! [`SessionConfig::from_env`]); a `.env` file is loaded if present.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use metascan_core::entity::EntityName;
use metascan_core::metadata::{JobRequest, MetadataKind};
use metascan_core::notify::TracingSink;
use metascan_events::WsTransport;
use metascan_jobs::api::HttpJobService;
use metascan_jobs::{MetadataSession, SessionConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "metascan", about = "Metadata extraction job client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the entities the job service can inspect
    Entities,
    /// Submit an extraction job and print the merged result
    Extract {
        /// Entity API name; repeat for several (mixed scopes are split)
        #[arg(long = "entity", required = true)]
        entities: Vec<String>,
        /// Metadata kind; repeat for several
        #[arg(long = "kind", value_enum, required = true)]
        kinds: Vec<KindArg>,
        /// Stop waiting for completion events after this many seconds
        #[arg(long, default_value_t = 300)]
        wait_secs: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Field,
    ValidationRule,
    RecordType,
}

impl From<KindArg> for MetadataKind {
    fn from(arg: KindArg) -> Self {
        match arg {
            KindArg::Field => MetadataKind::Field,
            KindArg::ValidationRule => MetadataKind::ValidationRule,
            KindArg::RecordType => MetadataKind::RecordType,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "metascan=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SessionConfig::from_env().context("invalid configuration")?;

    tracing::info!(
        job_service = %config.job_service_url,
        events = %config.events_ws_url,
        channel = %config.event_channel,
        "Starting metascan",
    );

    let service = Arc::new(
        HttpJobService::with_timeout(config.job_service_url.clone(), config.request_timeout())
            .context("failed to build HTTP client")?,
    );
    let transport = Arc::new(
        WsTransport::new(config.events_ws_url.clone())
            .with_connect_timeout(config.request_timeout()),
    );
    let session = MetadataSession::new(config, service, transport, Arc::new(TracingSink));

    match cli.command {
        Command::Entities => list_entities(&session).await,
        Command::Extract {
            entities,
            kinds,
            wait_secs,
        } => extract(&session, entities, kinds, Duration::from_secs(wait_secs)).await,
    }
}

async fn list_entities(session: &MetadataSession) -> Result<()> {
    let catalog = session.catalog().await.context("failed to list entities")?;
    println!("{}", serde_json::to_string_pretty(&catalog)?);
    Ok(())
}

async fn extract(
    session: &MetadataSession,
    entities: Vec<String>,
    kinds: Vec<KindArg>,
    wait: Duration,
) -> Result<()> {
    let entities = entities
        .into_iter()
        .map(EntityName::new)
        .collect::<Result<Vec<_>, _>>()?;
    let request = JobRequest::new(entities, kinds.into_iter().map(MetadataKind::from))?;

    // Subscribe before submitting so no completion event is missed.
    session.activate().await?;

    let mut pending: usize = 0;
    for outcome in session.submit_selection(request).await {
        match outcome.result {
            Ok(job_id) => {
                tracing::info!(scope = %outcome.scope, job_id = %job_id, "Waiting for job");
                pending += 1;
            }
            Err(e) => tracing::error!(scope = %outcome.scope, error = %e, "Submission failed"),
        }
    }

    let mut updates = session.updates();
    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);

    while session.merged_count() < pending {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = &mut deadline => {
                let outstanding = pending.saturating_sub(session.merged_count());
                tracing::warn!(outstanding, "Timed out waiting for job results");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    session.deactivate().await;

    println!("{}", serde_json::to_string_pretty(&session.results())?);
    Ok(())
}
