use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tracksync_storage::UpsertStore;
use tracksync_sync::SyncConfig;

#[derive(Debug, Parser)]
#[command(name = "tracksync-cli")]
#[command(about = "Sync time-tracking and issue-tracker data into Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass over every enabled entity type.
    Sync,
    /// Create the schemas and tables if they do not exist.
    Migrate,
    /// Run sync passes on TRACKSYNC_SYNC_CRON until interrupted.
    Schedule,
    /// Print stored rows of a relation as JSON.
    Show {
        /// Qualified relation name, e.g. `linear.issues`.
        relation: String,
        #[arg(long)]
        id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = tracksync_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} entities={} failed={} report={}",
                summary.run_id,
                summary.entities.len(),
                summary.failed,
                summary.report_path
            );
            if !summary.is_success() {
                bail!("{} entity sync(s) failed", summary.failed);
            }
        }
        Commands::Migrate => {
            let store = connect().await?;
            store.migrate().await.context("migrating schema")?;
            println!("schema ready: {} tables", store.tables().count());
            store.close().await;
        }
        Commands::Schedule => {
            let pipeline = Arc::new(tracksync_sync::pipeline_from_env().await?);
            let Some(mut sched) = Arc::clone(&pipeline).maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set TRACKSYNC_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
            pipeline.store().clone().close().await;
        }
        Commands::Show { relation, id } => {
            let store = connect().await?;
            let output = match id {
                Some(id) => serde_json::to_string_pretty(&store.fetch_by_id(&relation, &id).await?)?,
                None => serde_json::to_string_pretty(&store.fetch_all(&relation).await?)?,
            };
            println!("{output}");
            store.close().await;
        }
    }

    Ok(())
}

async fn connect() -> Result<UpsertStore> {
    let config = SyncConfig::from_env();
    UpsertStore::connect(&config.store_config())
        .await
        .context("connecting to the database")
}
