use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use evsched_sync::{init_workbook, maybe_build_scheduler, SyncConfig, SyncRunSummary, SyncRunner};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "evsched-cli")]
#[command(about = "Sync the event schedule into the workbook")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch both schedule pages and merge them into the workbook.
    Update {
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Write an empty workbook with the expected sheets.
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Run updates on the configured cron until interrupted.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn print_summary(summary: &SyncRunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        println!(
            "update complete: run_id={} pages={} events={} kept={} created={} updated={} unchanged={}",
            summary.run_id,
            summary.fetched_pages,
            summary.extracted_events,
            summary.kept_events,
            summary.created_rows,
            summary.updated_rows,
            summary.unchanged_rows
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Update { json: false }) {
        Commands::Update { json } => {
            let summary = SyncRunner::new(config)?.run_once().await?;
            print_summary(&summary, json)?;
        }
        Commands::Init { force } => {
            init_workbook(&config.workbook_path, force).await?;
            println!("workbook written to {}", config.workbook_path.display());
        }
        Commands::Schedule => {
            let runner = Arc::new(SyncRunner::new(config)?);
            let Some(mut sched) = maybe_build_scheduler(Arc::clone(&runner)).await? else {
                bail!("scheduler disabled; set EVSCHED_SCHEDULER_ENABLED=1 to enable it");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %runner.config().sync_cron, "scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
    }

    Ok(())
}
