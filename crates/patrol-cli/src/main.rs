//! Patrol CLI - capture check-ins and incident reports from the terminal
//!
//! Every capture lands in the local outbox first and is delivered to the
//! ingestion API when it is reachable.

mod cli;
mod commands;
mod error;

use clap::Parser;
use patrol_core::config::ClientConfig;
use patrol_core::OperatorId;

use crate::cli::{Cli, Commands};
use crate::commands::common::{resolve_db_path, CliContext};
use crate::commands::history::run_history;
use crate::commands::report::run_report;
use crate::commands::scan::run_scan;
use crate::commands::status::run_status;
use crate::commands::sync::run_sync;
use crate::commands::watch::run_watch;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("patrol_cli=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ClientConfig::from_env()?;
    if let Some(operator) = cli.operator {
        config.operator = OperatorId::new(operator);
    }
    let db_path = resolve_db_path(cli.db_path, &config);
    let ctx = CliContext { config, db_path };

    match cli.command {
        Commands::Scan {
            tag,
            abnormal,
            notes,
            offline,
        } => run_scan(&ctx, &tag, abnormal, notes, offline).await?,
        Commands::Report {
            description,
            attachments,
            offline,
        } => run_report(&ctx, &description, &attachments, offline).await?,
        Commands::Status { json } => run_status(&ctx, json).await?,
        Commands::History { kind, limit, json } => {
            run_history(&ctx, kind.map(Into::into), limit, json).await?;
        }
        Commands::Sync { json } => run_sync(&ctx, json).await?,
        Commands::Watch => run_watch(&ctx).await?,
    }

    Ok(())
}
