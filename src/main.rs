//! Drive Mirror
//!
//! Incremental backup of Drive content (user files and shared drives) into an
//! S3-compatible bucket.

mod backup;
mod config;
mod errors;
mod session;
mod source;
mod state;
mod storage;
mod utils;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::Parser;
use config::AppConfig;
use session::Session;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config.json")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides config.json
    #[arg(short, long)]
    log_level: Option<String>,

    /// Backup date tag used in destination keys (YYYY-MM-DD, default today UTC)
    #[arg(short, long, value_name = "DATE")]
    date: Option<NaiveDate>,
}

/// Main entry point for the backup run
#[tokio::main]
async fn main() -> ExitCode {
    match run_app().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Backup run failed: {:?}", e);
            eprintln!("Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let app_config = AppConfig::load_from_json(&args.config).with_context(|| {
        format!(
            "Failed to load application configuration from {}",
            args.config.display()
        )
    })?;

    let log_level = args.log_level.as_deref().unwrap_or(&app_config.log_level);
    utils::logger::init(log_level)?;
    info!("Starting drivemirror v{}", env!("CARGO_PKG_VERSION"));

    let session = Session::establish(&app_config)
        .await
        .context("Failed to establish session")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing the current batch");
            on_signal.cancel();
        }
    });

    let backup_date = args.date.unwrap_or_else(|| Utc::now().date_naive());
    let summary = backup::run_backup_flow(&app_config, &session, backup_date, &cancel)
        .await
        .context("Backup process failed")?;

    // Individual entry failures are part of a normal run and do not change the exit code.
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).context("Failed to serialize run summary")?
    );
    if summary.totals.failed > 0 {
        warn!(failed = summary.totals.failed, "Some entries could not be backed up");
    }
    Ok(())
}
