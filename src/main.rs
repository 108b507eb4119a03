//! chatstate-migrate: copy a legacy JSON snapshot of bot state into the
//! relational store.
//!
//! Exit status: 0 when every category migrated, 2 when some did, 1 otherwise.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use chatstate::config::StoreConfig;
use chatstate::migrate::{self, MigrationStatus};

#[derive(Parser)]
#[command(name = "chatstate-migrate")]
#[command(about = "Migrate a bot state snapshot into PostgreSQL or libSQL")]
#[command(version)]
struct Cli {
    /// JSON config file with a top-level "database" object.
    /// Settings come from CHATSTATE_* environment variables when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Snapshot file to migrate
    #[arg(short, long)]
    snapshot: PathBuf,

    /// Target schema, overriding the configured one
    #[arg(long)]
    schema: Option<String>,

    /// Do not write empty values
    #[arg(long)]
    skip_null: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(status) => ExitCode::from(status.exit_code() as u8),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(MigrationStatus::Failure.exit_code() as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<MigrationStatus> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => StoreConfig::from_env().context("Failed to load config from environment")?,
    };
    if let Some(schema) = cli.schema {
        config.schema = schema;
    }
    config.skip_null |= cli.skip_null;

    let report = migrate::run(&config, &cli.snapshot).await?;
    println!("{report}");
    Ok(report.status())
}
