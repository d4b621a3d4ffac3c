//! snapferry - EBS snapshot to S3 migration

use anyhow::Result;
use clap::Parser;
use snapferry_cli::{Cli, Commands};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Migrate {
            opts,
            all,
            snapshot_ids,
        } => snapferry_cli::commands::migrate::execute(opts, all, snapshot_ids).await,
        Commands::Validate {
            opts,
            all,
            snapshot_ids,
        } => snapferry_cli::commands::validate::execute(opts, all, snapshot_ids).await,
    }
}
