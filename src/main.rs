mod cli;
mod config;
mod error;
mod pipeline;
mod pools;
mod process;
mod retry;
mod runner;
mod scripted;
mod stage;
mod state;
#[cfg(test)]
mod test_support;
mod types;
mod watcher;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use config::{PipelineConfig, SettingsFile};
use state::Ledger;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let cli = Cli::parse();

    let settings = SettingsFile::load(&cli.config)?;
    let config = PipelineConfig::resolve(settings).context("Failed to prepare stage directories")?;

    let ledger = match &config.state_file {
        Some(path) => Ledger::open(path)?,
        None => Ledger::disabled(),
    };
    if !ledger.is_enabled() {
        info!("No StateFile configured, interrupted files restart with a full retry budget");
    }

    // Set up shutdown signal handler
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Received Ctrl+C, shutting down...");
        let _ = shutdown_tx.send(());
    });

    let result = runner::run(Arc::new(config), ledger, shutdown_rx).await;

    if let Err(ref e) = result {
        error!(error = %e, "Pipeline failed");
    }

    result.map(|_| ())
}
