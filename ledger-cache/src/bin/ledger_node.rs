//! Ledger node binary
//!
//! Usage: `ledger-node [config.toml]`. Without a path the configuration is
//! read from `LEDGER_*` environment variables.

use anyhow::Context;
use ledger_cache::{Config, Ledger, MaintenanceScheduler};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path).with_context(|| format!("loading {}", path))?,
        None => Config::from_env().context("loading configuration from environment")?,
    };

    tracing::info!(
        service = %config.service_name,
        provider = ?config.storage.provider,
        "Starting ledger node"
    );

    let ledger = Arc::new(Ledger::open(config).await?);
    tracing::info!(cached = ledger.cached_count(), "Ledger opened successfully");

    let scheduler = MaintenanceScheduler::new(ledger.clone());
    scheduler.start();

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down ledger node");
    scheduler.stop().await;
    ledger.shutdown().await?;
    Ok(())
}
