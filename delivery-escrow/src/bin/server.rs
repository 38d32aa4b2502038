//! Escrow ledger server binary

use anyhow::Context;
use delivery_escrow::{BalanceBook, Config, PackageLedger};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::var("ESCROW_CONFIG") {
        Ok(path) => Config::from_file(&path)
            .with_context(|| format!("Failed to load config from {}", path))?,
        Err(_) => Config::from_env().context("Failed to load config from environment")?,
    };

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        data_dir = ?config.data_dir,
        "Starting escrow ledger"
    );

    let custody = Arc::new(BalanceBook::new());
    let ledger = PackageLedger::open(config, custody.clone()).context("Failed to open ledger")?;

    let stats = ledger.stats()?;
    tracing::info!(
        packages = stats.total_packages,
        drivers = stats.total_drivers,
        events = stats.total_events,
        minimum_payment = %ledger.minimum_payment(),
        held = %custody.held(),
        "Ledger ready"
    );

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down escrow ledger");
    ledger.flush()?;
    match ledger.metrics().encode_text() {
        Ok(text) => tracing::info!(metrics = %text, "Final metrics"),
        Err(e) => tracing::warn!("Failed to encode metrics: {}", e),
    }

    Ok(())
}
