//! Settlement Node Binary
//!
//! Runs the settlement pipeline against the configured broker until
//! interrupted.

use settlement::{transport_for, ChannelSink, Config, SettlementNode, Stores};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Broadcast buffer per subscriber
const BROADCAST_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    if std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Starting settlement node");

    // Load configuration
    let config = if let Some(path) = std::env::args().nth(1) {
        info!("Loading config from: {}", path);
        Config::from_file(&path)?
    } else if let Ok(path) = std::env::var("SETTLEMENT_CONFIG") {
        info!("Loading config from: {}", path);
        Config::from_file(&path)?
    } else {
        info!("Loading config from environment variables");
        Config::from_env()?
    };

    let transport = transport_for(&config);
    let sink = Arc::new(ChannelSink::new(BROADCAST_CAPACITY));
    let node = SettlementNode::start(config, transport, Stores::in_memory(), sink).await?;

    info!("Settlement node running");

    // Wait for shutdown signal
    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
    }

    info!("Shutting down settlement node...");
    if !node.shutdown().await {
        warn!("Shutdown timed out, exiting anyway");
    }

    info!("Settlement node stopped");
    Ok(())
}
