//! # banter
//!
//! Real-time chat server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! banter
//!
//! # Run with a config file at one of the default paths
//! # (banter.toml, /etc/banter/banter.toml, ~/.config/banter/banter.toml)
//! banter
//!
//! # Run with environment variables
//! BANTER_PORT=7600 BANTER_HOST=0.0.0.0 banter
//! ```

mod acceptor;
mod auth;
mod config;
mod metrics;
mod rate;

use anyhow::Result;
use auth::AnonymousAuthenticator;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "banter=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting banter server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            tracing::error!("Failed to start metrics server: {}", e);
        }
    }

    // Start the server
    acceptor::run_server(config, Arc::new(AnonymousAuthenticator::new())).await?;

    Ok(())
}
