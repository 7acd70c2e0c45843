//! # Herald Server
//!
//! Token-gated Server-Sent Events broadcast gateway.
//!
//! ## Usage
//!
//! ```bash
//! # Run with a key from the environment
//! SSE_SECRET=$(openssl rand -hex 32) herald
//!
//! # Run with custom config
//! herald --config /path/to/herald.toml
//!
//! # Override individual settings
//! HERALD_PORT=8080 HERALD_HOST=0.0.0.0 HERALD_ISSUER__ENABLED=true herald
//! ```

mod config;
mod error;
mod handlers;
mod metrics;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "herald", version, about = "Token-gated SSE broadcast gateway")]
struct Cli {
    /// Configuration file (TOML).
    #[arg(short, long, env = "HERALD_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald=debug,herald_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load(cli.config.as_deref())?;

    tracing::info!("Starting Herald server on {}:{}", config.host, config.port);
    tracing::debug!(?config, "Loaded configuration");

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
