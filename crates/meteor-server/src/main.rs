//! # Meteor Server
//!
//! Bayeux publish/subscribe server over WebSocket.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! meteor
//!
//! # Run with custom config
//! meteor --config /path/to/meteor.toml
//!
//! # Run with environment variables
//! METEOR_PORT=8080 METEOR_HOST=0.0.0.0 METEOR__TRANSPORT__ASYNC_SEND_TIMEOUT_MS=500 meteor
//! ```

mod config;
mod handlers;
mod metrics;
mod processors;
mod registry;
mod timesync;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meteor=debug,meteor_core=info,meteor_transport=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match std::env::args().skip_while(|arg| arg != "--config").nth(1) {
        Some(path) => config::Config::from_file(path)?,
        None => config::Config::load()?,
    };

    tracing::info!("Starting Meteor server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
