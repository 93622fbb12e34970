//! # Relay Server
//!
//! WebSocket publish/subscribe relay.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! relay
//!
//! # Run with a specific config file (no environment overrides)
//! relay --config /path/to/relay.toml
//!
//! # Same file, with RELAY_* overrides applied
//! RELAY_CONFIG=/path/to/relay.toml relay
//!
//! # Run with environment variables
//! RELAY_PORT=8080 RELAY_HOST=0.0.0.0 RELAY_BROADCAST__CONCURRENCY=32 relay
//! ```
//!
//! Subscribers connect with `GET /subscribe`; `POST /publish` sends the
//! request body to every subscriber.

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=debug,tenvis_relay_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match config_path_arg(std::env::args()) {
        Some(path) => config::Config::from_file(path)?,
        None => config::Config::load()?,
    };

    tracing::info!(
        "Starting Relay server on {}:{} (broadcast concurrency {})",
        config.host,
        config.port,
        config.broadcast.concurrency
    );

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config, shutdown_signal()).await?;

    Ok(())
}

/// Value of `--config <path>` or `--config=<path>`, if given.
fn config_path_arg(args: impl IntoIterator<Item = String>) -> Option<String> {
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, closing subscribers");
}
