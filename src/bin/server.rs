// Lattice event bridge - standalone ingress binary
// Run with: cargo run --bin lattice-bridge

//! # Lattice Bridge Binary
//!
//! Starts the event-bridge HTTP ingress on its own. External workers POST
//! events to `/events`; in-process subscribers are expected to be attached by
//! the supervising coordinator when it embeds the library instead, so this
//! binary is primarily useful for smoke-testing worker integrations: events
//! accumulate in per-module backlogs and `/health` reports ingress liveness.
//!
//! Configuration resolves in order: defaults, `LATTICE_BRIDGE_*` environment
//! variables (a `.env` file is honored), then command-line flags.

use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lattice::{BridgeConfig, BridgeServer, EventRouter};

/// Event-bridge ingress for Lattice workflows
#[derive(Debug, Parser)]
#[command(name = "lattice-bridge", version, about)]
struct Args {
    /// Bind host (overrides LATTICE_BRIDGE_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Bind port, 1-65535 (overrides LATTICE_BRIDGE_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Maximum accepted request body size in bytes
    #[arg(long)]
    max_body_bytes: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // A .env file is optional
    let _ = dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = BridgeConfig::from_env();
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        if port > 0 {
            config.port = port;
        } else {
            warn!("--port 0 is not a valid listen port, keeping {}", config.port);
        }
    }
    if let Some(max_body_bytes) = args.max_body_bytes {
        config.max_body_bytes = max_body_bytes;
    }

    if !config.enabled {
        info!("event bridge disabled by configuration, exiting");
        return Ok(());
    }

    info!("Starting Lattice event bridge");
    info!("Bind address: {}", config.addr());

    let router = Arc::new(EventRouter::with_defaults());
    let server = BridgeServer::new(config, router);

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for shutdown signal: {}", err);
        }
        info!("shutdown signal received");
    };

    server.run(shutdown).await?;
    info!("event bridge stopped");
    Ok(())
}
