//! Warren tunnel server
//!
//! Listens on one address for public tunnel traffic, agent registrations and the
//! administrative API.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use warren_server::config::{Args, ServerConfig};
use warren_server::{AppState, serve};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG takes precedence over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    info!("Warren tunnel server v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_args(args)?;
    info!(
        "Tunnels served as {}",
        config.public_url("<subdomain>")
    );
    if config.require_auth {
        info!("Tunnel registration requires a secret key");
    }

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!("Listening on {}", listener.local_addr()?);

    let state = AppState::new(config)?;
    serve(listener, state).await
}
