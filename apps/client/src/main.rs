use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, info_span};
use tracing_subscriber::EnvFilter;
use warren_client::{Args, Config, ConnectionManager, RequestLog, inspector};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    info!("Warren tunnel agent v{}", env!("CARGO_PKG_VERSION"));
    let configs = Config::load_all(&args)?;
    for config in &configs {
        info!(
            "Tunnel {}: {} via {}",
            config.name, config.local_address, config.websocket_url
        );
    }

    let log = RequestLog::default();
    if !args.no_inspect {
        let listener = TcpListener::bind(&args.inspect_addr).await?;
        let log = log.clone();
        tokio::spawn(async move {
            if let Err(e) = inspector::serve(listener, log).await {
                error!("Request inspector stopped: {}", e);
            }
        });
    }

    let mut managers = JoinSet::new();
    for config in configs {
        let manager = ConnectionManager::new(config).with_request_log(log.clone());
        let span = info_span!("tunnel", id = %manager.name());
        managers.spawn(async move { manager.run().await }.instrument(span));
    }

    // Run until interrupted or every tunnel has given up
    tokio::select! {
        result = wait_all(&mut managers) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down gracefully...");
            Ok(())
        }
    }
}

/// Wait for every connection manager, returning the last failure
async fn wait_all(managers: &mut JoinSet<Result<()>>) -> Result<()> {
    let mut failure = None;
    while let Some(joined) = managers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Connection manager exited: {}", e);
                failure = Some(e);
            }
            Err(e) => error!("Connection manager task failed: {}", e),
        }
    }
    failure.map_or(Ok(()), Err)
}
