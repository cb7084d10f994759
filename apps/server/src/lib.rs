//! Warren tunnel server
//!
//! One listener serves three kinds of traffic, told apart by the Host header:
//! requests for `<id>.<domain>` are forwarded into the tunnel registered as `<id>`,
//! everything else reaches the administrative API, including the WebSocket endpoint
//! agents use to register tunnels.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{Request, State};
use axum::http::header::HOST;
use axum::middleware::{self, Next};
use axum::response::Response;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use warren_common::TunnelError;
use warren_common::validation::validate_subdomain;

pub mod config;
pub mod error_handling;
pub mod handlers;
pub mod multiplexer;
pub mod registry;
pub mod sampler;
pub mod stats;
pub mod users;

use config::ServerConfig;
use error_handling::tunnel_error_response;
use registry::SessionRegistry;
use sampler::{ResourceSampler, SystemSampler};
use stats::{RetentionPolicy, StatsAggregator};
use users::{MemoryUserStore, UserStore};

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<SessionRegistry>,
    pub stats: Arc<StatsAggregator>,
    pub users: Arc<dyn UserStore>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl AppState {
    /// State with the in-memory user store and the system resource sampler
    pub fn new(config: ServerConfig) -> Result<Self> {
        Self::with_parts(
            config,
            Arc::new(MemoryUserStore::new()),
            Arc::new(SystemSampler::default()),
        )
    }

    pub fn with_parts(
        config: ServerConfig,
        users: Arc<dyn UserStore>,
        sampler: Arc<dyn ResourceSampler>,
    ) -> Result<Self> {
        for seed in &config.users {
            users
                .create_with_secret(&seed.email, &seed.secret_key)
                .with_context(|| format!("failed to seed tunnel user {}", seed.email))?;
        }

        let stats = StatsAggregator::new(
            sampler,
            RetentionPolicy {
                max_age: config.status_retention,
                max_closed_entries: config.max_closed_entries,
            },
        );
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(SessionRegistry::new()),
            stats: Arc::new(stats),
            users,
            shutdown: Arc::new(shutdown),
        })
    }

    /// Receiver that observes `true` once shutdown starts
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Ask every session and background task to stop
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Routing identifier for a Host header value
///
/// `None` when the host does not belong to the tunnel domain (admin traffic);
/// otherwise the subdomain in front of the domain, which must be a valid identifier.
pub fn tunnel_identifier(host: &str, domain: &str) -> Option<Result<String, TunnelError>> {
    let host = strip_port(host).trim_end_matches('.').to_ascii_lowercase();
    let prefix = host.strip_suffix(domain)?.strip_suffix('.')?;

    Some(
        validate_subdomain(prefix)
            .map(|_| prefix.to_string())
            .map_err(|e| TunnelError::InvalidIdentifier(e.to_string())),
    )
}

fn strip_port(host: &str) -> &str {
    // Bracketed IPv6 literals keep their colons
    if let Some(end) = host.find(']') {
        return &host[..=end];
    }
    host.split(':').next().unwrap_or(host)
}

fn request_host(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().host())
}

/// Send tunnel-host requests to the forwarding handler, the rest down the admin router
async fn route_by_host(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let identifier = request_host(&request)
        .and_then(|host| tunnel_identifier(host, &state.config.domain));

    match identifier {
        None => next.run(request).await,
        Some(Ok(id)) => handlers::forward_request(state, id, request).await,
        Some(Err(e)) => tunnel_error_response(&e),
    }
}

/// Build the complete application router
pub fn build_router(state: AppState) -> Router {
    let admin = handlers::admin_router(state.clone());

    Router::new()
        .fallback_service(admin)
        .layer(middleware::from_fn_with_state(state, route_by_host))
}

/// Serve until `signal` resolves, then close every session
pub async fn serve_with_shutdown<F>(listener: TcpListener, state: AppState, signal: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let cleanup = tokio::spawn(handlers::run_cleanup(state.clone()));
    let app = build_router(state.clone());

    let shutdown_state = state.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            signal.await;
            info!("Shutting down, closing tunnels");
            shutdown_state.begin_shutdown();
        })
        .await
        .context("server error");

    state.begin_shutdown();
    for session in state.registry.close_all().await {
        warn!("Tunnel {} still registered at shutdown", session.id());
    }
    cleanup.abort();
    result
}

/// Serve until the process receives Ctrl-C
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    serve_with_shutdown(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await
}
