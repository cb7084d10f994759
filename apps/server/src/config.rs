//! Server configuration
//!
//! Command line arguments (with `WARREN_` environment fallbacks) are parsed by clap and
//! converted into a plain [`ServerConfig`] that the rest of the server reads.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use warren_common::constants::{
    CLEANUP_INTERVAL_SECS, MAX_BODY_SIZE_BYTES, MAX_CLOSED_STATUS_ENTRIES, MAX_MALFORMED_FRAMES,
    REQUEST_TIMEOUT_SECS, SESSION_IDLE_TIMEOUT_SECS, STATUS_RETENTION_SECS,
};

/// CLI arguments for the tunnel server
#[derive(Parser, Debug)]
#[command(name = "warren-server")]
#[command(about = "Reverse HTTP tunnel server", long_about = None)]
#[command(version)]
pub struct Args {
    /// Address to listen on for public, admin and registration traffic
    #[arg(short, long, env = "WARREN_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Public domain; requests for `<id>.<domain>` are routed into tunnels
    #[arg(short, long, env = "WARREN_DOMAIN", default_value = "localhost")]
    pub domain: String,

    /// Scheme used when announcing public URLs to agents
    #[arg(long, env = "WARREN_PUBLIC_SCHEME", default_value = "http")]
    pub public_scheme: String,

    /// Port appended to announced public URLs (omitted when unset)
    #[arg(long, env = "WARREN_PUBLIC_PORT")]
    pub public_port: Option<u16>,

    /// Seconds to wait for an agent response before answering 504
    #[arg(long, env = "WARREN_REQUEST_TIMEOUT", default_value_t = REQUEST_TIMEOUT_SECS)]
    pub request_timeout: u64,

    /// Seconds without any frame from an agent before its session is closed
    #[arg(long, env = "WARREN_IDLE_TIMEOUT", default_value_t = SESSION_IDLE_TIMEOUT_SECS)]
    pub idle_timeout: u64,

    /// Consecutive unparseable frames tolerated before a session is closed
    #[arg(long, env = "WARREN_MAX_MALFORMED_FRAMES", default_value_t = MAX_MALFORMED_FRAMES)]
    pub max_malformed_frames: u32,

    /// Largest public request body relayed into a tunnel, in bytes
    #[arg(long, env = "WARREN_MAX_BODY_SIZE", default_value_t = MAX_BODY_SIZE_BYTES)]
    pub max_body_size: usize,

    /// Reject tunnel registrations without a known secret key
    #[arg(long, env = "WARREN_REQUIRE_AUTH")]
    pub require_auth: bool,

    /// Bearer token protecting /api/v1 (open when unset)
    #[arg(long, env = "WARREN_ADMIN_TOKEN")]
    pub admin_token: Option<String>,

    /// Seconds a closed session stays visible in the dashboard
    #[arg(long, env = "WARREN_STATUS_RETENTION", default_value_t = STATUS_RETENTION_SECS)]
    pub status_retention: u64,

    /// Closed sessions kept in the dashboard before the oldest are evicted
    #[arg(long, env = "WARREN_MAX_CLOSED_ENTRIES", default_value_t = MAX_CLOSED_STATUS_ENTRIES)]
    pub max_closed_entries: usize,

    /// Seconds between purges of expired dashboard entries
    #[arg(long, env = "WARREN_CLEANUP_INTERVAL", default_value_t = CLEANUP_INTERVAL_SECS)]
    pub cleanup_interval: u64,

    /// Seed a tunnel user as `email:secret` (repeatable)
    #[arg(long = "user", value_name = "EMAIL:SECRET")]
    pub users: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// A tunnel user created at start-up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedUser {
    pub email: String,
    pub secret_key: String,
}

impl SeedUser {
    /// Parse `email:secret`; the email may not contain `:` but the secret may
    pub fn parse(value: &str) -> Result<Self> {
        let (email, secret_key) = value
            .split_once(':')
            .ok_or_else(|| anyhow!("expected EMAIL:SECRET, got `{}`", value))?;
        if email.is_empty() || secret_key.is_empty() {
            return Err(anyhow!("expected EMAIL:SECRET, got `{}`", value));
        }
        Ok(Self {
            email: email.to_string(),
            secret_key: secret_key.to_string(),
        })
    }
}

/// Configuration for the tunnel server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,

    /// Lowercase public domain without port
    pub domain: String,

    pub public_scheme: String,

    pub public_port: Option<u16>,

    /// Deadline for forwarding a request and receiving its response head
    pub request_timeout: Duration,

    pub idle_timeout: Duration,

    pub max_malformed_frames: u32,

    pub max_body_size: usize,

    pub require_auth: bool,

    pub admin_token: Option<String>,

    pub status_retention: Duration,

    pub max_closed_entries: usize,

    pub cleanup_interval: Duration,

    pub users: Vec<SeedUser>,
}

impl ServerConfig {
    pub fn from_args(args: Args) -> Result<Self> {
        let users = args
            .users
            .iter()
            .map(|u| SeedUser::parse(u))
            .collect::<Result<Vec<_>>>()
            .context("invalid --user value")?;

        Ok(Self {
            listen_addr: args.listen,
            domain: args.domain.trim_matches('.').to_ascii_lowercase(),
            public_scheme: args.public_scheme,
            public_port: args.public_port,
            request_timeout: Duration::from_secs(args.request_timeout),
            idle_timeout: Duration::from_secs(args.idle_timeout),
            max_malformed_frames: args.max_malformed_frames,
            max_body_size: args.max_body_size,
            require_auth: args.require_auth,
            admin_token: args.admin_token.filter(|t| !t.is_empty()),
            status_retention: Duration::from_secs(args.status_retention),
            max_closed_entries: args.max_closed_entries,
            cleanup_interval: Duration::from_secs(args.cleanup_interval),
            users,
        })
    }

    /// Public URL announced to the agent that registered `identifier`
    pub fn public_url(&self, identifier: &str) -> String {
        match self.public_port {
            Some(port) => format!(
                "{}://{}.{}:{}",
                self.public_scheme, identifier, self.domain, port
            ),
            None => format!("{}://{}.{}", self.public_scheme, identifier, self.domain),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            domain: "localhost".to_string(),
            public_scheme: "http".to_string(),
            public_port: None,
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(SESSION_IDLE_TIMEOUT_SECS),
            max_malformed_frames: MAX_MALFORMED_FRAMES,
            max_body_size: MAX_BODY_SIZE_BYTES,
            require_auth: false,
            admin_token: None,
            status_retention: Duration::from_secs(STATUS_RETENTION_SECS),
            max_closed_entries: MAX_CLOSED_STATUS_ENTRIES,
            cleanup_interval: Duration::from_secs(CLEANUP_INTERVAL_SECS),
            users: Vec::new(),
        }
    }
}
