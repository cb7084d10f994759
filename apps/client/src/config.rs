//! Agent configuration
//!
//! A single tunnel comes from the command line alone. Several tunnels come from a
//! TOML file listing them; the command line then picks which ones to start.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;
use url::Url;
use warren_common::constants::{
    HEARTBEAT_INTERVAL_SECS, RECONNECT_MAX_DELAY_MS, RECONNECT_MIN_DELAY_MS, RECONNECT_MULTIPLIER,
};

use crate::inspector::DEFAULT_INSPECT_ADDR;

/// Tunnel name used when the command line describes a single tunnel
pub const DEFAULT_TUNNEL_NAME: &str = "default";

/// CLI arguments for the tunnel agent
#[derive(Parser, Debug)]
#[command(name = "warren")]
#[command(about = "Expose a local HTTP service through a warren tunnel server", long_about = None)]
#[command(version)]
pub struct Args {
    /// Local port to forward requests to
    #[arg(short, long, default_value = "3000")]
    pub port: u16,

    /// Local host address
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// WebSocket registration endpoint of the tunnel server
    #[arg(
        short,
        long,
        env = "WARREN_ENDPOINT",
        default_value = "ws://localhost:8080/register"
    )]
    pub endpoint: String,

    /// Subdomain to request (random when omitted)
    #[arg(short, long, env = "WARREN_SUBDOMAIN")]
    pub subdomain: Option<String>,

    /// Tunnel user secret key
    #[arg(long, env = "WARREN_SECRET_KEY")]
    pub secret_key: Option<String>,

    /// Connection timeout in seconds
    #[arg(long, default_value = "10")]
    pub connect_timeout: u64,

    /// Request timeout in seconds
    #[arg(long, default_value = "25")]
    pub request_timeout: u64,

    /// TOML file listing several tunnels
    #[arg(short, long, env = "WARREN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Tunnels from the config file to start (all when none are named)
    #[arg(short, long = "tunnel", value_name = "NAME")]
    pub tunnels: Vec<String>,

    /// Address of the local request inspector
    #[arg(long, env = "WARREN_INSPECT_ADDR", default_value = DEFAULT_INSPECT_ADDR)]
    pub inspect_addr: String,

    /// Do not serve the request inspector
    #[arg(long)]
    pub no_inspect: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Contents of a tunnels file
///
/// ```toml
/// endpoint = "wss://tunnel.example.com/register"
/// secret_key = "..."
///
/// [[tunnels]]
/// name = "web"
/// subdomain = "my-app"
/// port = 3000
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub endpoint: Option<String>,
    pub secret_key: Option<String>,
    #[serde(default)]
    pub tunnels: Vec<TunnelEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelEntry {
    pub name: String,
    pub subdomain: Option<String>,
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl ConfigFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let file: Self = toml::from_str(content)?;
        if file.tunnels.is_empty() {
            bail!("no tunnels configured");
        }
        let mut seen = HashSet::new();
        for tunnel in &file.tunnels {
            if tunnel.name.trim().is_empty() {
                bail!("tunnel names must not be empty");
            }
            if !seen.insert(tunnel.name.as_str()) {
                bail!("tunnel {} is configured twice", tunnel.name);
            }
        }
        Ok(file)
    }

    /// The named tunnels, or every tunnel when `names` is empty
    pub fn select(&self, names: &[String]) -> Result<Vec<&TunnelEntry>> {
        if names.is_empty() {
            return Ok(self.tunnels.iter().collect());
        }
        names
            .iter()
            .map(|name| {
                self.tunnels
                    .iter()
                    .find(|t| &t.name == name)
                    .with_context(|| format!("no tunnel named {} in the config", name))
            })
            .collect()
    }
}

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct Config {
    /// Name the request log files this tunnel under
    pub name: String,

    /// Local service base URL, e.g. "http://127.0.0.1:3000"
    pub local_address: String,

    /// WebSocket registration URL
    pub websocket_url: String,

    pub subdomain: Option<String>,

    pub secret_key: Option<String>,

    pub connect_timeout: Duration,

    /// Request timeout when calling the local service
    pub request_timeout: Duration,

    pub heartbeat_interval: Duration,

    pub reconnect_config: ReconnectConfig,
}

/// Reconnection configuration with exponential backoff
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Give up after this many consecutive failures; `None` retries forever
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(RECONNECT_MIN_DELAY_MS),
            max_delay: Duration::from_millis(RECONNECT_MAX_DELAY_MS),
            multiplier: RECONNECT_MULTIPLIER,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Delay following `current`, capped at `max_delay`
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next = current.as_secs_f64() * self.multiplier;
        Duration::from_secs_f64(next.min(self.max_delay.as_secs_f64()))
    }
}

impl Config {
    /// Configuration for a local service at `local_address` and a server endpoint
    pub fn new(local_address: impl Into<String>, websocket_url: impl Into<String>) -> Self {
        Self {
            name: DEFAULT_TUNNEL_NAME.to_string(),
            local_address: local_address.into(),
            websocket_url: websocket_url.into(),
            subdomain: None,
            secret_key: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(25),
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            reconnect_config: ReconnectConfig::default(),
        }
    }

    pub fn from_args(args: &Args) -> Result<Self> {
        let mut config = Self::new(
            format!("http://{}:{}", args.host, args.port),
            websocket_url(&args.endpoint)?,
        );
        config.subdomain = normalize_subdomain(args.subdomain.as_deref());
        if let Some(subdomain) = &config.subdomain {
            config.name = subdomain.clone();
        }
        config.secret_key = args.secret_key.clone().filter(|s| !s.is_empty());
        config.connect_timeout = Duration::from_secs(args.connect_timeout);
        config.request_timeout = Duration::from_secs(args.request_timeout);
        Ok(config)
    }

    /// One configuration per tunnel to start
    ///
    /// Without `--config` that is the single tunnel the command line describes.
    /// Settings missing from the file fall back to the command line.
    pub fn load_all(args: &Args) -> Result<Vec<Self>> {
        let Some(path) = &args.config else {
            return Ok(vec![Self::from_args(args)?]);
        };
        let file = ConfigFile::load(path)?;
        Self::from_file(&file, args)
    }

    pub fn from_file(file: &ConfigFile, args: &Args) -> Result<Vec<Self>> {
        let endpoint = websocket_url(file.endpoint.as_deref().unwrap_or(&args.endpoint))?;
        let secret_key = file
            .secret_key
            .clone()
            .or_else(|| args.secret_key.clone())
            .filter(|s| !s.is_empty());

        let selected = file.select(&args.tunnels)?;
        Ok(selected
            .into_iter()
            .map(|tunnel| {
                let mut config = Self::new(
                    format!("http://{}:{}", tunnel.host, tunnel.port),
                    endpoint.clone(),
                );
                config.name = tunnel.name.clone();
                config.subdomain = normalize_subdomain(tunnel.subdomain.as_deref());
                config.secret_key = secret_key.clone();
                config.connect_timeout = Duration::from_secs(args.connect_timeout);
                config.request_timeout = Duration::from_secs(args.request_timeout);
                config
            })
            .collect())
    }
}

fn websocket_url(endpoint: &str) -> Result<String> {
    let url = Url::parse(endpoint)?;
    if !matches!(url.scheme(), "ws" | "wss") {
        bail!("endpoint must be a ws:// or wss:// URL, got {}", endpoint);
    }
    Ok(url.to_string())
}

fn normalize_subdomain(subdomain: Option<&str>) -> Option<String> {
    subdomain
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
}
