//! Warren tunnel agent
//!
//! Keeps a WebSocket open to a warren server, registers a subdomain on it, and serves
//! the requests the server routes into the tunnel from a local HTTP service. One
//! agent can run several tunnels from a config file and keeps a short history of
//! each tunnel's requests for local inspection.

pub mod config;
pub mod connection;
pub mod forwarder;
pub mod inspector;

pub use config::{Args, Config, ConfigFile, ReconnectConfig, TunnelEntry};
pub use connection::{ConnectionManager, ConnectionState};
pub use inspector::{Exchange, RequestLog};
