//! Common utilities and types for the warren HTTP tunnel
//!
//! This crate provides the wire protocol spoken over a tunnel session, the dashboard
//! data model, and utilities shared by the tunnel server and the agent.

pub mod constants;
pub mod error;
pub mod models;
pub mod protocol;
pub mod utils;
pub mod validation;

// Re-export commonly used types for convenience
pub use error::{Result, TunnelError};
pub use models::{ConnectionStatus, StatsSnapshot, TunnelUser};
pub use protocol::{BodyChunk, ErrorCode, Headers, Message, RequestFrame, ResponseFrame};
pub use utils::{
    ChunkBuffer, current_timestamp_millis, decode_body, encode_body,
    generate_connection_id, generate_secret_key, generate_subdomain, header_value,
    headers_to_map, map_to_headers,
};
