use serde::{Deserialize, Serialize};

use super::Headers;

/// Head of an HTTP request forwarded from the public endpoint to the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Correlates this request with its response frames within the session
    pub correlation_id: u64,

    /// Identifier of the session the request was routed to
    pub session_id: String,

    /// HTTP method, passed through untranslated (GET, POST, PUT, PATCH, DELETE, ...)
    pub method: String,

    /// Request URI including path and query string
    /// Example: "/api/v1/users?limit=10"
    pub uri: String,

    /// Lowercased header names mapped to their values in arrival order
    pub headers: Headers,

    /// First (or only) body chunk encoded in Base64
    /// Empty string for requests without body
    #[serde(default)]
    pub body: String,

    /// True when `body` holds the complete request body
    #[serde(default = "default_end")]
    pub end: bool,

    /// Timestamp when request was received (Unix epoch in milliseconds)
    pub timestamp: u64,
}

fn default_end() -> bool {
    true
}

impl RequestFrame {
    /// Create a new request frame without headers or body
    pub fn new(
        correlation_id: u64,
        session_id: String,
        method: String,
        uri: String,
        timestamp: u64,
    ) -> Self {
        Self {
            correlation_id,
            session_id,
            method,
            uri,
            headers: Headers::new(),
            body: String::new(),
            end: true,
            timestamp,
        }
    }

    /// Check if the frame carries body bytes
    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }
}
