use serde::{Deserialize, Serialize};

use super::Headers;

/// Head of the response from the local service, sent back through the tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// Must match the correlation_id from the corresponding RequestFrame
    pub correlation_id: u64,

    /// HTTP status code (200, 302, 404, 500, etc.)
    pub status_code: u16,

    /// Response headers as a map of lowercased header name to list of values
    pub headers: Headers,

    /// First (or only) body chunk encoded in Base64
    #[serde(default)]
    pub body: String,

    /// Terminal marker: true when no `response_body` frames follow
    #[serde(default = "default_end")]
    pub end: bool,

    /// Processing time in milliseconds (local service response time)
    #[serde(default)]
    pub processing_time_ms: u64,
}

fn default_end() -> bool {
    true
}

impl ResponseFrame {
    /// Create a new, complete response frame without headers or body
    pub fn new(correlation_id: u64, status_code: u16) -> Self {
        Self {
            correlation_id,
            status_code,
            headers: Headers::new(),
            body: String::new(),
            end: true,
            processing_time_ms: 0,
        }
    }

    /// Check if the frame carries body bytes
    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }
}
