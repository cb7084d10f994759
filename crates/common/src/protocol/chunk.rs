use serde::{Deserialize, Serialize};

/// Continuation chunk of a request or response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BodyChunk {
    pub correlation_id: u64,

    /// Chunk bytes encoded in Base64
    #[serde(default)]
    pub body: String,

    /// True on the last chunk of the body
    #[serde(default)]
    pub end: bool,
}

impl BodyChunk {
    pub fn new(correlation_id: u64, body: String, end: bool) -> Self {
        Self {
            correlation_id,
            body,
            end,
        }
    }

    /// Empty chunk that only terminates the body
    pub fn terminal(correlation_id: u64) -> Self {
        Self::new(correlation_id, String::new(), true)
    }
}
