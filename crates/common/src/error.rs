use thiserror::Error;

/// Error types for the HTTP tunnel system
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Identifier already registered: {0}")]
    DuplicateIdentifier(String),

    #[error("No tunnel registered for: {0}")]
    NotFound(String),

    #[error("Invalid tunnel identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Tunnel connection lost")]
    ConnectionLost,

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Local service unavailable: {0}")]
    LocalServiceUnavailable(String),

    #[error("Request entity too large: {0} bytes (max: {1})")]
    BodyTooLarge(usize, usize),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl TunnelError {
    /// Errors after which the session carrying the request can no longer be used
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, TunnelError::ConnectionLost)
    }
}

/// Type alias for Results using TunnelError
pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TunnelError::DuplicateIdentifier("test".to_string());
        assert_eq!(err.to_string(), "Identifier already registered: test");

        let err = TunnelError::Timeout;
        assert_eq!(err.to_string(), "Timeout waiting for response");

        let err = TunnelError::BodyTooLarge(20, 10);
        assert_eq!(err.to_string(), "Request entity too large: 20 bytes (max: 10)");
    }

    #[test]
    fn test_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json");
        assert!(json_err.is_err());

        let tunnel_err: TunnelError = json_err.unwrap_err().into();
        assert!(matches!(tunnel_err, TunnelError::SerializationError(_)));
    }

    #[test]
    fn test_session_fatal_errors() {
        assert!(TunnelError::ConnectionLost.is_session_fatal());
        assert!(!TunnelError::Timeout.is_session_fatal());
        assert!(!TunnelError::NotFound("abc".to_string()).is_session_fatal());
    }
}
