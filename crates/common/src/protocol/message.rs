use serde::{Deserialize, Serialize};

use super::{BodyChunk, RequestFrame, ResponseFrame};

/// All WebSocket messages are wrapped in this typed envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Control plane messages
    Ping,
    Pong,
    Ready, // Sent by the agent after connecting to request session info

    /// Session lifecycle
    ConnectionEstablished {
        session_id: String,
        public_url: String,
    },

    /// Data plane messages
    HttpRequest(RequestFrame),
    RequestBody(BodyChunk),
    HttpResponse(ResponseFrame),
    ResponseBody(BodyChunk),

    /// Error handling
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<u64>,
        code: ErrorCode,
        message: String,
    },
}

impl Message {
    /// Correlation ID of data plane and request-scoped error messages
    pub fn correlation_id(&self) -> Option<u64> {
        match self {
            Message::HttpRequest(frame) => Some(frame.correlation_id),
            Message::HttpResponse(frame) => Some(frame.correlation_id),
            Message::RequestBody(chunk) | Message::ResponseBody(chunk) => {
                Some(chunk.correlation_id)
            }
            Message::Error { correlation_id, .. } => *correlation_id,
            _ => None,
        }
    }
}

/// Error codes for tunnel operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    Timeout,
    LocalServiceUnavailable,
    DuplicateIdentifier,
    Unauthorized,
    InternalError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_pong_serialization() {
        let ping = Message::Ping;
        let json = serde_json::to_string(&ping).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);

        let pong = Message::Pong;
        let json = serde_json::to_string(&pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);

        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, Message::Pong));
    }

    #[test]
    fn test_connection_established_serialization() {
        let msg = Message::ConnectionEstablished {
            session_id: "demo".to_string(),
            public_url: "http://demo.localhost:8080".to_string(),
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"connection_established"#));
        assert!(json.contains(r#""session_id":"demo"#));

        let parsed: Message = serde_json::from_str(&json).unwrap();
        match parsed {
            Message::ConnectionEstablished { public_url, .. } => {
                assert_eq!(public_url, "http://demo.localhost:8080");
            }
            _ => panic!("Expected ConnectionEstablished"),
        }
    }

    #[test]
    fn test_http_request_serialization() {
        let request = RequestFrame::new(
            12,
            "demo".to_string(),
            "PATCH".to_string(),
            "/api/v1/users".to_string(),
            1234567890,
        );

        let msg = Message::HttpRequest(request);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"http_request"#));
        assert!(json.contains(r#""correlation_id":12"#));
        assert!(json.contains(r#""method":"PATCH"#));

        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.correlation_id(), Some(12));
    }

    #[test]
    fn test_body_chunk_messages_are_distinct() {
        let request_chunk = Message::RequestBody(BodyChunk::terminal(4));
        let response_chunk = Message::ResponseBody(BodyChunk::terminal(4));

        let request_json = serde_json::to_string(&request_chunk).unwrap();
        let response_json = serde_json::to_string(&response_chunk).unwrap();
        assert!(request_json.contains(r#""type":"request_body"#));
        assert!(response_json.contains(r#""type":"response_body"#));

        let parsed: Message = serde_json::from_str(&response_json).unwrap();
        assert!(matches!(parsed, Message::ResponseBody(ref c) if c.end));
    }

    #[test]
    fn test_error_serialization() {
        let msg = Message::Error {
            correlation_id: Some(123),
            code: ErrorCode::LocalServiceUnavailable,
            message: "connection refused".to_string(),
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"error"#));
        assert!(json.contains(r#""code":"local_service_unavailable"#));

        let parsed: Message = serde_json::from_str(&json).unwrap();
        match parsed {
            Message::Error {
                correlation_id,
                code,
                ..
            } => {
                assert_eq!(correlation_id, Some(123));
                assert_eq!(code, ErrorCode::LocalServiceUnavailable);
            }
            _ => panic!("Expected Error"),
        }
    }

    #[test]
    fn test_error_without_correlation_id() {
        let json = r#"{"type":"error","code":"duplicate_identifier","message":"taken"}"#;
        let parsed: Message = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.correlation_id(), None);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result = serde_json::from_str::<Message>(r#"{"type":"teleport"}"#);
        assert!(result.is_err());
    }
}
