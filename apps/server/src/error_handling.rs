//! Error handling and sanitization
//!
//! Tunnel failures are translated into HTTP responses here and nowhere else. Each
//! response carries a JSON `{"error": ...}` body and, for failures of the tunnel
//! itself, an `x-tunnel-error` header so callers can tell them apart from errors
//! produced by the upstream application. Messages that could leak internal details
//! are logged in full and replaced with a generic one.

use std::fmt::Display;

use axum::Json;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{error, warn};
use warren_common::TunnelError;
use warren_common::constants::TUNNEL_ERROR_HEADER;

/// Sanitize error messages for client responses
///
/// Logs the full error internally but returns a generic message to the client
/// to prevent information disclosure of internal implementation details.
///
/// # Examples
///
/// ```
/// use warren_server::error_handling::sanitize_error;
///
/// let sanitized = sanitize_error(&"queue for session 7f3a closed (correlation 12)");
/// assert_eq!(sanitized, "Internal server error");
/// ```
pub fn sanitize_error(e: &dyn Display) -> String {
    error!("Internal error: {}", e);
    "Internal server error".to_string()
}

/// Sanitize error with a custom client message
pub fn sanitize_error_with_message(e: &dyn Display, client_message: &str) -> String {
    error!("Error ({}): {}", client_message, e);
    client_message.to_string()
}

/// Errors whose message is safe to show to a public caller
pub fn is_safe_error(e: &TunnelError) -> bool {
    matches!(
        e,
        TunnelError::NotFound(_)
            | TunnelError::InvalidIdentifier(_)
            | TunnelError::Timeout
            | TunnelError::ConnectionLost
            | TunnelError::BodyTooLarge(_, _)
    )
}

/// Get a user-friendly error message
///
/// Returns the actual error message if it's safe, otherwise a sanitized version
pub fn get_client_error_message(e: &TunnelError) -> String {
    if is_safe_error(e) {
        warn!("Client error: {}", e);
        e.to_string()
    } else if let TunnelError::LocalServiceUnavailable(_) = e {
        sanitize_error_with_message(e, "Upstream service unavailable")
    } else {
        sanitize_error(e)
    }
}

/// HTTP status and failure class for a tunnel error
pub fn error_status(e: &TunnelError) -> (StatusCode, Option<&'static str>) {
    match e {
        TunnelError::NotFound(_) => (StatusCode::BAD_GATEWAY, Some("tunnel_not_found")),
        TunnelError::InvalidIdentifier(_) => (StatusCode::BAD_REQUEST, None),
        TunnelError::Timeout => (StatusCode::GATEWAY_TIMEOUT, Some("timeout")),
        TunnelError::ConnectionLost => {
            (StatusCode::SERVICE_UNAVAILABLE, Some("connection_lost"))
        }
        TunnelError::LocalServiceUnavailable(_) => {
            (StatusCode::BAD_GATEWAY, Some("upstream_unavailable"))
        }
        TunnelError::BodyTooLarge(_, _) => (StatusCode::PAYLOAD_TOO_LARGE, None),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, None),
    }
}

/// JSON error body with the given status
pub fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Build the public response for a failed forward
pub fn tunnel_error_response(e: &TunnelError) -> Response {
    let (status, class) = error_status(e);
    let mut response = json_error(status, get_client_error_message(e));
    if let Some(class) = class {
        response
            .headers_mut()
            .insert(TUNNEL_ERROR_HEADER, HeaderValue::from_static(class));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_error_hides_details() {
        let err = TunnelError::InternalError("pending table for 10.0.1.5 poisoned".to_string());
        let sanitized = sanitize_error(&err);

        assert_eq!(sanitized, "Internal server error");
        assert!(!sanitized.contains("10.0.1.5"));
    }

    #[test]
    fn test_sanitize_error_with_custom_message() {
        let err = TunnelError::LocalServiceUnavailable(
            "error sending request for url (http://127.0.0.1:3000/)".to_string(),
        );
        let sanitized = sanitize_error_with_message(&err, "Upstream service unavailable");

        assert_eq!(sanitized, "Upstream service unavailable");
        assert!(!sanitized.contains("127.0.0.1"));
    }

    #[test]
    fn test_safe_errors_are_identified() {
        assert!(is_safe_error(&TunnelError::NotFound("demo".to_string())));
        assert!(is_safe_error(&TunnelError::Timeout));
        assert!(is_safe_error(&TunnelError::BodyTooLarge(20, 10)));
        assert!(!is_safe_error(&TunnelError::MalformedFrame(
            "correlation 12".to_string()
        )));
        assert!(!is_safe_error(&TunnelError::WebSocketError(
            "reset".to_string()
        )));
    }

    #[test]
    fn test_client_error_message() {
        let msg = get_client_error_message(&TunnelError::NotFound("demo".to_string()));
        assert!(msg.contains("demo"));

        let msg = get_client_error_message(&TunnelError::MalformedFrame(
            "correlation 12 on session 7f3a".to_string(),
        ));
        assert_eq!(msg, "Internal server error");
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                TunnelError::NotFound("x".to_string()),
                StatusCode::BAD_GATEWAY,
                Some("tunnel_not_found"),
            ),
            (
                TunnelError::InvalidIdentifier("x".to_string()),
                StatusCode::BAD_REQUEST,
                None,
            ),
            (TunnelError::Timeout, StatusCode::GATEWAY_TIMEOUT, Some("timeout")),
            (
                TunnelError::ConnectionLost,
                StatusCode::SERVICE_UNAVAILABLE,
                Some("connection_lost"),
            ),
            (
                TunnelError::LocalServiceUnavailable("x".to_string()),
                StatusCode::BAD_GATEWAY,
                Some("upstream_unavailable"),
            ),
            (
                TunnelError::BodyTooLarge(2, 1),
                StatusCode::PAYLOAD_TOO_LARGE,
                None,
            ),
            (
                TunnelError::HttpError("x".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
                None,
            ),
        ];

        for (err, status, class) in cases {
            assert_eq!(error_status(&err), (status, class), "{}", err);
        }
    }

    #[test]
    fn test_tunnel_error_response_headers() {
        let response = tunnel_error_response(&TunnelError::Timeout);
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(response.headers()[TUNNEL_ERROR_HEADER], "timeout");
        assert_eq!(response.headers()["content-type"], "application/json");

        let response = tunnel_error_response(&TunnelError::BodyTooLarge(2, 1));
        assert!(response.headers().get(TUNNEL_ERROR_HEADER).is_none());
    }
}
