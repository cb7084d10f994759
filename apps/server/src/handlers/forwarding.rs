//! ForwardingHandler - Public requests routed into tunnels
//!
//! A request for `<id>.<domain>` is looked up in the registry, relayed to the agent
//! over the session's connection, and answered with whatever the agent's local
//! service returned. Response bodies that the agent streams in chunks are streamed
//! on to the caller as they arrive.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::CONTENT_LENGTH;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures_util::stream;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use warren_common::validation::validate_path;
use warren_common::{TunnelError, header_value, headers_to_map, map_to_headers};

use crate::AppState;
use crate::error_handling::{json_error, tunnel_error_response};
use crate::multiplexer::{OutboundRequest, PendingResponse, ResponseHead, Session};

/// Forward a public request into the tunnel registered as `identifier`
pub async fn forward_request(state: AppState, identifier: String, request: Request) -> Response {
    let session = match state.registry.lookup(&identifier).await {
        Ok(session) => session,
        Err(e) => {
            debug!("No tunnel for {}", identifier);
            return tunnel_error_response(&e);
        }
    };
    state.stats.record_request();

    let (parts, body) = request.into_parts();
    let max_body_size = state.config.max_body_size;
    if let Some(length) = declared_length(&parts.headers)
        && length > max_body_size
    {
        state.stats.record_failure();
        return tunnel_error_response(&TunnelError::BodyTooLarge(length, max_body_size));
    }

    let raw_uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = match validate_path(raw_uri) {
        Ok(uri) => uri,
        Err(e) => {
            state.stats.record_failure();
            return json_error(StatusCode::URI_TOO_LONG, e.to_string());
        }
    };

    info!("{} {} -> tunnel {}", parts.method, uri, identifier);
    let outbound = OutboundRequest {
        method: parts.method.to_string(),
        uri,
        headers: headers_to_map(&parts.headers),
    };

    let deadline = Instant::now() + state.config.request_timeout;
    let result = async {
        let mut pending = session
            .send_request(outbound, body.into_data_stream(), max_body_size, deadline)
            .await?;
        let head = pending.head(deadline).await?;
        Ok::<_, TunnelError>((pending, head))
    }
    .await;

    match result {
        Ok((pending, head)) => build_response(state, session, pending, head),
        Err(e) => {
            if e.is_session_fatal() {
                warn!("Tunnel {} went away mid-request", identifier);
            } else {
                warn!("Request to tunnel {} failed: {}", identifier, e);
            }
            state.stats.record_failure();
            tunnel_error_response(&e)
        }
    }
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn build_response(
    state: AppState,
    session: Arc<Session>,
    pending: PendingResponse,
    head: ResponseHead,
) -> Response {
    let Ok(status) = StatusCode::from_u16(head.status_code) else {
        state.stats.record_failure();
        return tunnel_error_response(&TunnelError::LocalServiceUnavailable(format!(
            "invalid status code {}",
            head.status_code
        )));
    };

    if status.is_redirection() {
        debug!(
            "Relaying {} redirect to {}",
            status.as_u16(),
            header_value(&head.headers, "location").unwrap_or("<none>")
        );
    }

    let body = if head.end {
        complete(&state, &session);
        Body::from(head.body)
    } else {
        Body::from_stream(stream_body(state, session, pending, head.body))
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = map_to_headers(&head.headers);
    response
}

struct BodyRelay {
    state: AppState,
    session: Arc<Session>,
    pending: PendingResponse,
    first: Option<Bytes>,
}

/// Yield the inline part of the body, then every streamed chunk
fn stream_body(
    state: AppState,
    session: Arc<Session>,
    pending: PendingResponse,
    inline: Bytes,
) -> impl futures_util::Stream<Item = Result<Bytes, TunnelError>> + Send + 'static {
    let relay = BodyRelay {
        state,
        session,
        pending,
        first: Some(inline).filter(|b| !b.is_empty()),
    };

    stream::unfold(Some(relay), |relay| async move {
        let mut relay = relay?;
        if let Some(first) = relay.first.take() {
            return Some((Ok(first), Some(relay)));
        }

        let idle = relay.state.config.request_timeout;
        match relay.pending.next_chunk(idle).await {
            Some(Ok(data)) => Some((Ok(data), Some(relay))),
            Some(Err(e)) => {
                warn!(
                    "Response stream for tunnel {} broke off: {}",
                    relay.session.id(),
                    e
                );
                relay.state.stats.record_failure();
                Some((Err(e), None))
            }
            None => {
                complete(&relay.state, &relay.session);
                None
            }
        }
    })
}

/// Record a fully delivered response
fn complete(state: &AppState, session: &Session) {
    session.touch();
    state.stats.record_success(session.id());
    if let Some(user_id) = session.user_id() {
        state.users.touch(user_id);
    }
}
