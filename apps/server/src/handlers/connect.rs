//! ConnectHandler - Tunnel registration
//!
//! Agents open a WebSocket to `/register`, optionally naming the subdomain they want
//! and presenting a tunnel-user secret. The request is validated before the upgrade
//! so that bad names, unknown secrets and taken subdomains are refused with a plain
//! HTTP status. After the upgrade the session is registered and its frames are
//! served until the connection ends.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use warren_common::constants::{OUTBOUND_QUEUE_CAPACITY, SECRET_KEY_HEADER, SUBDOMAIN_HEADER};
use warren_common::validation::validate_subdomain;
use warren_common::{ErrorCode, Message, TunnelError, generate_connection_id, generate_subdomain};

use super::disconnect::{CloseReason, handle_disconnect};
use super::response::handle_response;
use crate::AppState;
use crate::error_handling::json_error;
use crate::multiplexer::Session;

/// Attempts at drawing a free random subdomain
const RANDOM_SUBDOMAIN_ATTEMPTS: usize = 8;

/// Handler for `GET /register`
pub async fn handle_connect(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if state.is_shutting_down() {
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "server is shutting down");
    }

    let user_id = match authenticate(&state, &headers) {
        Ok(user_id) => user_id,
        Err(response) => return response,
    };

    let requested = headers
        .get(SUBDOMAIN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty());

    let identifier = match requested {
        Some(identifier) => {
            if let Err(e) = validate_subdomain(&identifier) {
                debug!("Rejected tunnel subdomain {:?}: {}", identifier, e);
                return json_error(StatusCode::BAD_REQUEST, e.to_string());
            }
            if state.registry.contains(&identifier).await {
                let err = TunnelError::DuplicateIdentifier(identifier);
                info!("{}", err);
                return json_error(StatusCode::CONFLICT, err.to_string());
            }
            identifier
        }
        None => match free_random_subdomain(&state).await {
            Some(identifier) => identifier,
            None => {
                error!("Could not find a free random subdomain");
                return json_error(StatusCode::SERVICE_UNAVAILABLE, "no free subdomain");
            }
        },
    };

    info!("Upgrading tunnel connection for {}", identifier);
    ws.on_upgrade(move |socket| serve_session(state, socket, identifier, user_id))
        .into_response()
}

/// Resolve the presented secret key to a tunnel user
///
/// Anonymous tunnels are allowed unless the server requires authentication.
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Option<u64>, Response> {
    let secret = headers
        .get(SECRET_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or_default();

    match state.users.find_by_secret(secret) {
        Some(user) => Ok(Some(user.id)),
        None if state.config.require_auth => {
            warn!("Rejected tunnel registration with unknown secret key");
            Err(json_error(StatusCode::UNAUTHORIZED, "invalid secret key"))
        }
        None => Ok(None),
    }
}

async fn free_random_subdomain(state: &AppState) -> Option<String> {
    for _ in 0..RANDOM_SUBDOMAIN_ATTEMPTS {
        let candidate = generate_subdomain();
        if !state.registry.contains(&candidate).await {
            return Some(candidate);
        }
    }
    None
}

/// Register the session and serve its frames until the connection ends
pub async fn serve_session(
    state: AppState,
    socket: WebSocket,
    identifier: String,
    user_id: Option<u64>,
) {
    let (mut sink, stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let session = Arc::new(Session::new(
        identifier.clone(),
        generate_connection_id(),
        user_id,
        outbound_tx,
    ));

    // Another agent may have claimed the name between validation and upgrade
    if let Err(e) = state.registry.register(Arc::clone(&session)).await {
        warn!("Tunnel registration for {} failed: {}", identifier, e);
        let code = match e {
            TunnelError::DuplicateIdentifier(_) => ErrorCode::DuplicateIdentifier,
            _ => ErrorCode::InvalidRequest,
        };
        let rejection = Message::Error {
            correlation_id: None,
            code,
            message: e.to_string(),
        };
        if let Ok(text) = serde_json::to_string(&rejection) {
            let _ = sink.send(WsMessage::Text(text.into())).await;
        }
        let _ = sink.close().await;
        return;
    }

    state
        .stats
        .session_opened(session.id(), session.connection_id());
    if let Some(user_id) = user_id {
        state.users.session_opened(user_id);
    }

    let public_url = state.config.public_url(&identifier);
    info!("🌐 Tunnel {} available at {}", identifier, public_url);
    session.try_send(Message::ConnectionEstablished {
        session_id: identifier,
        public_url,
    });

    let (close_tx, close_rx) = oneshot::channel();
    let writer = tokio::spawn(write_frames(sink, outbound_rx, close_rx));

    let reason = read_frames(&state, &session, stream).await;
    handle_disconnect(&state, &session, &reason).await;

    let _ = close_tx.send(());
    if let Err(e) = writer.await {
        debug!("Writer for tunnel {} ended abnormally: {}", session.id(), e);
    }
}

/// Write task: serializes queued frames onto the socket
async fn write_frames(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut outbound_rx: mpsc::Receiver<Message>,
    mut close_rx: oneshot::Receiver<()>,
) {
    loop {
        let message = tokio::select! {
            message = outbound_rx.recv() => message,
            _ = &mut close_rx => None,
        };
        let Some(message) = message else {
            break;
        };

        let text = match serde_json::to_string(&message) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to serialize frame: {}", e);
                continue;
            }
        };
        if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
            debug!("Failed to write frame: {}", e);
            return;
        }
    }

    let _ = sink.close().await;
    debug!("Write task exiting");
}

/// Read task: dispatches agent frames until the session must end
async fn read_frames(
    state: &AppState,
    session: &Arc<Session>,
    mut stream: SplitStream<WebSocket>,
) -> CloseReason {
    let mut shutdown = state.shutdown_signal();
    if *shutdown.borrow_and_update() {
        return CloseReason::Shutdown;
    }

    let idle_timeout = state.config.idle_timeout;
    let max_malformed = state.config.max_malformed_frames;
    let mut malformed = 0u32;

    loop {
        let next = tokio::select! {
            _ = shutdown.changed() => return CloseReason::Shutdown,
            next = timeout(idle_timeout, stream.next()) => next,
        };

        let message = match next {
            Err(_) => return CloseReason::IdleTimeout,
            Ok(None) => return CloseReason::AgentClosed,
            Ok(Some(Err(e))) => return CloseReason::TransportError(e.to_string()),
            Ok(Some(Ok(message))) => message,
        };

        let problem = match message {
            WsMessage::Text(text) => match serde_json::from_str::<Message>(text.as_str()) {
                Ok(frame) => handle_response(state, session, frame).await.err(),
                Err(e) => Some(TunnelError::MalformedFrame(e.to_string())),
            },
            WsMessage::Binary(_) => Some(TunnelError::MalformedFrame(
                "binary frames are not part of the protocol".to_string(),
            )),
            WsMessage::Close(_) => return CloseReason::AgentClosed,
            // Control frames are answered by the WebSocket layer
            WsMessage::Ping(_) | WsMessage::Pong(_) => None,
        };

        match problem {
            None => malformed = 0,
            Some(e) => {
                malformed += 1;
                warn!(
                    "Dropped frame from tunnel {} ({}/{}): {}",
                    session.id(),
                    malformed,
                    max_malformed,
                    e
                );
                if malformed > max_malformed {
                    return CloseReason::TooManyMalformedFrames(malformed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SeedUser, ServerConfig};
    use axum::http::HeaderValue;

    fn state(require_auth: bool) -> AppState {
        let config = ServerConfig {
            require_auth,
            users: vec![SeedUser {
                email: "dev@warren.dev".to_string(),
                secret_key: "known-secret".to_string(),
            }],
            ..ServerConfig::default()
        };
        AppState::new(config).unwrap()
    }

    fn with_secret(secret: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(SECRET_KEY_HEADER, HeaderValue::from_str(secret).unwrap());
        headers
    }

    #[test]
    fn test_known_secret_resolves_user() {
        let state = state(true);
        let user_id = authenticate(&state, &with_secret("known-secret")).unwrap();
        assert_eq!(user_id, Some(1));
    }

    #[test]
    fn test_unknown_secret_rejected_when_auth_required() {
        let state = state(true);
        let response = authenticate(&state, &with_secret("wrong")).unwrap_err();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = authenticate(&state, &HeaderMap::new()).unwrap_err();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_anonymous_allowed_without_auth() {
        let state = state(false);
        assert_eq!(authenticate(&state, &HeaderMap::new()).unwrap(), None);
        assert_eq!(authenticate(&state, &with_secret("wrong")).unwrap(), None);
    }

    #[tokio::test]
    async fn test_random_subdomain_is_free_and_valid() {
        let state = state(false);
        let identifier = free_random_subdomain(&state).await.unwrap();
        assert!(validate_subdomain(&identifier).is_ok());
        assert!(!state.registry.contains(&identifier).await);
    }
}
