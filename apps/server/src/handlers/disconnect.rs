//! DisconnectHandler - Session teardown
//!
//! Runs once per session, whatever ended it: the registry entry is released, every
//! pending request fails with `ConnectionLost`, and the dashboard and user store see
//! the session go inactive.

use std::fmt;

use tracing::{info, warn};

use crate::AppState;
use crate::multiplexer::Session;

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    AgentClosed,
    TransportError(String),
    IdleTimeout,
    TooManyMalformedFrames(u32),
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::AgentClosed => write!(f, "agent closed the connection"),
            CloseReason::TransportError(e) => write!(f, "transport error: {}", e),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::TooManyMalformedFrames(n) => {
                write!(f, "{} consecutive malformed frames", n)
            }
            CloseReason::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// Tear down a session
pub async fn handle_disconnect(state: &AppState, session: &Session, reason: &CloseReason) {
    let removed = state.registry.deregister(session).await;

    state
        .stats
        .session_closed(session.id(), session.connection_id());
    if let Some(user_id) = session.user_id() {
        state.users.session_closed(user_id);
    }

    match reason {
        CloseReason::AgentClosed | CloseReason::Shutdown => {
            info!("Tunnel {} closed: {}", session.id(), reason)
        }
        _ => warn!("Tunnel {} closed: {}", session.id(), reason),
    }
    if !removed {
        warn!(
            "Tunnel {} connection {} had already been replaced",
            session.id(),
            session.connection_id()
        );
    }
}
