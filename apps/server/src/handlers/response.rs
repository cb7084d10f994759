//! ResponseHandler - Frames arriving from agents
//!
//! Response heads and body chunks resolve the pending requests they name, agent
//! errors fail them, and heartbeats are answered. Frames for requests that are no
//! longer pending are dropped by the session without affecting anything else.

use std::sync::Arc;

use tracing::{debug, info, warn};
use warren_common::{Message, Result};

use crate::AppState;
use crate::multiplexer::{Session, agent_error};

/// Handle one frame from the agent behind `session`
///
/// An error means the frame could not be used; the caller counts it toward the
/// session's malformed-frame limit.
pub async fn handle_response(state: &AppState, session: &Arc<Session>, message: Message) -> Result<()> {
    match message {
        Message::HttpResponse(frame) => {
            debug!(
                "Received response for request {} on {}: status {}",
                frame.correlation_id,
                session.id(),
                frame.status_code
            );
            session.resolve_head(frame)?;
        }
        Message::ResponseBody(chunk) => session.push_body(chunk)?,
        Message::Error {
            correlation_id: Some(correlation_id),
            code,
            message,
        } => {
            warn!(
                "Agent for {} failed request {}: {:?} - {}",
                session.id(),
                correlation_id,
                code,
                message
            );
            session.fail_request(correlation_id, agent_error(code, message));
        }
        Message::Error {
            correlation_id: None,
            code,
            message,
        } => {
            warn!("Agent for {} reported {:?}: {}", session.id(), code, message);
        }
        Message::Ping => {
            debug!("Received ping from {}", session.id());
            if !session.try_send(Message::Pong) {
                debug!("Outbound queue for {} full, skipping pong", session.id());
            }
        }
        Message::Pong => {
            debug!("Received pong from {}", session.id());
        }
        Message::Ready => {
            info!("Agent for {} is ready, sending connection details", session.id());
            session.try_send(Message::ConnectionEstablished {
                session_id: session.id().to_string(),
                public_url: state.config.public_url(session.id()),
            });
        }
        Message::HttpRequest(_) | Message::RequestBody(_) | Message::ConnectionEstablished { .. } => {
            warn!("Ignoring server-bound frame type from agent {}", session.id());
        }
    }

    Ok(())
}
