//! Connection manager
//!
//! Owns the WebSocket to the tunnel server: registration handshake, the read, write
//! and heartbeat tasks of a live connection, and reconnection with exponential
//! backoff when the connection drops.

use std::ops::ControlFlow;
use std::time::Duration;

use anyhow::{Result, bail};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use warren_common::constants::{OUTBOUND_QUEUE_CAPACITY, SECRET_KEY_HEADER, SUBDOMAIN_HEADER};
use warren_common::{ErrorCode, Message, TunnelError};

use crate::config::Config;
use crate::forwarder::{
    LocalTarget, RequestAssembler, handle_http_request, local_client, send_frame,
};
use crate::inspector::RequestLog;

type WebSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Connection state tracking
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected {
        session_id: String,
        public_url: String,
    },
    Reconnecting {
        attempt: usize,
        next_delay: Duration,
    },
}

/// How a live connection ended
#[derive(Debug, Clone, PartialEq)]
enum ConnectionEnd {
    /// Transport closed or failed; worth reconnecting
    Dropped,
    /// The server withdrew the tunnel
    Revoked(String),
}

/// Connection manager handles WebSocket lifecycle and reconnection
pub struct ConnectionManager {
    config: Config,
    state_tx: watch::Sender<ConnectionState>,
    request_log: Option<RequestLog>,
}

impl ConnectionManager {
    pub fn new(config: Config) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            state_tx,
            request_log: None,
        }
    }

    /// Record every served request in `log` under this tunnel's name
    pub fn with_request_log(mut self, log: RequestLog) -> Self {
        log.add_tunnel(&self.config.name);
        self.request_log = Some(log);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Observe connection state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Main run loop with automatic reconnection
    ///
    /// Returns only when the server refuses the registration outright, revokes a
    /// live tunnel, or the configured number of attempts is exhausted.
    pub async fn run(&self) -> Result<()> {
        let reconnect = &self.config.reconnect_config;
        let mut reconnect_delay = reconnect.min_delay;
        let mut attempt = 0;

        loop {
            self.state_tx.send_replace(ConnectionState::Connecting);

            match self.establish_connection().await {
                Ok((ws_stream, session_id, public_url)) => {
                    info!("🌐 Tunnel established: {}", public_url);
                    reconnect_delay = reconnect.min_delay;
                    attempt = 0;
                    self.state_tx.send_replace(ConnectionState::Connected {
                        session_id,
                        public_url,
                    });

                    let end = self.handle_connection(ws_stream).await;
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                    match end {
                        Ok(ConnectionEnd::Revoked(reason)) => {
                            bail!("server revoked the tunnel: {}", reason);
                        }
                        Ok(ConnectionEnd::Dropped) => {}
                        Err(e) => error!("Connection error: {}", e),
                    }
                }
                Err(e) => {
                    if let Some(status) = rejection_status(&e)
                        && is_permanent_rejection(status)
                    {
                        self.state_tx.send_replace(ConnectionState::Disconnected);
                        bail!("server rejected the tunnel registration ({}): {}", status, e);
                    }
                    error!("Failed to connect: {}", e);
                }
            }

            attempt += 1;
            if let Some(max) = reconnect.max_attempts
                && attempt >= max
            {
                self.state_tx.send_replace(ConnectionState::Disconnected);
                bail!("giving up after {} connection attempts", attempt);
            }

            self.state_tx.send_replace(ConnectionState::Reconnecting {
                attempt,
                next_delay: reconnect_delay,
            });
            info!(
                "Reconnecting in {:?} (attempt {})",
                reconnect_delay, attempt
            );
            tokio::time::sleep(reconnect_delay).await;
            reconnect_delay = reconnect.next_delay(reconnect_delay);
        }
    }

    /// Connect, register and wait for the connection details
    async fn establish_connection(&self) -> Result<(WebSocket, String, String)> {
        debug!("Connecting to {}", self.config.websocket_url);

        let mut request = self.config.websocket_url.as_str().into_client_request()?;
        if let Some(subdomain) = &self.config.subdomain {
            request
                .headers_mut()
                .insert(SUBDOMAIN_HEADER, HeaderValue::from_str(subdomain)?);
        }
        if let Some(secret_key) = &self.config.secret_key {
            request
                .headers_mut()
                .insert(SECRET_KEY_HEADER, HeaderValue::from_str(secret_key)?);
        }

        let (mut ws_stream, _) =
            tokio::time::timeout(self.config.connect_timeout, connect_async(request))
                .await
                .map_err(|_| TunnelError::ConnectionError("connection timeout".to_string()))??;

        info!("✅ WebSocket connection established, sending Ready message");
        let ready_json = serde_json::to_string(&Message::Ready)?;
        ws_stream.send(WsMessage::Text(ready_json.into())).await?;

        let (session_id, public_url) = tokio::time::timeout(
            self.config.connect_timeout,
            wait_for_connection_details(&mut ws_stream),
        )
        .await
        .map_err(|_| TunnelError::ConnectionError("connection handshake timeout".to_string()))??;

        Ok((ws_stream, session_id, public_url))
    }

    /// Handle active WebSocket connection with split read/write tasks
    async fn handle_connection(&self, ws_stream: WebSocket) -> Result<ConnectionEnd> {
        let (write, read) = ws_stream.split();
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let target = LocalTarget {
            client: local_client(self.config.request_timeout)?,
            address: self.config.local_address.clone(),
            log: self
                .request_log
                .as_ref()
                .map(|log| log.for_tunnel(&self.config.name)),
        };

        let mut write_handle = tokio::spawn(spawn_write_task(write, outgoing_rx));
        let mut read_handle = tokio::spawn(spawn_read_task(read, outgoing_tx.clone(), target));
        let mut heartbeat_handle = tokio::spawn(spawn_heartbeat_task(
            outgoing_tx,
            self.config.heartbeat_interval,
        ));

        // Any task ending means the connection is gone
        let mut end = ConnectionEnd::Dropped;
        tokio::select! {
            result = &mut write_handle => warn!("Write task ended: {:?}", result),
            result = &mut read_handle => {
                warn!("Read task ended: {:?}", result);
                if let Ok(read_end) = result {
                    end = read_end;
                }
            }
            result = &mut heartbeat_handle => warn!("Heartbeat task ended: {:?}", result),
        }
        write_handle.abort();
        read_handle.abort();
        heartbeat_handle.abort();

        Ok(end)
    }
}

/// Wait for `connection_established`, skipping anything else the server sends first
async fn wait_for_connection_details(ws_stream: &mut WebSocket) -> Result<(String, String)> {
    while let Some(message) = ws_stream.next().await {
        match message? {
            WsMessage::Text(text) => match serde_json::from_str::<Message>(text.as_str()) {
                Ok(Message::ConnectionEstablished {
                    session_id,
                    public_url,
                }) => return Ok((session_id, public_url)),
                Ok(Message::Error { code, message, .. }) => {
                    bail!("registration refused ({:?}): {}", code, message);
                }
                Ok(other) => debug!("Ignoring {:?} during handshake", other),
                Err(e) => warn!("Unparseable frame during handshake: {}", e),
            },
            WsMessage::Close(_) => bail!("server closed connection during handshake"),
            _ => {}
        }
    }
    bail!("connection closed before handshake")
}

fn rejection_status(error: &anyhow::Error) -> Option<StatusCode> {
    match error.downcast_ref::<tungstenite::Error>() {
        Some(tungstenite::Error::Http(response)) => Some(response.status()),
        _ => None,
    }
}

/// Statuses that retrying cannot fix; a taken subdomain may free up, so 409 retries
fn is_permanent_rejection(status: StatusCode) -> bool {
    matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED)
}

/// Write task sends outgoing messages through WebSocket
async fn spawn_write_task(
    mut write: SplitSink<WebSocket, WsMessage>,
    mut outgoing_rx: mpsc::Receiver<WsMessage>,
) -> Result<()> {
    while let Some(message) = outgoing_rx.recv().await {
        if let Err(e) = write.send(message).await {
            error!("Failed to send message: {}", e);
            break;
        }
    }

    let _ = write.close().await;
    debug!("Write task exiting");
    Ok(())
}

/// Read task receives incoming messages and dispatches them
async fn spawn_read_task(
    mut read: SplitStream<WebSocket>,
    outgoing_tx: mpsc::Sender<WsMessage>,
    target: LocalTarget,
) -> ConnectionEnd {
    let mut assembler = RequestAssembler::new();

    while let Some(message) = read.next().await {
        match message {
            Ok(WsMessage::Text(text)) => {
                match handle_text_message(text.as_str(), &mut assembler, &outgoing_tx, &target)
                    .await
                {
                    Ok(ControlFlow::Continue(())) => {}
                    Ok(ControlFlow::Break(reason)) => {
                        debug!("Read task exiting");
                        return ConnectionEnd::Revoked(reason);
                    }
                    Err(e) => error!("Error handling message: {}", e),
                }
            }
            Ok(WsMessage::Binary(_)) => {
                warn!("Received unexpected binary message");
            }
            Ok(WsMessage::Close(_)) => {
                info!("Server closed connection");
                break;
            }
            // Control frames are answered by the WebSocket layer
            Ok(_) => {}
            Err(e) => {
                error!("WebSocket error: {}", e);
                break;
            }
        }
    }

    debug!("Read task exiting");
    ConnectionEnd::Dropped
}

/// Handle incoming text messages
///
/// Breaks with the server's reason when the tunnel is revoked.
async fn handle_text_message(
    text: &str,
    assembler: &mut RequestAssembler,
    outgoing_tx: &mpsc::Sender<WsMessage>,
    target: &LocalTarget,
) -> Result<ControlFlow<String>> {
    let message: Message = serde_json::from_str(text)
        .map_err(|e| TunnelError::MalformedFrame(format!("Failed to parse message: {}", e)))?;

    let complete = match message {
        Message::HttpRequest(request) => {
            debug!(
                "Received HTTP request {}: {} {}",
                request.correlation_id, request.method, request.uri
            );
            assembler.start(request)?
        }
        Message::RequestBody(chunk) => assembler.push(chunk)?,
        Message::Ping => {
            send_frame(outgoing_tx, &Message::Pong).await?;
            None
        }
        Message::Pong => {
            debug!("Received pong");
            None
        }
        Message::ConnectionEstablished { public_url, .. } => {
            debug!("Connection details repeated: {}", public_url);
            None
        }
        Message::Error {
            correlation_id: Some(correlation_id),
            code,
            message,
        } => {
            if assembler.abort(correlation_id) {
                warn!("Request {} aborted by server: {}", correlation_id, message);
            } else {
                debug!(
                    "Server error for request {}: {:?} - {}",
                    correlation_id, code, message
                );
            }
            None
        }
        Message::Error {
            correlation_id: None,
            code,
            message,
        } => {
            error!("Server error: {:?} - {}", code, message);
            if code == ErrorCode::Unauthorized {
                return Ok(ControlFlow::Break(message));
            }
            None
        }
        other => {
            warn!("Received unexpected message type: {:?}", other);
            None
        }
    };

    if let Some((request, body)) = complete {
        // Each request is served concurrently
        let target = target.clone();
        let outgoing_tx = outgoing_tx.clone();
        let correlation_id = request.correlation_id;
        tokio::spawn(async move {
            if let Err(e) = handle_http_request(target, request, body, outgoing_tx).await {
                error!("Failed to handle request {}: {}", correlation_id, e);
            }
        });
    }

    Ok(ControlFlow::Continue(()))
}

/// Heartbeat task sends periodic ping messages
async fn spawn_heartbeat_task(
    outgoing_tx: mpsc::Sender<WsMessage>,
    interval: Duration,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;

        if let Err(e) = send_frame(&outgoing_tx, &Message::Ping).await {
            error!("Failed to send heartbeat: {}", e);
            break;
        }
        debug!("Sent heartbeat");
    }

    debug!("Heartbeat task exiting");
    Ok(())
}
