//! Request inspector
//!
//! Keeps the latest exchanges of every tunnel in memory, newest first, and serves
//! them as JSON on a local address so a developer can see what went through.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;
use warren_common::{Headers, RequestFrame, current_timestamp_millis};

/// Exchanges kept per tunnel
pub const MAX_LOGGED_EXCHANGES: usize = 100;

/// Body bytes kept per request or response
pub const MAX_LOGGED_BODY_BYTES: usize = 64 * 1024;

/// Default address of the inspector endpoint
pub const DEFAULT_INSPECT_ADDR: &str = "127.0.0.1:7878";

/// The first bytes of a body, as text
#[derive(Debug, Clone, Default, Serialize)]
pub struct BodyPreview {
    pub text: String,
    /// Full body length in bytes
    pub length: usize,
    pub truncated: bool,
}

impl BodyPreview {
    pub fn of(body: &[u8]) -> Self {
        let mut preview = Self::default();
        preview.extend(body);
        preview
    }

    fn extend(&mut self, data: &[u8]) {
        let room = MAX_LOGGED_BODY_BYTES.saturating_sub(self.length);
        let kept = &data[..data.len().min(room)];
        self.text.push_str(&String::from_utf8_lossy(kept));
        self.length += data.len();
        self.truncated = self.length > MAX_LOGGED_BODY_BYTES;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggedRequest {
    pub method: String,
    pub uri: String,
    pub headers: Headers,
    pub body: BodyPreview,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggedResponse {
    pub status_code: u16,
    pub headers: Headers,
    pub body: BodyPreview,
}

/// One request served through a tunnel
#[derive(Debug, Clone, Serialize)]
pub struct Exchange {
    pub correlation_id: u64,
    /// Milliseconds since the Unix epoch
    pub started_at: u64,
    pub duration_ms: u64,
    pub request: LoggedRequest,
    pub response: Option<LoggedResponse>,
    /// Set when no complete response reached the server
    pub error: Option<String>,
}

impl Exchange {
    pub fn begin(request: &RequestFrame, body: &[u8]) -> Self {
        Self {
            correlation_id: request.correlation_id,
            started_at: current_timestamp_millis(),
            duration_ms: 0,
            request: LoggedRequest {
                method: request.method.clone(),
                uri: request.uri.clone(),
                headers: request.headers.clone(),
                body: BodyPreview::of(body),
            },
            response: None,
            error: None,
        }
    }

    pub fn respond(&mut self, status_code: u16, headers: &Headers) {
        self.response = Some(LoggedResponse {
            status_code,
            headers: headers.clone(),
            body: BodyPreview::default(),
        });
    }

    pub fn response_data(&mut self, data: &[u8]) {
        if let Some(response) = &mut self.response {
            response.body.extend(data);
        }
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }
}

type Tunnels = HashMap<String, VecDeque<Exchange>>;

/// Bounded per-tunnel history shared by every connection of the agent
#[derive(Clone)]
pub struct RequestLog {
    tunnels: Arc<Mutex<Tunnels>>,
    capacity: usize,
}

impl Default for RequestLog {
    fn default() -> Self {
        Self::new(MAX_LOGGED_EXCHANGES)
    }
}

impl RequestLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            tunnels: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }

    fn tunnels(&self) -> MutexGuard<'_, Tunnels> {
        self.tunnels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make a tunnel visible before its first request
    pub fn add_tunnel(&self, name: &str) {
        self.tunnels().entry(name.to_string()).or_default();
    }

    /// Handle that records into one tunnel's history
    pub fn for_tunnel(&self, name: &str) -> TunnelLog {
        self.add_tunnel(name);
        TunnelLog {
            log: self.clone(),
            name: name.to_string(),
        }
    }

    /// Add an exchange, evicting the oldest one past capacity
    pub fn record(&self, tunnel: &str, exchange: Exchange) {
        let mut tunnels = self.tunnels();
        let history = tunnels.entry(tunnel.to_string()).or_default();
        history.push_front(exchange);
        history.truncate(self.capacity);
    }

    /// History of a tunnel, newest first
    pub fn exchanges(&self, tunnel: &str) -> Option<Vec<Exchange>> {
        self.tunnels()
            .get(tunnel)
            .map(|history| history.iter().cloned().collect())
    }

    pub fn tunnel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tunnels().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Request log bound to one tunnel
#[derive(Clone)]
pub struct TunnelLog {
    log: RequestLog,
    name: String,
}

impl TunnelLog {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record(&self, exchange: Exchange) {
        self.log.record(&self.name, exchange);
    }
}

#[derive(Deserialize)]
struct RequestsQuery {
    tunnel: String,
}

/// Routes of the inspector endpoint
pub fn router(log: RequestLog) -> Router {
    Router::new()
        .route("/tunnels", get(list_tunnels))
        .route("/requests", get(list_requests))
        .with_state(log)
}

async fn list_tunnels(State(log): State<RequestLog>) -> Json<Vec<String>> {
    Json(log.tunnel_names())
}

async fn list_requests(
    State(log): State<RequestLog>,
    Query(query): Query<RequestsQuery>,
) -> Response {
    match log.exchanges(&query.tunnel) {
        Some(exchanges) => Json(exchanges).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown tunnel: {}", query.tunnel) })),
        )
            .into_response(),
    }
}

/// Serve the inspector until the task is dropped
pub async fn serve(listener: TcpListener, log: RequestLog) -> Result<()> {
    info!("🔍 Request inspector on http://{}", listener.local_addr()?);
    axum::serve(listener, router(log)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn request(correlation_id: u64, uri: &str) -> RequestFrame {
        RequestFrame::new(
            correlation_id,
            "web".to_string(),
            "GET".to_string(),
            uri.to_string(),
            0,
        )
    }

    #[test]
    fn test_history_is_newest_first_and_bounded() {
        let log = RequestLog::new(3);
        let web = log.for_tunnel("web");
        for id in 1..=5 {
            web.record(Exchange::begin(&request(id, &format!("/{}", id)), b""));
        }

        let uris: Vec<String> = log
            .exchanges("web")
            .unwrap()
            .into_iter()
            .map(|e| e.request.uri)
            .collect();
        assert_eq!(uris, vec!["/5", "/4", "/3"]);
    }

    #[test]
    fn test_tunnels_are_kept_apart() {
        let log = RequestLog::default();
        log.add_tunnel("api");
        log.for_tunnel("web")
            .record(Exchange::begin(&request(1, "/"), b""));

        assert_eq!(log.tunnel_names(), vec!["api", "web"]);
        assert!(log.exchanges("api").unwrap().is_empty());
        assert_eq!(log.exchanges("web").unwrap().len(), 1);
        assert!(log.exchanges("other").is_none());
    }

    #[test]
    fn test_body_preview_is_truncated() {
        let big = vec![b'a'; MAX_LOGGED_BODY_BYTES + 10];
        let preview = BodyPreview::of(&big);
        assert_eq!(preview.length, MAX_LOGGED_BODY_BYTES + 10);
        assert_eq!(preview.text.len(), MAX_LOGGED_BODY_BYTES);
        assert!(preview.truncated);

        let mut exchange = Exchange::begin(&request(1, "/"), b"ping");
        assert_eq!(exchange.request.body.text, "ping");
        assert!(!exchange.request.body.truncated);

        exchange.respond(200, &Headers::new());
        exchange.response_data(&big[..MAX_LOGGED_BODY_BYTES - 2]);
        exchange.response_data(b"xyz!");
        let body = &exchange.response.unwrap().body;
        assert!(body.text.ends_with("xy"));
        assert_eq!(body.text.len(), MAX_LOGGED_BODY_BYTES);
        assert!(body.truncated);
    }

    #[tokio::test]
    async fn test_endpoint_serves_history() {
        let log = RequestLog::default();
        let mut exchange = Exchange::begin(&request(7, "/hello"), b"");
        exchange.respond(204, &Headers::new());
        log.for_tunnel("web").record(exchange);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve(listener, log));

        let tunnels: Value = reqwest::get(format!("http://{}/tunnels", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(tunnels, json!(["web"]));

        let history: Value = reqwest::get(format!("http://{}/requests?tunnel=web", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(history[0]["correlation_id"], 7);
        assert_eq!(history[0]["request"]["uri"], "/hello");
        assert_eq!(history[0]["response"]["status_code"], 204);

        let response = reqwest::get(format!("http://{}/requests?tunnel=nope", addr))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 404);

        server.abort();
    }
}
