//! Shared harness: a local upstream app, the tunnel server on an ephemeral port, and
//! agents (the real `warren-client` or a scripted WebSocket peer).

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::Path;
use axum::http::header::{CONTENT_TYPE, LOCATION, SET_COOKIE};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum::{Json, http::HeaderValue};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use warren_client::{Config, ConnectionManager, ConnectionState};
use warren_common::Message;
use warren_common::constants::{SECRET_KEY_HEADER, SUBDOMAIN_HEADER};
use warren_server::config::ServerConfig;
use warren_server::{AppState, serve_with_shutdown};

pub const LARGE_BODY_LEN: usize = 200_000;

pub type Peer = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn ok() -> Json<Value> {
    Json(json!({ "message": "ok" }))
}

async fn echo(method: Method, headers: HeaderMap, body: Bytes) -> Json<Value> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    Json(json!({
        "method": method.as_str(),
        "content_type": content_type,
        "body": String::from_utf8_lossy(&body),
        "length": body.len(),
    }))
}

async fn item(Path(id): Path<String>) -> String {
    format!("item {}", id)
}

async fn redirect_302() -> impl IntoResponse {
    (StatusCode::FOUND, [(LOCATION, "/")])
}

async fn redirect_307() -> impl IntoResponse {
    (StatusCode::TEMPORARY_REDIRECT, [(LOCATION, "/")])
}

async fn slow() -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(3)).await;
    Json(json!({ "message": "slow" }))
}

async fn large() -> Vec<u8> {
    (0..LARGE_BODY_LEN).map(|i| (i % 251) as u8).collect()
}

async fn cookies() -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.append(SET_COOKIE, HeaderValue::from_static("session=abc"));
    headers.append(SET_COOKIE, HeaderValue::from_static("theme=dark"));
    (StatusCode::CREATED, headers, "cookies")
}

/// Start the local upstream application and return its address
pub async fn start_upstream() -> SocketAddr {
    let app = Router::new()
        .route(
            "/",
            get(ok).post(ok).put(ok).patch(ok).delete(ok).options(ok),
        )
        .route("/echo", post(echo).put(echo).patch(echo))
        .route("/items/{id}", get(item))
        .route("/redirect-302", any(redirect_302))
        .route("/redirect-307", any(redirect_307))
        .route("/slow", get(slow))
        .route("/large", get(large))
        .route("/cookies", get(cookies));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    pub async fn start(config: ServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = AppState::new(config).unwrap();

        let (shutdown, rx) = oneshot::channel();
        let handle = tokio::spawn(serve_with_shutdown(listener, state.clone(), async {
            let _ = rx.await;
        }));

        Self {
            addr,
            state,
            shutdown: Some(shutdown),
            handle,
        }
    }

    pub async fn start_default() -> Self {
        Self::start(ServerConfig::default()).await
    }

    /// Base URL of the tunnel `subdomain` on this server
    pub fn tunnel_url(&self, subdomain: &str) -> String {
        format!("http://{}.localhost:{}", subdomain, self.addr.port())
    }

    /// Base URL of the administrative host
    pub fn admin_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn register_url(&self) -> String {
        format!("ws://{}/register", self.addr)
    }

    /// HTTP client that resolves `<subdomain>.localhost` to this server
    pub fn client(&self, subdomains: &[&str], follow_redirects: bool) -> reqwest::Client {
        let policy = if follow_redirects {
            reqwest::redirect::Policy::limited(5)
        } else {
            reqwest::redirect::Policy::none()
        };
        let mut builder = reqwest::Client::builder().redirect(policy);
        for subdomain in subdomains {
            builder = builder.resolve(&format!("{}.localhost", subdomain), self.addr);
        }
        builder.build().unwrap()
    }

    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
    }
}

/// Run the real agent against `server`, returning once its tunnel is up
pub async fn start_agent(
    server: &TestServer,
    upstream: SocketAddr,
    subdomain: &str,
) -> (JoinHandle<anyhow::Result<()>>, String) {
    run_agent(ConnectionManager::new(agent_config(server, upstream, subdomain))).await
}

pub fn agent_config(server: &TestServer, upstream: SocketAddr, subdomain: &str) -> Config {
    let mut config = Config::new(format!("http://{}", upstream), server.register_url());
    config.subdomain = Some(subdomain.to_string());
    config.name = subdomain.to_string();
    config.request_timeout = Duration::from_secs(10);
    config.reconnect_config.max_attempts = Some(1);
    config
}

/// Run `manager` in the background until it reports a public URL
pub async fn run_agent(manager: ConnectionManager) -> (JoinHandle<anyhow::Result<()>>, String) {
    let mut state = manager.subscribe();
    let handle = tokio::spawn(async move { manager.run().await });

    let public_url = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let ConnectionState::Connected { public_url, .. } = &*state.borrow_and_update() {
                return public_url.clone();
            }
            state.changed().await.unwrap();
        }
    })
    .await
    .expect("agent did not connect");

    (handle, public_url)
}

/// Open a raw registration WebSocket
pub async fn connect_peer(
    server: &TestServer,
    subdomain: Option<&str>,
    secret_key: Option<&str>,
) -> Result<Peer, tungstenite::Error> {
    let mut request = server.register_url().into_client_request()?;
    if let Some(subdomain) = subdomain {
        request
            .headers_mut()
            .insert(SUBDOMAIN_HEADER, subdomain.parse().unwrap());
    }
    if let Some(secret_key) = secret_key {
        request
            .headers_mut()
            .insert(SECRET_KEY_HEADER, secret_key.parse().unwrap());
    }
    let (peer, _) = connect_async(request).await?;
    Ok(peer)
}

/// Status code of a refused registration
pub fn rejection_status(error: &tungstenite::Error) -> Option<u16> {
    match error {
        tungstenite::Error::Http(response) => Some(response.status().as_u16()),
        _ => None,
    }
}

pub async fn send_message(peer: &mut Peer, message: &Message) {
    let text = serde_json::to_string(message).unwrap();
    peer.send(WsMessage::Text(text.into())).await.unwrap();
}

/// Next protocol frame, or `None` once the server closed the connection
pub async fn next_message(peer: &mut Peer) -> Option<Message> {
    let next = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(frame) = peer.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => {
                    return Some(serde_json::from_str(text.as_str()).unwrap());
                }
                Ok(WsMessage::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
        None
    });
    next.await.expect("timed out waiting for a frame")
}

/// Register a scripted peer and consume its connection details
pub async fn register_peer(server: &TestServer, subdomain: &str) -> Peer {
    let mut peer = connect_peer(server, Some(subdomain), None).await.unwrap();
    match next_message(&mut peer).await {
        Some(Message::ConnectionEstablished { session_id, .. }) => {
            assert_eq!(session_id, subdomain);
        }
        other => panic!("expected connection details, got {:?}", other),
    }
    peer
}

/// Poll `condition` until it holds or a few seconds pass
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
