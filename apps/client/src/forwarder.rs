//! Local service forwarding
//!
//! Requests arriving through the tunnel are replayed against the local service and
//! the response is streamed back as a head frame followed by body chunks. Redirects
//! from the local service are never followed here; they travel back to the public
//! caller unchanged.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use reqwest::{Client, Method, redirect};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, warn};
use warren_common::constants::BODY_CHUNK_SIZE;
use warren_common::{
    BodyChunk, ChunkBuffer, ErrorCode, Headers, Message, RequestFrame, ResponseFrame,
    TunnelError, decode_body, encode_body, headers_to_map,
};

use crate::inspector::{Exchange, TunnelLog};

/// Request headers the HTTP client sets itself
const SKIPPED_REQUEST_HEADERS: &[&str] = &["host", "content-length"];

/// Build the client used for every request of one connection
pub fn local_client(request_timeout: Duration) -> Result<Client> {
    let client = Client::builder()
        .timeout(request_timeout)
        .redirect(redirect::Policy::none())
        .build()?;
    Ok(client)
}

/// Serialize a frame and queue it for the write task
pub async fn send_frame(outgoing_tx: &mpsc::Sender<WsMessage>, message: &Message) -> Result<()> {
    let json = serde_json::to_string(message)?;
    outgoing_tx
        .send(WsMessage::Text(json.into()))
        .await
        .map_err(|e| TunnelError::WebSocketError(e.to_string()))?;
    Ok(())
}

struct PartialRequest {
    frame: RequestFrame,
    body: Vec<u8>,
}

/// Request bodies that arrive over several frames, keyed by correlation ID
#[derive(Default)]
pub struct RequestAssembler {
    partial: HashMap<u64, PartialRequest>,
}

impl RequestAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a request head; returns the request if its body is already complete
    pub fn start(&mut self, mut frame: RequestFrame) -> Result<Option<(RequestFrame, Vec<u8>)>> {
        let body = decode_body(&frame.body)?;
        frame.body.clear();
        if frame.end {
            return Ok(Some((frame, body)));
        }
        self.partial
            .insert(frame.correlation_id, PartialRequest { frame, body });
        Ok(None)
    }

    /// Accept a body chunk; returns the request once the terminal chunk arrived
    pub fn push(&mut self, chunk: BodyChunk) -> Result<Option<(RequestFrame, Vec<u8>)>> {
        let data = decode_body(&chunk.body)?;
        let Some(partial) = self.partial.get_mut(&chunk.correlation_id) else {
            warn!(
                "Dropping body chunk for unknown request {}",
                chunk.correlation_id
            );
            return Ok(None);
        };
        partial.body.extend_from_slice(&data);

        if !chunk.end {
            return Ok(None);
        }
        Ok(self
            .partial
            .remove(&chunk.correlation_id)
            .map(|p| (p.frame, p.body)))
    }

    /// Discard a partially received request
    pub fn abort(&mut self, correlation_id: u64) -> bool {
        self.partial.remove(&correlation_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.partial.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partial.is_empty()
    }
}

/// Where forwarded requests go, and where they are logged
#[derive(Clone)]
pub struct LocalTarget {
    pub client: Client,
    /// Local service base URL
    pub address: String,
    pub log: Option<TunnelLog>,
}

/// Exchange being recorded, when the tunnel keeps a request log
struct Capture(Option<Exchange>);

impl Capture {
    fn respond(&mut self, status_code: u16, headers: &Headers) {
        if let Some(exchange) = &mut self.0 {
            exchange.respond(status_code, headers);
        }
    }

    fn data(&mut self, data: &[u8]) {
        if let Some(exchange) = &mut self.0 {
            exchange.response_data(data);
        }
    }

    fn fail(&mut self, message: &str) {
        if let Some(exchange) = &mut self.0 {
            exchange.fail(message);
        }
    }
}

/// Forward one request to the local service and stream the response back
pub async fn handle_http_request(
    target: LocalTarget,
    request: RequestFrame,
    body: Vec<u8>,
    outgoing_tx: mpsc::Sender<WsMessage>,
) -> Result<()> {
    let start_time = Instant::now();
    let mut capture = Capture(
        target
            .log
            .as_ref()
            .map(|_| Exchange::begin(&request, &body)),
    );

    let result = forward(&target, request, body, &outgoing_tx, &mut capture, start_time).await;

    if let (Some(log), Some(mut exchange)) = (&target.log, capture.0) {
        if let Err(e) = &result {
            exchange.fail(e.to_string());
        }
        exchange.duration_ms = start_time.elapsed().as_millis() as u64;
        log.record(exchange);
    }
    result
}

async fn forward(
    target: &LocalTarget,
    request: RequestFrame,
    body: Vec<u8>,
    outgoing_tx: &mpsc::Sender<WsMessage>,
    capture: &mut Capture,
    start_time: Instant,
) -> Result<()> {
    let correlation_id = request.correlation_id;

    debug!("Forwarding: {} {}", request.method, request.uri);

    let method = match Method::from_bytes(request.method.as_bytes()) {
        Ok(method) => method,
        Err(_) => {
            let message = format!("Unsupported HTTP method: {}", request.method);
            capture.fail(&message);
            return send_error(outgoing_tx, correlation_id, ErrorCode::InvalidRequest, message)
                .await;
        }
    };

    let url = format!("{}{}", target.address.trim_end_matches('/'), request.uri);
    let mut req_builder = target.client.request(method, &url);
    for (name, values) in request.headers.iter() {
        if SKIPPED_REQUEST_HEADERS
            .iter()
            .any(|h| h.eq_ignore_ascii_case(name))
        {
            continue;
        }
        for value in values {
            req_builder = req_builder.header(name.as_str(), value.as_str());
        }
    }
    if !body.is_empty() {
        req_builder = req_builder.body(body);
    }

    let mut response = match req_builder.send().await {
        Ok(response) => response,
        Err(e) => {
            error!("Local service error: {}", e);
            let code = if e.is_timeout() {
                ErrorCode::Timeout
            } else {
                ErrorCode::LocalServiceUnavailable
            };
            let message = e.to_string();
            capture.fail(&message);
            return send_error(outgoing_tx, correlation_id, code, message).await;
        }
    };

    let mut head = ResponseFrame::new(correlation_id, response.status().as_u16());
    head.headers = headers_to_map(response.headers());
    capture.respond(head.status_code, &head.headers);

    let mut head = Some(head);
    let mut buffer = ChunkBuffer::new(BODY_CHUNK_SIZE);
    loop {
        let data = match response.chunk().await {
            Ok(Some(data)) => data,
            Ok(None) => break,
            Err(e) => {
                error!("Reading local response for {} failed: {}", correlation_id, e);
                let message = e.to_string();
                capture.fail(&message);
                return send_error(
                    outgoing_tx,
                    correlation_id,
                    ErrorCode::LocalServiceUnavailable,
                    message,
                )
                .await;
            }
        };
        capture.data(&data);

        for chunk in buffer.push(&data) {
            if let Some(mut frame) = head.take() {
                frame.end = false;
                frame.processing_time_ms = start_time.elapsed().as_millis() as u64;
                send_frame(outgoing_tx, &Message::HttpResponse(frame)).await?;
            }
            let chunk = BodyChunk::new(correlation_id, encode_body(&chunk), false);
            send_frame(outgoing_tx, &Message::ResponseBody(chunk)).await?;
        }
    }

    let rest = buffer.finish();
    let processing_time = start_time.elapsed().as_millis() as u64;
    match head.take() {
        Some(mut frame) => {
            debug!("Response: {} ({}ms)", frame.status_code, processing_time);
            frame.body = encode_body(&rest);
            frame.end = true;
            frame.processing_time_ms = processing_time;
            send_frame(outgoing_tx, &Message::HttpResponse(frame)).await
        }
        None => {
            debug!("Streamed response for {} ({}ms)", correlation_id, processing_time);
            let chunk = BodyChunk::new(correlation_id, encode_body(&rest), true);
            send_frame(outgoing_tx, &Message::ResponseBody(chunk)).await
        }
    }
}

async fn send_error(
    outgoing_tx: &mpsc::Sender<WsMessage>,
    correlation_id: u64,
    code: ErrorCode,
    message: String,
) -> Result<()> {
    let error_message = Message::Error {
        correlation_id: Some(correlation_id),
        code,
        message,
    };
    send_frame(outgoing_tx, &error_message).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspector::RequestLog;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use tokio::net::TcpListener;

    fn frame(correlation_id: u64, body: &[u8], end: bool) -> RequestFrame {
        let mut frame = RequestFrame::new(
            correlation_id,
            "demo".to_string(),
            "POST".to_string(),
            "/upload".to_string(),
            0,
        );
        frame.body = encode_body(body);
        frame.end = end;
        frame
    }

    #[test]
    fn test_inline_request_is_complete() {
        let mut assembler = RequestAssembler::new();
        let (request, body) = assembler.start(frame(1, b"hello", true)).unwrap().unwrap();
        assert_eq!(request.correlation_id, 1);
        assert!(request.body.is_empty());
        assert_eq!(body, b"hello");
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_chunked_request_is_reassembled() {
        let mut assembler = RequestAssembler::new();
        assert!(assembler.start(frame(3, b"", false)).unwrap().is_none());
        assert_eq!(assembler.len(), 1);

        let first = BodyChunk::new(3, encode_body(b"abc"), false);
        assert!(assembler.push(first).unwrap().is_none());
        let last = BodyChunk::new(3, encode_body(b"def"), true);
        let (request, body) = assembler.push(last).unwrap().unwrap();

        assert_eq!(request.uri, "/upload");
        assert_eq!(body, b"abcdef");
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_interleaved_requests_stay_separate() {
        let mut assembler = RequestAssembler::new();
        assembler.start(frame(1, b"", false)).unwrap();
        assembler.start(frame(2, b"", false)).unwrap();

        assembler.push(BodyChunk::new(2, encode_body(b"two"), false)).unwrap();
        assembler.push(BodyChunk::new(1, encode_body(b"one"), false)).unwrap();

        let (_, body) = assembler.push(BodyChunk::terminal(1)).unwrap().unwrap();
        assert_eq!(body, b"one");
        let (_, body) = assembler.push(BodyChunk::terminal(2)).unwrap().unwrap();
        assert_eq!(body, b"two");
    }

    #[test]
    fn test_abort_discards_partial_request() {
        let mut assembler = RequestAssembler::new();
        assembler.start(frame(7, b"", false)).unwrap();
        assert!(assembler.abort(7));
        assert!(!assembler.abort(7));

        // Late chunks of the aborted request are ignored
        assert!(assembler.push(BodyChunk::terminal(7)).unwrap().is_none());
    }

    #[test]
    fn test_undecodable_body_is_an_error() {
        let mut assembler = RequestAssembler::new();
        let mut bad = frame(1, b"", true);
        bad.body = "***".to_string();
        assert!(assembler.start(bad).is_err());
    }

    fn target(address: &str, log: Option<TunnelLog>) -> LocalTarget {
        LocalTarget {
            client: local_client(Duration::from_secs(2)).unwrap(),
            address: address.to_string(),
            log,
        }
    }

    #[tokio::test]
    async fn test_unreachable_service_reports_error_frame() {
        let log = RequestLog::default();
        let (tx, mut rx) = mpsc::channel(4);

        // Nothing listens on port 1
        handle_http_request(
            target("http://127.0.0.1:1", Some(log.for_tunnel("web"))),
            frame(9, b"", true),
            Vec::new(),
            tx,
        )
        .await
        .unwrap();

        let Some(WsMessage::Text(text)) = rx.recv().await else {
            panic!("expected a text frame");
        };
        let message: Message = serde_json::from_str(text.as_str()).unwrap();
        match message {
            Message::Error {
                correlation_id,
                code,
                ..
            } => {
                assert_eq!(correlation_id, Some(9));
                assert_eq!(code, ErrorCode::LocalServiceUnavailable);
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        let logged = log.exchanges("web").unwrap();
        assert_eq!(logged.len(), 1);
        assert!(logged[0].response.is_none());
        assert!(logged[0].error.is_some());
    }

    #[tokio::test]
    async fn test_served_exchange_is_logged() {
        let app = Router::new().route(
            "/upload",
            post(|body: String| async move { (StatusCode::CREATED, format!("got {}", body)) }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let log = RequestLog::default();
        let (tx, mut rx) = mpsc::channel(4);
        handle_http_request(
            target(&format!("http://{}", addr), Some(log.for_tunnel("web"))),
            frame(3, b"", true),
            b"hello".to_vec(),
            tx,
        )
        .await
        .unwrap();

        let Some(WsMessage::Text(text)) = rx.recv().await else {
            panic!("expected a response frame");
        };
        let Message::HttpResponse(head) = serde_json::from_str(text.as_str()).unwrap() else {
            panic!("expected a response head");
        };
        assert_eq!(head.status_code, 201);
        assert!(head.end);

        let logged = log.exchanges("web").unwrap();
        assert_eq!(logged[0].correlation_id, 3);
        assert_eq!(logged[0].request.method, "POST");
        assert_eq!(logged[0].request.body.text, "hello");
        let response = logged[0].response.as_ref().unwrap();
        assert_eq!(response.status_code, 201);
        assert_eq!(response.body.text, "got hello");
        assert!(logged[0].error.is_none());
    }

    #[tokio::test]
    async fn test_unlogged_target_still_forwards() {
        let (tx, mut rx) = mpsc::channel(4);
        handle_http_request(
            target("http://127.0.0.1:1", None),
            frame(1, b"", true),
            Vec::new(),
            tx,
        )
        .await
        .unwrap();
        assert!(matches!(rx.recv().await, Some(WsMessage::Text(_))));
    }
}
