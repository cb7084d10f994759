//! Transport multiplexer
//!
//! A [`Session`] owns the sending half of one agent connection. Any number of public
//! requests share it: each is assigned a correlation ID and a slot in the session's
//! pending table, and the agent's response frames resolve slots by ID in whatever
//! order they arrive.
//!
//! A slot moves from `AwaitingHead` to `Streaming` when a response head without the
//! terminal marker arrives, and is removed when the terminal chunk arrives, when the
//! request fails, or when the [`PendingResponse`] handle is dropped.
//!
//! Delivering a frame to a requester never waits: the session's read loop serves
//! every correlation ID, so one slow public reader must not hold up the others.
//! Streamed chunks queue per request up to `MAX_BUFFERED_RESPONSE_BYTES`; a requester
//! that falls further behind than that has its own request failed.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, warn};
use warren_common::constants::{BODY_CHUNK_SIZE, MAX_BUFFERED_RESPONSE_BYTES};
use warren_common::{
    BodyChunk, ChunkBuffer, ErrorCode, Headers, Message, RequestFrame, ResponseFrame, Result,
    TunnelError, current_timestamp_millis, decode_body, encode_body,
};

/// Request line and headers of a public request about to enter the tunnel
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: String,
    /// Path and query
    pub uri: String,
    pub headers: Headers,
}

/// Status and headers of a tunnelled response, plus any body that arrived inline
#[derive(Debug)]
pub struct ResponseHead {
    pub status_code: u16,
    pub headers: Headers,
    pub body: Bytes,
    /// `body` is the complete response body
    pub end: bool,
}

enum BodyEvent {
    Data(Bytes),
    End,
}

type HeadSender = oneshot::Sender<Result<ResponseHead>>;

/// Sending half of one request's body queue, with the bytes not yet read
#[derive(Clone)]
struct BodySender {
    tx: mpsc::UnboundedSender<Result<BodyEvent>>,
    buffered: Arc<AtomicUsize>,
}

enum Delivery {
    Queued,
    Gone,
    Overflow(usize),
}

impl BodySender {
    fn deliver(&self, event: BodyEvent, limit: usize) -> Delivery {
        if let BodyEvent::Data(data) = &event {
            let buffered = self.buffered.fetch_add(data.len(), Ordering::AcqRel) + data.len();
            if buffered > limit {
                return Delivery::Overflow(buffered);
            }
        }
        match self.tx.send(Ok(event)) {
            Ok(()) => Delivery::Queued,
            Err(_) => Delivery::Gone,
        }
    }

    fn fail(&self, error: TunnelError) {
        let _ = self.tx.send(Err(error));
    }
}

enum Slot {
    AwaitingHead {
        head_tx: HeadSender,
        body_tx: BodySender,
    },
    Streaming {
        body_tx: BodySender,
    },
}

impl Slot {
    fn fail(self, error: TunnelError) {
        match self {
            Slot::AwaitingHead { head_tx, .. } => {
                let _ = head_tx.send(Err(error));
            }
            Slot::Streaming { body_tx } => body_tx.fail(error),
        }
    }
}

#[derive(Default)]
struct PendingTable {
    slots: HashMap<u64, Slot>,
    closed: bool,
}

/// One registered tunnel bound to a live agent connection
pub struct Session {
    id: String,
    connection_id: String,
    user_id: Option<u64>,
    created_at: DateTime<Utc>,
    last_active: Mutex<DateTime<Utc>>,
    active: AtomicBool,
    next_correlation_id: AtomicU64,
    outbound: mpsc::Sender<Message>,
    pending: Mutex<PendingTable>,
    response_buffer_limit: usize,
}

impl Session {
    pub fn new(
        id: String,
        connection_id: String,
        user_id: Option<u64>,
        outbound: mpsc::Sender<Message>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            connection_id,
            user_id,
            created_at: now,
            last_active: Mutex::new(now),
            active: AtomicBool::new(true),
            next_correlation_id: AtomicU64::new(1),
            outbound,
            pending: Mutex::new(PendingTable::default()),
            response_buffer_limit: MAX_BUFFERED_RESPONSE_BYTES,
        }
    }

    /// Override how many unread response bytes one requester may fall behind by
    pub fn with_response_buffer_limit(mut self, limit: usize) -> Self {
        self.response_buffer_limit = limit;
        self
    }

    /// Tunnel identifier (subdomain)
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Unique per connection; distinguishes re-registrations of the same identifier
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn user_id(&self) -> Option<u64> {
        self.user_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        *self
            .last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn touch(&self) {
        *self
            .last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Utc::now();
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Requests still waiting for (the rest of) their response
    pub fn pending_count(&self) -> usize {
        self.table().slots.len()
    }

    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a frame for the agent, waiting for queue space until `deadline`
    pub async fn send(&self, message: Message, deadline: Instant) -> Result<()> {
        match timeout_at(deadline, self.outbound.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TunnelError::ConnectionLost),
            Err(_) => Err(TunnelError::Timeout),
        }
    }

    /// Queue a frame only if there is room right now
    pub fn try_send(&self, message: Message) -> bool {
        self.outbound.try_send(message).is_ok()
    }

    fn open_slot(self: &Arc<Self>) -> Result<PendingResponse> {
        let (head_tx, head_rx) = oneshot::channel();
        let (tx, body_rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        let body_tx = BodySender {
            tx,
            buffered: Arc::clone(&buffered),
        };

        let mut table = self.table();
        if table.closed {
            return Err(TunnelError::ConnectionLost);
        }
        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        table
            .slots
            .insert(correlation_id, Slot::AwaitingHead { head_tx, body_tx });
        drop(table);

        Ok(PendingResponse {
            correlation_id,
            head_rx,
            body_rx,
            buffered,
            finished: false,
            _guard: PendingGuard {
                session: Arc::clone(self),
                correlation_id,
            },
        })
    }

    /// Forward a request to the agent
    ///
    /// The body is read from `body` and relayed in frame-sized chunks; a body shorter
    /// than one chunk travels inline in the request head. Every queue wait is bounded
    /// by `deadline`. The returned handle resolves with the agent's response.
    pub async fn send_request<S, E>(
        self: &Arc<Self>,
        request: OutboundRequest,
        body: S,
        max_body_size: usize,
        deadline: Instant,
    ) -> Result<PendingResponse>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Display,
    {
        let pending = self.open_slot()?;
        let correlation_id = pending.correlation_id;

        let mut frame = RequestFrame::new(
            correlation_id,
            self.id.clone(),
            request.method,
            request.uri,
            current_timestamp_millis(),
        );
        frame.headers = request.headers;

        let mut head = Some(frame);
        let result = self
            .relay_request_body(correlation_id, &mut head, body, max_body_size, deadline)
            .await;

        if let Err(e) = result {
            // The agent holds a partial body once the head went out
            if head.is_none() {
                self.abort_request(correlation_id);
            }
            return Err(e);
        }

        debug!(
            "Forwarded request {} on session {}",
            correlation_id, self.id
        );
        Ok(pending)
    }

    async fn relay_request_body<S, E>(
        &self,
        correlation_id: u64,
        head: &mut Option<RequestFrame>,
        body: S,
        max_body_size: usize,
        deadline: Instant,
    ) -> Result<()>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Display,
    {
        let mut body = std::pin::pin!(body);
        let mut buffer = ChunkBuffer::new(BODY_CHUNK_SIZE);
        let mut received = 0usize;

        loop {
            let next = timeout_at(deadline, body.next())
                .await
                .map_err(|_| TunnelError::Timeout)?;
            let data = match next {
                None => break,
                Some(Ok(data)) => data,
                Some(Err(e)) => {
                    return Err(TunnelError::HttpError(format!(
                        "failed to read request body: {}",
                        e
                    )));
                }
            };

            received += data.len();
            if received > max_body_size {
                return Err(TunnelError::BodyTooLarge(received, max_body_size));
            }

            for chunk in buffer.push(&data) {
                if let Some(frame) = head.take() {
                    self.send(Message::HttpRequest(frame), deadline).await?;
                }
                let chunk = BodyChunk::new(correlation_id, encode_body(&chunk), false);
                self.send(Message::RequestBody(chunk), deadline).await?;
            }
        }

        let rest = buffer.finish();
        match head.take() {
            Some(mut frame) => {
                frame.body = encode_body(&rest);
                frame.end = true;
                self.send(Message::HttpRequest(frame), deadline).await
            }
            None => {
                let chunk = BodyChunk::new(correlation_id, encode_body(&rest), true);
                self.send(Message::RequestBody(chunk), deadline).await
            }
        }
    }

    /// Tell the agent to discard a partially relayed request
    fn abort_request(&self, correlation_id: u64) {
        let abort = Message::Error {
            correlation_id: Some(correlation_id),
            code: ErrorCode::InvalidRequest,
            message: "request aborted".to_string(),
        };
        if !self.try_send(abort) {
            debug!(
                "Could not queue abort for request {} on session {}",
                correlation_id, self.id
            );
        }
    }

    /// Resolve a waiting request with its response head
    ///
    /// Heads for unknown or already answered correlation IDs are dropped.
    pub fn resolve_head(&self, frame: ResponseFrame) -> Result<()> {
        let correlation_id = frame.correlation_id;
        let body = match decode_body(&frame.body) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                self.fail_request(
                    correlation_id,
                    TunnelError::MalformedFrame("undecodable response body".to_string()),
                );
                return Err(e.into());
            }
        };

        let mut table = self.table();
        let (head_tx, body_tx) = match table.slots.remove(&correlation_id) {
            Some(Slot::AwaitingHead { head_tx, body_tx }) => (head_tx, body_tx),
            Some(streaming) => {
                table.slots.insert(correlation_id, streaming);
                warn!(
                    "Dropping duplicate response head for request {} on session {}",
                    correlation_id, self.id
                );
                return Ok(());
            }
            None => {
                warn!(
                    "Dropping response for unknown request {} on session {}",
                    correlation_id, self.id
                );
                return Ok(());
            }
        };
        if !frame.end {
            table
                .slots
                .insert(correlation_id, Slot::Streaming { body_tx });
        }
        drop(table);

        let head = ResponseHead {
            status_code: frame.status_code,
            headers: frame.headers,
            body,
            end: frame.end,
        };
        if head_tx.send(Ok(head)).is_err() {
            debug!("Requester for {} went away before its response", correlation_id);
            self.table().slots.remove(&correlation_id);
        }
        Ok(())
    }

    /// Deliver a response body chunk without waiting for the requester
    ///
    /// The chunk carrying the terminal marker completes and removes the slot. A
    /// requester whose unread backlog passes the buffer limit is failed on its own.
    pub fn push_body(&self, chunk: BodyChunk) -> Result<()> {
        let correlation_id = chunk.correlation_id;
        let data = match decode_body(&chunk.body) {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                self.fail_request(
                    correlation_id,
                    TunnelError::MalformedFrame("undecodable response body".to_string()),
                );
                return Err(e.into());
            }
        };

        let body_tx = {
            let mut table = self.table();
            let body_tx = match table.slots.get(&correlation_id) {
                Some(Slot::Streaming { body_tx }) => body_tx.clone(),
                Some(Slot::AwaitingHead { .. }) => {
                    warn!(
                        "Dropping body chunk received before the head of request {}",
                        correlation_id
                    );
                    return Ok(());
                }
                None => {
                    debug!(
                        "Dropping body chunk for unknown request {} on session {}",
                        correlation_id, self.id
                    );
                    return Ok(());
                }
            };
            if chunk.end {
                table.slots.remove(&correlation_id);
            }
            body_tx
        };

        let mut events = Vec::with_capacity(2);
        if !data.is_empty() {
            events.push(BodyEvent::Data(data));
        }
        if chunk.end {
            events.push(BodyEvent::End);
        }

        for event in events {
            match body_tx.deliver(event, self.response_buffer_limit) {
                Delivery::Queued => {}
                Delivery::Gone => {
                    debug!("Requester for {} stopped reading", correlation_id);
                    self.table().slots.remove(&correlation_id);
                    return Ok(());
                }
                Delivery::Overflow(buffered) => {
                    warn!(
                        "Requester for {} on session {} fell {} bytes behind, failing it",
                        correlation_id, self.id, buffered
                    );
                    self.table().slots.remove(&correlation_id);
                    body_tx.fail(TunnelError::BodyTooLarge(
                        buffered,
                        self.response_buffer_limit,
                    ));
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Fail a single request, leaving the rest of the session untouched
    pub fn fail_request(&self, correlation_id: u64, error: TunnelError) -> bool {
        let slot = self.table().slots.remove(&correlation_id);
        match slot {
            Some(slot) => {
                slot.fail(error);
                true
            }
            None => false,
        }
    }

    /// Mark the session closed and fail every pending request with `ConnectionLost`
    ///
    /// Returns the number of requests that were still pending.
    pub fn close(&self) -> usize {
        self.active.store(false, Ordering::Release);
        let slots: Vec<Slot> = {
            let mut table = self.table();
            table.closed = true;
            table.slots.drain().map(|(_, slot)| slot).collect()
        };

        let count = slots.len();
        for slot in slots {
            slot.fail(TunnelError::ConnectionLost);
        }
        count
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("connection_id", &self.connection_id)
            .field("user_id", &self.user_id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Map an agent-reported failure to the error surfaced for its request
pub fn agent_error(code: ErrorCode, message: String) -> TunnelError {
    match code {
        ErrorCode::Timeout => TunnelError::Timeout,
        _ => TunnelError::LocalServiceUnavailable(message),
    }
}

struct PendingGuard {
    session: Arc<Session>,
    correlation_id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self
            .session
            .table()
            .slots
            .remove(&self.correlation_id)
            .is_some()
        {
            debug!(
                "Cancelled request {} on session {}",
                self.correlation_id,
                self.session.id()
            );
        }
    }
}

/// Handle to a forwarded request; dropping it cancels the request
pub struct PendingResponse {
    correlation_id: u64,
    head_rx: oneshot::Receiver<Result<ResponseHead>>,
    body_rx: mpsc::UnboundedReceiver<Result<BodyEvent>>,
    buffered: Arc<AtomicUsize>,
    finished: bool,
    _guard: PendingGuard,
}

impl PendingResponse {
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    /// Wait for the response head until `deadline`
    pub async fn head(&mut self, deadline: Instant) -> Result<ResponseHead> {
        match timeout_at(deadline, &mut self.head_rx).await {
            Ok(Ok(result)) => {
                if matches!(result, Ok(ResponseHead { end: true, .. })) {
                    self.finished = true;
                }
                result
            }
            Ok(Err(_)) => Err(TunnelError::ConnectionLost),
            Err(_) => Err(TunnelError::Timeout),
        }
    }

    /// Next streamed body chunk; `None` once the terminal chunk was seen
    ///
    /// Waiting longer than `idle` for a chunk fails with `Timeout`.
    pub async fn next_chunk(&mut self, idle: Duration) -> Option<Result<Bytes>> {
        if self.finished {
            return None;
        }
        let event = match timeout(idle, self.body_rx.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => Err(TunnelError::ConnectionLost),
            Err(_) => Err(TunnelError::Timeout),
        };
        match event {
            Ok(BodyEvent::Data(data)) => {
                self.buffered.fetch_sub(data.len(), Ordering::AcqRel);
                Some(Ok(data))
            }
            Ok(BodyEvent::End) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
