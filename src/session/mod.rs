//! Session engine - one connection, one state machine
//!
//! ## Responsibilities
//!
//! - Drive a connection through the request states: ReadingFirstRequest /
//!   ReadingRequest -> HaveCompleteMessage -> FilteringRequest ->
//!   PreprocessingRequest -> SendingResponse -> CleaningUp
//! - Observe kill and idle-timeout events at every suspension point
//! - Hold the per-session correlation state: CSeq counter, wait slot,
//!   pending map, holder count
//! - Defer final teardown until every holder has let go
//!
//! Responses and peer-originated pushes both travel through the session's
//! outbound channel; the writer pump owns the socket write half, so whole
//! messages never interleave on the wire.

mod handlers;
mod rest;
mod types;

#[cfg(test)]
mod tests;

pub use types::{ChannelInfo, DeviceInfo, PendingEntry, SessionKind, WaitSlot};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::http::{build_response, BodyOutcome, Connection, HeadOutcome, HttpRequest};
use crate::protocol::{codes, MessageBuilder, MessageType};
use crate::state::AppState;

/// States of the session I/O loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    ReadingFirstRequest,
    ReadingRequest,
    HaveCompleteMessage,
    FilteringRequest,
    PreprocessingRequest,
    SendingResponse,
    CleaningUp,
}

/// Wake-up cause while parked on the socket.
enum SessionEvent {
    Head(Vec<u8>),
    Overflow,
    Closed,
    Killed,
    IdleTimeout,
    IoError(std::io::Error),
}

enum BodyEvent {
    Complete,
    Aborted,
}

/// Result of `setup_request`.
enum SetupOutcome {
    Ok,
    /// Framing/argument problem: answer a raw 400 and close.
    Protocol,
    /// Connection-level failure; tear the session down.
    Abort,
}

/// Frames handed to the writer pump.
pub enum OutboundFrame {
    Data(Vec<u8>),
    Shutdown,
}

/// Per-request scratch carried between loop states.
#[derive(Default)]
pub(crate) struct Exchange {
    /// JSON request body (read from the wire or synthesized by a REST path)
    pub body: String,
    /// Response bytes queued by the current handler
    pub out: Vec<u8>,
    /// Set by a handler that needs a poll tick before it can finish
    pub wait_quantum: Option<Duration>,
    /// Raw-HTTP error responses close the connection after flushing
    pub close_session: bool,
    /// Unread request-body bytes to drain before the next request
    pub body_remaining: usize,
}

/// One connection to the hub.
pub struct Session {
    id: String,
    pub(crate) ctx: AppState,
    kind: StdMutex<SessionKind>,
    authenticated: AtomicBool,
    alive: AtomicBool,
    killed: AtomicBool,
    kill_notify: Notify,
    /// "Someone will dereference me later" - gates destruction
    holders: AtomicU32,
    holders_changed: Notify,
    /// "Someone is dereferencing me right now" - registry resolve guards
    lookups: AtomicU32,
    cseq: AtomicU32,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub(crate) device: Mutex<DeviceInfo>,
    pub(crate) wait: Mutex<WaitSlot>,
    pending: Mutex<HashMap<u32, PendingEntry>>,
    last_activity: StdMutex<Instant>,
}

impl Session {
    pub fn new(ctx: AppState) -> (Arc<Session>, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        ctx.session_count
            .fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session {
            id: Uuid::new_v4().simple().to_string(),
            ctx,
            kind: StdMutex::new(SessionKind::Unclassified),
            authenticated: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            killed: AtomicBool::new(false),
            kill_notify: Notify::new(),
            holders: AtomicU32::new(0),
            holders_changed: Notify::new(),
            lookups: AtomicU32::new(0),
            cseq: AtomicU32::new(0),
            outbound: tx,
            device: Mutex::new(DeviceInfo::default()),
            wait: Mutex::new(WaitSlot::default()),
            pending: Mutex::new(HashMap::new()),
            last_activity: StdMutex::new(Instant::now()),
        });
        tracing::debug!(session_id = %session.id, "Create session");
        (session, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> SessionKind {
        *self.kind.lock().unwrap()
    }

    pub(crate) fn set_kind(&self, kind: SessionKind) {
        *self.kind.lock().unwrap() = kind;
    }

    /// Classify an unclassified session as a client on its first client
    /// message.
    pub(crate) fn classify_client(&self) {
        let mut kind = self.kind.lock().unwrap();
        if *kind == SessionKind::Unclassified {
            *kind = SessionKind::Client;
        }
    }

    pub fn authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub(crate) fn set_authenticated(&self, value: bool) {
        self.authenticated.store(value, Ordering::Release);
    }

    /// Deliver a kill event; the loop observes it at its next suspension
    /// point and falls through to teardown.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
        self.kill_notify.notify_waiters();
    }

    fn set_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    fn is_live(&self) -> bool {
        if self.killed.load(Ordering::Acquire) {
            self.set_dead();
        }
        self.alive.load(Ordering::Acquire)
    }

    /// Next value of this session's monotonically increasing CSeq counter.
    pub fn next_cseq(&self) -> u32 {
        self.cseq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn holder_count(&self) -> u32 {
        self.holders.load(Ordering::Acquire)
    }

    pub(crate) fn add_holder(&self) {
        self.holders.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_holder(&self) {
        let prev = self.holders.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "holder count underflow");
        if prev == 1 {
            self.holders_changed.notify_waiters();
        }
    }

    pub(crate) fn acquire_lookup(&self) {
        self.lookups.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_lookup(&self) {
        self.lookups.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn lookup_holds(&self) -> u32 {
        self.lookups.load(Ordering::Acquire)
    }

    pub async fn device_info(&self) -> DeviceInfo {
        self.device.lock().await.clone()
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Park an entry waiting for this device to echo `cseq`. Adds a holder
    /// on the entry's client.
    pub(crate) async fn insert_pending(&self, cseq: u32, entry: PendingEntry) {
        entry.client.add_holder();
        self.pending.lock().await.insert(cseq, entry);
    }

    /// Consume the entry for an echoed CSeq. The caller must release the
    /// client holder once done with the entry.
    pub(crate) async fn take_pending(&self, cseq: u32) -> Option<PendingEntry> {
        self.pending.lock().await.remove(&cseq)
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn idle_deadline(&self) -> Instant {
        *self.last_activity.lock().unwrap() + self.ctx.config.session_timeout
    }

    /// Queue raw bytes on the outbound channel. `false` means the writer is
    /// gone and the session should die.
    pub(crate) fn send_raw(&self, bytes: Vec<u8>) -> bool {
        self.outbound.send(OutboundFrame::Data(bytes)).is_ok()
    }

    /// Send a protocol message to this session's peer, framed as an HTTP
    /// response on its long-lived connection. Used by other sessions to push
    /// server-originated requests to a device.
    pub(crate) fn send_message(&self, body: &str) -> bool {
        let bytes = build_response(&self.ctx.config.server_header, 200, Some(body), false);
        self.send_raw(bytes)
    }

    pub(crate) fn queue_json(&self, ex: &mut Exchange, body: &str, close: bool) {
        ex.out = build_response(&self.ctx.config.server_header, 200, Some(body), close);
        if close {
            // honor the close header once the response has flushed
            ex.close_session = true;
        }
    }

    /// Queue a bodyless error response; the session dies after it flushes.
    pub(crate) fn queue_status(&self, ex: &mut Exchange, status: u16) {
        ex.out = build_response(&self.ctx.config.server_header, status, None, true);
        ex.close_session = true;
    }

    /// Drive this session until the connection ends, then tear down.
    pub async fn run<S>(self: Arc<Self>, stream: S, rx: mpsc::UnboundedReceiver<OutboundFrame>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let pump = tokio::spawn(write_pump(writer, rx));
        let mut conn = Connection::new(reader, self.ctx.config.max_request_head_bytes);

        let mut state = SessionState::ReadingFirstRequest;
        let mut request: Option<HttpRequest> = None;
        let mut overflow = false;
        let mut ex = Exchange::default();

        while self.is_live() {
            match state {
                SessionState::ReadingFirstRequest | SessionState::ReadingRequest => {
                    match self.next_event(&mut conn).await {
                        SessionEvent::Head(raw) => {
                            overflow = false;
                            request = Some(HttpRequest::new(raw));
                            state = SessionState::HaveCompleteMessage;
                        }
                        SessionEvent::Overflow => {
                            overflow = true;
                            state = SessionState::HaveCompleteMessage;
                        }
                        SessionEvent::Closed => {
                            tracing::debug!(session_id = %self.id, "Peer closed connection");
                            self.set_dead();
                        }
                        SessionEvent::Killed => {
                            // is_live() turns the flag into death at loop top
                        }
                        SessionEvent::IdleTimeout => {
                            let serial = self.device.lock().await.serial.clone();
                            tracing::warn!(session_id = %self.id, serial = %serial, "Session idle timeout");
                            self.set_dead();
                        }
                        SessionEvent::IoError(err) => {
                            tracing::debug!(session_id = %self.id, error = %err, "Read error");
                            self.set_dead();
                        }
                    }
                }

                SessionState::HaveCompleteMessage => {
                    ex = Exchange::default();
                    if overflow {
                        self.queue_status(&mut ex, 400);
                        state = SessionState::SendingResponse;
                    } else {
                        state = SessionState::FilteringRequest;
                    }
                }

                SessionState::FilteringRequest => {
                    self.touch();
                    match self.setup_request(&mut conn, request.as_ref(), &mut ex).await {
                        SetupOutcome::Ok => {
                            state = if ex.out.is_empty() {
                                SessionState::PreprocessingRequest
                            } else {
                                SessionState::SendingResponse
                            };
                        }
                        SetupOutcome::Protocol => {
                            self.queue_status(&mut ex, 400);
                            state = SessionState::SendingResponse;
                        }
                        SetupOutcome::Abort => {
                            self.set_dead();
                        }
                    }
                }

                SessionState::PreprocessingRequest => {
                    handlers::process_request(&self, &mut ex).await;
                    if !ex.out.is_empty() {
                        ex.body.clear();
                        state = SessionState::SendingResponse;
                    } else if let Some(quantum) = ex.wait_quantum.take() {
                        // cooperative poll-wait: re-enter this same state
                        // after the quantum and re-dispatch the same body
                        if !self.sleep_quantum(quantum).await {
                            continue;
                        }
                    } else {
                        ex.body.clear();
                        state = SessionState::CleaningUp;
                    }
                }

                SessionState::SendingResponse => {
                    let bytes = std::mem::take(&mut ex.out);
                    if !self.send_raw(bytes) {
                        self.set_dead();
                        continue;
                    }
                    if ex.close_session {
                        self.set_dead();
                        continue;
                    }
                    state = SessionState::CleaningUp;
                }

                SessionState::CleaningUp => {
                    if ex.body_remaining > 0 {
                        let mut sink = Vec::new();
                        let remaining = ex.body_remaining;
                        ex.body_remaining = 0;
                        match self.read_body_event(&mut conn, &mut sink, remaining).await {
                            BodyEvent::Complete => {}
                            BodyEvent::Aborted => {
                                self.set_dead();
                                continue;
                            }
                        }
                    }
                    state = SessionState::ReadingRequest;
                }
            }
        }

        let _ = self.outbound.send(OutboundFrame::Shutdown);
        let _ = pump.await;
        self.teardown().await;
    }

    /// Park on the socket for the next request head, a kill, or the idle
    /// deadline.
    async fn next_event<R: AsyncRead + Unpin>(&self, conn: &mut Connection<R>) -> SessionEvent {
        let deadline = self.idle_deadline();
        tokio::select! {
            res = conn.read_head() => match res {
                Ok(HeadOutcome::Head(raw)) => SessionEvent::Head(raw),
                Ok(HeadOutcome::Overflow) => SessionEvent::Overflow,
                Ok(HeadOutcome::Closed) => SessionEvent::Closed,
                Err(err) => SessionEvent::IoError(err),
            },
            _ = self.kill_notify.notified() => SessionEvent::Killed,
            _ = tokio::time::sleep_until(deadline) => SessionEvent::IdleTimeout,
        }
    }

    async fn read_body_event<R: AsyncRead + Unpin>(
        &self,
        conn: &mut Connection<R>,
        body: &mut Vec<u8>,
        content_length: usize,
    ) -> BodyEvent {
        let deadline = self.idle_deadline();
        tokio::select! {
            res = conn.read_body(body, content_length) => match res {
                Ok(BodyOutcome::Complete) => BodyEvent::Complete,
                Ok(BodyOutcome::Closed) | Err(_) => BodyEvent::Aborted,
            },
            _ = self.kill_notify.notified() => BodyEvent::Aborted,
            _ = tokio::time::sleep_until(deadline) => BodyEvent::Aborted,
        }
    }

    /// Sleep one wait quantum; `false` when a kill arrived instead.
    async fn sleep_quantum(&self, quantum: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(quantum) => true,
            _ = self.kill_notify.notified() => false,
        }
    }

    /// Parse the request line; route REST paths; otherwise buffer the JSON
    /// body for the dispatcher.
    async fn setup_request<R: AsyncRead + Unpin>(
        &self,
        conn: &mut Connection<R>,
        request: Option<&HttpRequest>,
        ex: &mut Exchange,
    ) -> SetupOutcome {
        let head = match request.map(HttpRequest::parse) {
            Some(Ok(head)) => head,
            _ => return SetupOutcome::Protocol,
        };

        let path = head.path.trim_end_matches('/').to_ascii_lowercase();
        if !path.is_empty() && path != "/" {
            // REST requests carry no JSON body; whatever body they do carry
            // is drained before the next request
            ex.body_remaining = head.content_length.unwrap_or(0).max(0) as usize;
            let result = match path.as_str() {
                "/api/getdevicelist" => rest::device_list(self, &head.query, ex).await,
                "/api/getdeviceinfo" => rest::device_info(self, &head.query, ex).await,
                "/api/getdevicestream" => rest::device_stream(self, &head.query, ex),
                _ => {
                    let msg = MessageBuilder::new(MessageType::ScException)
                        .cseq("1")
                        .result(codes::SERVER_NOT_IMPLEMENTED)
                        .build();
                    self.queue_json(ex, &msg, true);
                    Ok(())
                }
            };
            return match result {
                Ok(()) => SetupOutcome::Ok,
                Err(_) => SetupOutcome::Protocol,
            };
        }

        let content_length = match head.content_length {
            Some(len) if len > 0 => len as usize,
            _ => return SetupOutcome::Protocol,
        };

        let mut body = Vec::with_capacity(content_length);
        match self.read_body_event(conn, &mut body, content_length).await {
            BodyEvent::Complete => {}
            BodyEvent::Aborted => return SetupOutcome::Abort,
        }

        match String::from_utf8(body) {
            Ok(text) => {
                ex.body = text;
                SetupOutcome::Ok
            }
            Err(_) => SetupOutcome::Protocol,
        }
    }

    /// Final cleanup: release pending holds, leave the registry, then linger
    /// until this session's own holders drain.
    async fn teardown(&self) {
        let drained: Vec<PendingEntry> = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, entry)| entry).collect()
        };
        if !drained.is_empty() {
            tracing::debug!(
                session_id = %self.id,
                count = drained.len(),
                "Releasing pending holds on teardown"
            );
        }
        for entry in &drained {
            entry.client.release_holder();
        }

        let serial = self.device.lock().await.serial.clone();
        if self.kind().is_device() && !serial.is_empty() {
            if self.ctx.registry.remove_if(&serial, &self.id).await {
                self.set_authenticated(false);
                tracing::info!(serial = %serial, session_id = %self.id, "Device removed from registry");
            }
        }

        loop {
            let notified = self.holders_changed.notified();
            let holders = self.holder_count();
            if holders == 0 {
                break;
            }
            tracing::debug!(
                session_id = %self.id,
                holders,
                "Session lingering until holders drain"
            );
            notified.await;
        }

        self.ctx.session_count.fetch_sub(1, Ordering::Relaxed);
        tracing::debug!(session_id = %self.id, "Release session");
    }
}

/// Owns the socket write half; drains the outbound channel in order.
async fn write_pump<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
) {
    while let Some(frame) = rx.recv().await {
        match frame {
            OutboundFrame::Data(bytes) => {
                if writer.write_all(&bytes).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
            OutboundFrame::Shutdown => break,
        }
    }
    let _ = writer.shutdown().await;
}
