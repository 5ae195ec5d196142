//! Request gateway engine: the request/connection state machine.
//!
//! # Responsibilities
//! - Track requests pending → in-flight → completed
//! - Enforce the multiplexing dispatch policy (one at a time unless the
//!   backend advertises FCGI_MPXS_CONNS)
//! - Emit begin-request / params / stdin records in order
//! - Route decoded backend records to the owning request
//! - Reclassify in-flight requests on connection loss and reconnect
//!
//! # Design Decisions
//! - All state lives on one cooperative task; handlers communicate through
//!   channels, so no locking is needed around the queues
//! - Suspension points are exactly: command receive, backend read, inbound
//!   body poll, backoff sleep, get-values timer
//! - Write failures and framing/codec errors take the same path as a socket
//!   close: the byte stream is no longer trusted, so the session is dropped
//!   and rebuilt

use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::task::Poll;

use axum::http::{Method, StatusCode};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::BackendConfig;
use crate::fcgi::codec::{self, CodecError};
use crate::fcgi::record::{RequestIdAllocator, Role, MANAGEMENT_REQUEST_ID};
use crate::fcgi::{RecordBody, RecordType};
use crate::gateway::backend::{BackendConnector, BackendSession, ConnectError};
use crate::gateway::request::{BodyStream, BridgeError, BridgeRequest, ResponseHead};
use crate::gateway::response::ResponseAssembler;

/// Maximum record content length; larger payloads are split across records.
const MAX_CONTENT: usize = u16::MAX as usize;

/// Capacity of each per-request response body channel.
const BODY_CHANNEL_CAPACITY: usize = 32;

/// Fatal gateway failure. Anything recoverable is handled internally.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

enum Command {
    Dispatch(BridgeRequest),
}

/// Cloneable handle the HTTP layer uses to hand requests to the engine.
#[derive(Clone)]
pub struct GatewayHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl GatewayHandle {
    /// Queue a request. Returns false if the engine has stopped.
    pub fn dispatch(&self, request: BridgeRequest) -> bool {
        self.tx.send(Command::Dispatch(request)).is_ok()
    }
}

/// Spawn the engine task for the given backend.
pub fn spawn(config: BackendConfig) -> (GatewayHandle, JoinHandle<Result<(), GatewayError>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let engine = Engine::new(config, rx);
    let task = tokio::spawn(engine.run());
    (GatewayHandle { tx }, task)
}

/// One bridged request, from creation until its end-request record.
struct ActiveRequest {
    id: u16,
    method: Method,
    target: String,
    params: Vec<(String, String)>,
    /// Taken when the request is dispatched; restored if it is returned to
    /// the pending queue before any stdin bytes went out.
    body: Option<BodyStream>,
    reply: Option<tokio::sync::oneshot::Sender<ResponseHead>>,
    body_tx: Option<mpsc::Sender<Result<Bytes, BridgeError>>>,
    assembler: ResponseAssembler,
    status: Option<StatusCode>,
    /// True once the terminating stdin record has been written.
    sent: bool,
    /// True once any stdin payload bytes have been written.
    body_started: bool,
    keep_alive: bool,
}

enum StdinChunk {
    Data(Bytes),
    End,
    Failed,
}

enum Event {
    Command(Option<Command>),
    Backend(std::io::Result<Bytes>),
    Stdin(u16, StdinChunk),
}

struct Engine {
    connector: BackendConnector,
    commands: mpsc::UnboundedReceiver<Command>,
    session: Option<BackendSession>,
    /// FIFO of requests waiting for dispatch.
    pending: VecDeque<ActiveRequest>,
    /// Requests with records on the wire, keyed by id. An id is never in
    /// both collections at once.
    in_flight: HashMap<u16, ActiveRequest>,
    /// Inbound body streams for dispatched requests still sending stdin.
    bodies: HashMap<u16, BodyStream>,
    ids: RequestIdAllocator,
}

/// Read the next chunk from the backend. An empty chunk signals EOF.
async fn read_backend(session: &mut Option<BackendSession>) -> std::io::Result<Bytes> {
    match session {
        Some(session) => {
            let mut buf = BytesMut::with_capacity(8 * 1024);
            session.reader.read_buf(&mut buf).await?;
            Ok(buf.freeze())
        }
        None => std::future::pending().await,
    }
}

/// Poll every active inbound body for its next chunk.
async fn next_stdin(bodies: &mut HashMap<u16, BodyStream>) -> (u16, StdinChunk) {
    std::future::poll_fn(|cx| {
        for (id, stream) in bodies.iter_mut() {
            match stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    return Poll::Ready((*id, StdinChunk::Data(chunk)))
                }
                Poll::Ready(Some(Err(err))) => {
                    tracing::warn!(request_id = *id, error = %err, "Inbound body failed");
                    return Poll::Ready((*id, StdinChunk::Failed));
                }
                Poll::Ready(None) => return Poll::Ready((*id, StdinChunk::End)),
                Poll::Pending => {}
            }
        }
        Poll::Pending
    })
    .await
}

impl Engine {
    fn new(config: BackendConfig, commands: mpsc::UnboundedReceiver<Command>) -> Self {
        Self {
            connector: BackendConnector::new(config),
            commands,
            session: None,
            pending: VecDeque::new(),
            in_flight: HashMap::new(),
            bodies: HashMap::new(),
            ids: RequestIdAllocator::new(),
        }
    }

    async fn run(mut self) -> Result<(), GatewayError> {
        // Connect eagerly so a dead socket path is reported at startup.
        self.session = Some(self.connector.connect().await?);

        loop {
            let event = {
                let connected = self.session.is_some();
                let feeding = connected && !self.bodies.is_empty();
                let commands = &mut self.commands;
                let session = &mut self.session;
                let bodies = &mut self.bodies;
                tokio::select! {
                    cmd = commands.recv() => Event::Command(cmd),
                    read = read_backend(session), if connected => Event::Backend(read),
                    (id, chunk) = next_stdin(bodies), if feeding => Event::Stdin(id, chunk),
                }
            };

            match event {
                // The HTTP side dropped every handle; nothing more will
                // arrive, so stop.
                Event::Command(None) => {
                    for (_, request) in self.in_flight.drain() {
                        abort_request(request, BridgeError::GatewayClosed);
                    }
                    return Ok(());
                }
                Event::Command(Some(Command::Dispatch(request))) => {
                    self.enqueue(request);
                    self.dispatch_pending().await?;
                }
                Event::Backend(Ok(chunk)) if chunk.is_empty() => {
                    // EOF. Check for a record cut off mid-stream first.
                    if let Some(session) = &self.session {
                        if let Err(err) = session.framer.finish() {
                            tracing::error!(error = %err, "Framing error on backend stream");
                        }
                    }
                    self.recover_connection().await?;
                    self.dispatch_pending().await?;
                }
                Event::Backend(Ok(chunk)) => self.on_backend_bytes(chunk).await?,
                Event::Backend(Err(err)) => {
                    tracing::error!(error = %err, "Backend read failed");
                    self.recover_connection().await?;
                    self.dispatch_pending().await?;
                }
                Event::Stdin(id, chunk) => self.on_stdin(id, chunk).await?,
            }
        }
    }

    fn enqueue(&mut self, request: BridgeRequest) {
        let in_flight = &self.in_flight;
        let pending = &self.pending;
        let id = self
            .ids
            .next_id(|id| in_flight.contains_key(&id) || pending.iter().any(|r| r.id == id));

        tracing::debug!(request_id = id, method = %request.method, target = %request.target, "Request queued");
        self.pending.push_back(ActiveRequest {
            id,
            method: request.method,
            target: request.target,
            params: request.params,
            body: request.body,
            reply: Some(request.reply),
            body_tx: None,
            assembler: ResponseAssembler::new(),
            status: None,
            sent: false,
            body_started: false,
            keep_alive: false,
        });
    }

    /// Promote pending requests while the dispatch policy allows it.
    async fn dispatch_pending(&mut self) -> Result<(), GatewayError> {
        loop {
            if self.pending.is_empty() {
                return Ok(());
            }
            // The connection is closed after each response on non-keep-alive
            // backends; reopen it now that there is work again.
            if self.session.is_none() {
                self.session = Some(self.connector.connect().await?);
            }
            let multiplexing = match &self.session {
                Some(session) => session.values.multiplexing(),
                None => return Ok(()),
            };
            if !multiplexing && !self.in_flight.is_empty() {
                // Postpone for a non-multiplexed backend.
                return Ok(());
            }

            let Some(mut request) = self.pending.pop_front() else {
                return Ok(());
            };
            request.keep_alive = multiplexing;
            match self.send_request(&mut request).await {
                Ok(()) => {
                    let id = request.id;
                    if let Some(body) = request.body.take() {
                        self.bodies.insert(id, body);
                    }
                    self.in_flight.insert(id, request);
                }
                Err(err) => {
                    // The socket died mid-send; nothing after the begin
                    // record is trusted, so requeue and rebuild.
                    tracing::warn!(request_id = request.id, error = %err, "Backend write failed");
                    self.pending.push_front(request);
                    self.recover_connection().await?;
                }
            }
        }
    }

    /// Write begin-request, params and, for body-less methods, the stdin
    /// terminator.
    async fn send_request(&mut self, request: &mut ActiveRequest) -> std::io::Result<()> {
        tracing::debug!(request_id = request.id, target = %request.target, "Dispatching to backend");

        let begin = codec::encode_begin_request(Role::Responder, request.keep_alive);
        self.write_record(RecordType::BeginRequest, request.id, &begin)
            .await?;

        let pairs = request
            .params
            .iter()
            .map(|(name, value)| (name.as_bytes(), value.as_bytes()));
        let encoded = codec::encode_params(pairs).map_err(codec_to_io)?;
        for chunk in encoded.chunks(MAX_CONTENT) {
            self.write_record(RecordType::Params, request.id, chunk).await?;
        }
        // End of params.
        self.write_record(RecordType::Params, request.id, &[]).await?;

        if request.body.is_none() {
            // Body-less method: terminate stdin immediately.
            self.write_record(RecordType::Stdin, request.id, &[]).await?;
            request.sent = true;
        }
        Ok(())
    }

    async fn write_record(
        &mut self,
        kind: RecordType,
        request_id: u16,
        body: &[u8],
    ) -> std::io::Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| std::io::Error::from(ErrorKind::NotConnected))?;
        let record = codec::encode_record(kind, request_id, body).map_err(codec_to_io)?;
        session.writer.write_all(&record).await
    }

    async fn on_stdin(&mut self, id: u16, chunk: StdinChunk) -> Result<(), GatewayError> {
        match chunk {
            StdinChunk::Data(bytes) => {
                // Marked before the write: a chunk pulled from the stream is
                // gone either way, so the request is no longer replayable.
                if let Some(request) = self.in_flight.get_mut(&id) {
                    request.body_started = true;
                }
                for window in bytes.chunks(MAX_CONTENT) {
                    if let Err(err) = self.write_record(RecordType::Stdin, id, window).await {
                        tracing::warn!(request_id = id, error = %err, "Stdin write failed");
                        self.recover_connection().await?;
                        return self.dispatch_pending().await;
                    }
                }
            }
            StdinChunk::End | StdinChunk::Failed => {
                self.bodies.remove(&id);
                if let Err(err) = self.write_record(RecordType::Stdin, id, &[]).await {
                    tracing::warn!(request_id = id, error = %err, "Stdin terminator write failed");
                    self.recover_connection().await?;
                    return self.dispatch_pending().await;
                }
                // The request now lives on the backend; resending it blindly
                // would risk duplicating side effects.
                if let Some(request) = self.in_flight.get_mut(&id) {
                    request.sent = true;
                    tracing::debug!(request_id = id, target = %request.target, "Request fully sent");
                }
            }
        }
        Ok(())
    }

    async fn on_backend_bytes(&mut self, chunk: Bytes) -> Result<(), GatewayError> {
        if let Some(session) = self.session.as_mut() {
            session.framer.write(chunk);
        }
        loop {
            let framed = match self.session.as_mut() {
                Some(session) => session.framer.next_record(),
                // The session was closed while applying a record.
                None => return Ok(()),
            };
            let Some((header, body)) = framed else {
                return Ok(());
            };
            match codec::decode_record(&header, body) {
                Ok(record) => self.apply_record(record.request_id, record.body).await?,
                Err(err) => {
                    // The byte stream is untrusted from here on.
                    tracing::error!(error = %err, "Record decode failed");
                    self.recover_connection().await?;
                    return self.dispatch_pending().await;
                }
            }
        }
    }

    async fn apply_record(&mut self, id: u16, body: RecordBody) -> Result<(), GatewayError> {
        if id == MANAGEMENT_REQUEST_ID {
            tracing::info!(record = ?body, "Ignoring management record");
            return Ok(());
        }
        if !self.in_flight.contains_key(&id) {
            tracing::error!(request_id = id, "Record for unknown request");
            return Ok(());
        }

        match body {
            RecordBody::Stderr(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                tracing::error!(request_id = id, "Backend error: {}", text.trim());
                Ok(())
            }
            RecordBody::Stdout(bytes) => self.on_stdout(id, bytes).await,
            RecordBody::EndRequest {
                app_status,
                protocol_status,
            } => self.on_end_request(id, app_status, protocol_status).await,
            other => {
                tracing::info!(request_id = id, record = ?other, "Unexpected record type");
                Ok(())
            }
        }
    }

    async fn on_stdout(&mut self, id: u16, bytes: Bytes) -> Result<(), GatewayError> {
        let (body_tx, forward) = {
            let Some(request) = self.in_flight.get_mut(&id) else {
                return Ok(());
            };
            let (head, forward) = request.assembler.push(bytes);
            if let Some(head) = head {
                request.status = Some(head.status);
                let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
                request.body_tx = Some(tx);
                if let Some(reply) = request.reply.take() {
                    // A closed reply channel means the client already went
                    // away; the backend request still runs to completion.
                    let _ = reply.send(ResponseHead {
                        status: head.status,
                        headers: head.headers,
                        body: rx,
                    });
                }
            }
            (request.body_tx.clone(), forward)
        };

        if let (Some(tx), Some(bytes)) = (body_tx, forward) {
            if tx.send(Ok(bytes)).await.is_err() {
                tracing::trace!(request_id = id, "Client gone, discarding response bytes");
            }
        }
        Ok(())
    }

    async fn on_end_request(
        &mut self,
        id: u16,
        app_status: u32,
        protocol_status: crate::fcgi::record::ProtocolStatus,
    ) -> Result<(), GatewayError> {
        let Some(mut request) = self.in_flight.remove(&id) else {
            return Ok(());
        };
        self.bodies.remove(&id);

        // Dropping the sender ends the response body stream.
        drop(request.body_tx.take());
        // Backend ended the request without producing any output.
        drop(request.reply.take());

        let status = request
            .status
            .map(|s| s.as_u16())
            .unwrap_or(0);
        tracing::info!(
            request_id = id,
            app_status,
            protocol_status = ?protocol_status,
            "{} {} {}",
            request.method,
            request.target,
            status
        );

        if request.keep_alive {
            // More queued work can go out on this connection right away.
            self.dispatch_pending().await
        } else {
            // Close our side; dispatch reopens the connection when needed.
            self.session = None;
            self.dispatch_pending().await
        }
    }

    /// Shared recovery path for socket close, read/write failures and
    /// framing/codec errors: settle bookkeeping, then reconnect. Callers
    /// resume dispatch afterwards.
    async fn recover_connection(&mut self) -> Result<(), GatewayError> {
        tracing::warn!("Backend connection lost");
        self.session = None;
        self.reclassify_in_flight();
        self.session = Some(self.connector.connect().await?);
        Ok(())
    }

    /// Return safe requests to the front of the pending queue and abort the
    /// rest.
    fn reclassify_in_flight(&mut self) {
        let mut ids: Vec<u16> = self.in_flight.keys().copied().collect();
        ids.sort_unstable();

        let mut aborted = 0;
        // Reverse so push_front leaves the retried requests in id order.
        for id in ids.into_iter().rev() {
            let Some(mut request) = self.in_flight.remove(&id) else {
                continue;
            };
            let body = self.bodies.remove(&id);

            if retry_is_safe(&request) {
                if request.sent {
                    tracing::info!(request_id = id, "Schedule retry GET request");
                }
                request.sent = false;
                request.body = body;
                request.assembler.reset();
                self.pending.push_front(request);
            } else {
                aborted += 1;
                tracing::warn!(
                    request_id = id,
                    method = %request.method,
                    target = %request.target,
                    "Aborting request caught in connection loss"
                );
                abort_request(request, BridgeError::BackendLost);
            }
        }

        if aborted > 0 {
            tracing::warn!(count = aborted, "Backend closed with sent in-flight requests");
        }
    }
}

/// A request may be replayed only when doing so cannot duplicate work the
/// backend already performed: it was never fully sent and no body bytes went
/// out, or its method is idempotent-safe (GET). A response whose headers
/// already reached the client cannot be restarted either way.
fn retry_is_safe(request: &ActiveRequest) -> bool {
    if request.assembler.head_emitted() {
        return false;
    }
    if request.method == Method::GET {
        return true;
    }
    !request.sent && !request.body_started
}

/// End the client response abruptly: an error on the body stream when one is
/// open, otherwise a dropped reply channel (→ 502).
fn abort_request(mut request: ActiveRequest, error: BridgeError) {
    if let Some(tx) = request.body_tx.take() {
        if let Err(mpsc::error::TrySendError::Full(rejected)) = tx.try_send(Err(error)) {
            // Channel full; deliver the error without stalling the engine.
            tokio::spawn(async move {
                let _ = tx.send(rejected).await;
            });
        }
    }
    drop(request.reply.take());
}

fn codec_to_io(err: CodecError) -> std::io::Error {
    std::io::Error::new(ErrorKind::InvalidInput, err)
}
