//! Per-link RSocket state machine.
//!
//! A [`Connection`] drives one transport: it performs the SETUP handshake,
//! owns the stream table, demultiplexes inbound frames, schedules keepalives,
//! accounts leases, and times out requests. The lifecycle is:
//! 1. Split the transport and spawn the writer task
//! 2. Client: emit SETUP (server: await it)
//! 3. Spawn the read loop and dispatch frames by type
//! 4. Client: schedule the keepalive ticker
//!
//! Outbound requests register a stream id in the table and resolve through a
//! oneshot channel when the dispatch loop sees the terminal frame. Exactly
//! one terminal outcome is delivered per stream.
//!
//! # Example
//!
//! ```ignore
//! use rsocket_client::{Connection, ConnectionOptions, Payload};
//!
//! let transport = rsocket_client::transport::connect_tcp("127.0.0.1", 7878).await?;
//! let connection = Connection::connect(transport, ConnectionOptions::default()).await?;
//! let response = connection.request(Payload::from_str(None, Some("ping"))).await?;
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::encoding::{EncodingPair, DEFAULT_ENCODING};
use crate::error::{RSocketError, Result};
use crate::lease::LeaseState;
use crate::metrics::{noop_recorder, Counter, MetricsRecorder};
use crate::protocol::{
    decode_frame, encode_frame, flags, ErrorCode, Frame, FrameBody, FrameBuffer, Payload,
    MAX_STREAM_ID,
};
use crate::socket::{BoxFuture, CancelHandle, RSocket, Response};
use crate::transport::{FramingMode, Transport};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Default keepalive period.
pub const DEFAULT_KEEPALIVE_MS: u32 = 1000;

/// Default maximum connection lifetime advertised in SETUP.
pub const DEFAULT_MAX_LIFETIME_MS: u32 = 10_000;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Options for a client connection.
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Keepalive period advertised in SETUP and used by the ticker.
    pub keepalive_ms: u32,
    /// Maximum lifetime advertised in SETUP.
    pub max_lifetime_ms: u32,
    /// Local timeout applied to every outbound request.
    pub request_timeout: Duration,
    /// Metadata encoding name negotiated in SETUP.
    pub metadata_encoding: String,
    /// Data encoding name negotiated in SETUP.
    pub data_encoding: String,
    /// Honor server-issued leases (sets the LEASE flag in SETUP).
    pub lease: bool,
    /// Request strict protocol interpretation (sets the STRICT flag).
    pub strict: bool,
    /// Payload carried by the SETUP frame.
    pub setup_payload: Payload,
    /// How inbound bytes map to frames.
    pub framing: FramingMode,
    /// Metrics sink; defaults to a no-op recorder.
    pub metrics: Arc<dyn MetricsRecorder>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            keepalive_ms: DEFAULT_KEEPALIVE_MS,
            max_lifetime_ms: DEFAULT_MAX_LIFETIME_MS,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            metadata_encoding: DEFAULT_ENCODING.to_string(),
            data_encoding: DEFAULT_ENCODING.to_string(),
            lease: false,
            strict: false,
            setup_payload: Payload::empty(),
            framing: FramingMode::Framed,
            metrics: noop_recorder(),
        }
    }
}

impl ConnectionOptions {
    pub fn keepalive_ms(mut self, keepalive_ms: u32) -> Self {
        self.keepalive_ms = keepalive_ms;
        self
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn lease(mut self, lease: bool) -> Self {
        self.lease = lease;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn setup_payload(mut self, setup_payload: Payload) -> Self {
        self.setup_payload = setup_payload;
        self
    }

    pub fn framing(mut self, framing: FramingMode) -> Self {
        self.framing = framing;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Periodic lease broadcasting for servers: a large budget on a short
/// interval keeps well-behaved clients available.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Budget granted per broadcast.
    pub budget: u32,
    /// TTL attached to each grant.
    pub ttl_ms: u32,
    /// Broadcast period.
    pub interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            budget: 1 << 30,
            ttl_ms: 10_000,
            interval: Duration::from_secs(5),
        }
    }
}

/// Options for a server connection.
#[derive(Clone)]
pub struct ServerOptions {
    /// How inbound bytes map to frames.
    pub framing: FramingMode,
    /// Broadcast leases on this schedule when set.
    pub lease: Option<LeaseConfig>,
    /// Metrics sink; defaults to a no-op recorder.
    pub metrics: Arc<dyn MetricsRecorder>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            framing: FramingMode::Framed,
            lease: None,
            metrics: noop_recorder(),
        }
    }
}

/// Future returned by a [`Responder`].
pub type ResponderFuture = BoxFuture<std::result::Result<Payload, (ErrorCode, String)>>;

/// Server-side handler answering inbound REQUEST_RESPONSE exchanges.
pub type Responder = Arc<dyn Fn(Payload) -> ResponderFuture + Send + Sync>;

/// One outstanding outbound request.
struct PendingStream {
    sender: oneshot::Sender<Result<Payload>>,
    /// Fragments accumulated across FOLLOWS frames.
    partial: Payload,
}

struct Shared {
    role: Role,
    writer: WriterHandle,
    streams: Mutex<HashMap<u32, PendingStream>>,
    /// Inbound fragment accumulation, keyed by stream id.
    inbound_partial: Mutex<HashMap<u32, Payload>>,
    /// Inbound requests whose responder is still running.
    active_requests: Mutex<HashSet<u32>>,
    /// Last allocated outbound id; client starts at 0, server at -1.
    latest_stream_id: AtomicI64,
    /// Client sent the LEASE flag; availability consults the lease.
    lease_honored: bool,
    lease: LeaseState,
    encodings: Mutex<EncodingPair>,
    /// Server: first SETUP accepted. Client: SETUP written.
    setup_done: AtomicBool,
    closed: AtomicBool,
    transport_alive: AtomicBool,
    close_tx: watch::Sender<bool>,
    lease_tx: watch::Sender<bool>,
    setup_tx: watch::Sender<bool>,
    request_timeout: Duration,
    responder: Option<Responder>,
    frames_sent: Arc<dyn Counter>,
    frames_received: Arc<dyn Counter>,
    requests: Arc<dyn Counter>,
}

/// A single RSocket connection over one transport.
pub struct Connection {
    shared: Arc<Shared>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Open a client connection: emit SETUP, start the keepalive ticker, and
    /// wait for readiness (the first LEASE when leases were requested).
    pub async fn connect<T: Transport>(transport: T, options: ConnectionOptions) -> Result<Self> {
        let encodings = EncodingPair::new(&options.metadata_encoding, &options.data_encoding);
        let connection = Self::start(
            transport,
            Role::Client,
            options.framing,
            options.request_timeout,
            options.lease,
            encodings,
            None,
            &options.metrics,
        );
        let shared = &connection.shared;

        // SETUP strictly precedes any other frame from the client.
        let mut setup_flags = flags::NONE;
        if options.lease {
            setup_flags |= flags::LEASE;
        }
        if options.strict {
            setup_flags |= flags::STRICT;
        }
        let setup = Frame::setup(
            options.keepalive_ms,
            options.max_lifetime_ms,
            &options.metadata_encoding,
            &options.data_encoding,
            setup_flags,
            options.setup_payload.clone(),
        );
        shared.send_frame(&setup).await?;
        shared.setup_done.store(true, Ordering::Release);

        spawn_keepalive(shared, options.keepalive_ms);

        if options.lease {
            // Not ready until the server grants the first lease.
            wait_for_flag(shared.lease_tx.subscribe(), shared.close_tx.subscribe()).await?;
        }

        debug!(role = "client", lease = options.lease, "connection ready");
        Ok(connection)
    }

    /// Accept a server connection: wait for the client's SETUP, bind the
    /// encodings it carries, then optionally broadcast leases.
    pub async fn accept<T: Transport>(
        transport: T,
        options: ServerOptions,
        responder: Responder,
    ) -> Result<Self> {
        let connection = Self::start(
            transport,
            Role::Server,
            options.framing,
            DEFAULT_REQUEST_TIMEOUT,
            false,
            EncodingPair::default(),
            Some(responder),
            &options.metrics,
        );
        let shared = &connection.shared;

        wait_for_flag(shared.setup_tx.subscribe(), shared.close_tx.subscribe()).await?;

        if let Some(lease) = options.lease {
            spawn_lease_broadcaster(shared, lease);
        }

        debug!(role = "server", "connection ready");
        Ok(connection)
    }

    #[allow(clippy::too_many_arguments)]
    fn start<T: Transport>(
        transport: T,
        role: Role,
        framing: FramingMode,
        request_timeout: Duration,
        lease_honored: bool,
        encodings: EncodingPair,
        responder: Option<Responder>,
        metrics: &Arc<dyn MetricsRecorder>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(transport);

        let writer_config = WriterConfig {
            coalesce: framing == FramingMode::Framed,
            ..WriterConfig::default()
        };
        let (writer, _writer_task) = spawn_writer_task(write_half, writer_config);

        let (close_tx, _) = watch::channel(false);
        let (lease_tx, _) = watch::channel(false);
        let (setup_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            role,
            writer,
            streams: Mutex::new(HashMap::new()),
            inbound_partial: Mutex::new(HashMap::new()),
            active_requests: Mutex::new(HashSet::new()),
            latest_stream_id: AtomicI64::new(match role {
                Role::Client => 0,
                Role::Server => -1,
            }),
            lease_honored,
            lease: LeaseState::new(),
            encodings: Mutex::new(encodings),
            setup_done: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            transport_alive: AtomicBool::new(true),
            close_tx,
            lease_tx,
            setup_tx,
            request_timeout,
            responder,
            frames_sent: metrics.counter("connection.frames_sent"),
            frames_received: metrics.counter("connection.frames_received"),
            requests: metrics.counter("connection.requests"),
        });

        let reader_shared = Arc::clone(&shared);
        let reader_task = tokio::spawn(async move {
            let reason = match read_loop(read_half, &reader_shared, framing).await {
                Ok(()) => "transport closed".to_string(),
                Err(e) => {
                    warn!("read loop error: {e}");
                    e.to_string()
                }
            };
            reader_shared.transport_alive.store(false, Ordering::Release);
            reader_shared.shutdown(&reason).await;
        });

        Self {
            shared,
            reader_task: Mutex::new(Some(reader_task)),
        }
    }

    /// The connection's role.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// The negotiated encoding pair (immutable once ready).
    pub fn encodings(&self) -> EncodingPair {
        self.shared.encodings.lock().expect("lock poisoned").clone()
    }

    /// Grant the peer a request budget (server only).
    pub async fn send_lease(&self, budget: u32, ttl_ms: u32) -> Result<()> {
        if self.shared.role != Role::Server {
            return Err(RSocketError::Protocol(
                "LEASE frames are server-issued".to_string(),
            ));
        }
        self.shared
            .send_frame(&Frame::lease(ttl_ms, budget, None))
            .await
    }

    /// Write a raw frame on this connection.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        self.shared.send_frame(frame).await
    }

    /// Number of streams currently in the table.
    pub fn pending_streams(&self) -> usize {
        self.shared.streams.lock().expect("lock poisoned").len()
    }
}

impl RSocket for Connection {
    fn request(&self, request: Payload) -> Response {
        Shared::start_request(&self.shared, request)
    }

    fn availability(&self) -> f64 {
        self.shared.availability()
    }

    fn close(&self) -> BoxFuture<()> {
        let shared = Arc::clone(&self.shared);
        let reader = self.reader_task.lock().expect("lock poisoned").take();
        Box::pin(async move {
            shared.shutdown("Connection closed").await;
            if let Some(task) = reader {
                task.abort();
            }
        })
    }

    fn closed(&self) -> BoxFuture<()> {
        let mut close_rx = self.shared.close_tx.subscribe();
        Box::pin(async move {
            loop {
                if *close_rx.borrow() {
                    return;
                }
                if close_rx.changed().await.is_err() {
                    return;
                }
            }
        })
    }
}

impl Shared {
    fn start_request(self: &Arc<Self>, payload: Payload) -> Response {
        let shared = Arc::clone(self);
        let cancel = CancelHandle::new();
        let request_cancel = cancel.clone();
        Response::from_future(cancel, async move {
            shared.do_request(payload, request_cancel).await
        })
    }

    async fn do_request(self: Arc<Self>, payload: Payload, cancel: CancelHandle) -> Result<Payload> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RSocketError::ConnectionClosed);
        }

        let stream_id = self.latest_stream_id.fetch_add(2, Ordering::AcqRel) + 2;
        if stream_id > MAX_STREAM_ID as i64 {
            self.shutdown("Stream ids exhausted").await;
            return Err(RSocketError::Protocol("Stream ids exhausted".to_string()));
        }
        let stream_id = stream_id as u32;

        if self.lease_honored {
            self.lease.use_one();
        }
        self.requests.increment();

        let (tx, rx) = oneshot::channel();
        self.streams.lock().expect("lock poisoned").insert(
            stream_id,
            PendingStream {
                sender: tx,
                partial: Payload::empty(),
            },
        );
        let guard = StreamGuard {
            shared: Arc::clone(&self),
            stream_id,
            armed: true,
        };

        let frame = Frame::request_response(stream_id, flags::NONE, payload);
        self.send_frame(&frame).await?;

        tokio::select! {
            outcome = rx => {
                guard.disarm();
                outcome.unwrap_or(Err(RSocketError::ConnectionClosed))
            }
            _ = tokio::time::sleep(self.request_timeout) => {
                // Expired: CANCEL goes out, the stream is removed, and any
                // later inbound frame for this id is discarded.
                guard.finish_with_cancel();
                Err(RSocketError::Timeout)
            }
            _ = cancel.cancelled() => {
                guard.finish_with_cancel();
                Err(RSocketError::Canceled("Cancelled by caller".to_string()))
            }
        }
    }

    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.frames_sent.increment();
        self.writer.send(encode_frame(frame)).await
    }

    /// Remove a stream and send CANCEL for it (local expiry or cancel).
    fn cancel_stream(&self, stream_id: u32) {
        if self
            .streams
            .lock()
            .expect("lock poisoned")
            .remove(&stream_id)
            .is_some()
        {
            let _ = self.writer.try_send(encode_frame(&Frame::cancel(stream_id)));
        }
    }

    fn availability(&self) -> f64 {
        if self.closed.load(Ordering::Acquire) || !self.transport_alive.load(Ordering::Acquire) {
            return 0.0;
        }
        if self.lease_honored {
            if self.lease.is_valid() {
                1.0
            } else {
                0.0
            }
        } else {
            1.0
        }
    }

    /// Tear the connection down exactly once: terminate every stream, drain
    /// the writer, and signal watchers.
    async fn shutdown(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(reason, "connection shutdown");
        self.fail_all_streams(reason);
        self.writer.shutdown().await;
        self.close_tx.send_replace(true);
    }

    fn fail_all_streams(&self, reason: &str) {
        let entries: Vec<(u32, PendingStream)> = self
            .streams
            .lock()
            .expect("lock poisoned")
            .drain()
            .collect();
        for (stream_id, entry) in entries {
            debug!(stream_id, "terminating stream: {reason}");
            let _ = entry
                .sender
                .send(Err(RSocketError::Connection(reason.to_string())));
        }
        self.inbound_partial.lock().expect("lock poisoned").clear();
        self.active_requests.lock().expect("lock poisoned").clear();
    }

    /// Route one decoded frame. An error return is connection-fatal.
    async fn dispatch(self: &Arc<Self>, frame: Frame) -> Result<()> {
        match &frame.body {
            FrameBody::Setup {
                metadata_encoding,
                data_encoding,
                ..
            } => self.on_setup(metadata_encoding, data_encoding).await,
            FrameBody::Lease { ttl_ms, budget } => {
                self.on_lease(*ttl_ms, *budget);
                Ok(())
            }
            FrameBody::Keepalive => self.on_keepalive(&frame).await,
            FrameBody::RequestResponse => self.on_request(frame).await,
            FrameBody::Response => {
                self.on_response(frame);
                Ok(())
            }
            FrameBody::Error { code } => self.on_error(*code, &frame),
            FrameBody::Cancel => {
                self.on_cancel(frame.stream_id);
                Ok(())
            }
        }
    }

    async fn on_setup(self: &Arc<Self>, metadata_encoding: &str, data_encoding: &str) -> Result<()> {
        match self.role {
            Role::Server => {
                if self.setup_done.swap(true, Ordering::AcqRel) {
                    // The first SETUP is authoritative; refuse the rest.
                    self.send_frame(&Frame::error(
                        0,
                        ErrorCode::RejectedSetup,
                        "Setup already accepted",
                    ))
                    .await?;
                    return Ok(());
                }
                let pair = EncodingPair::new(metadata_encoding, data_encoding);
                if !pair.is_supported() {
                    self.send_frame(&Frame::error(
                        0,
                        ErrorCode::UnsupportedSetup,
                        "Unsupported encoding",
                    ))
                    .await?;
                    return Err(RSocketError::Setup {
                        code: ErrorCode::UnsupportedSetup,
                        message: format!(
                            "Unsupported encoding pair {}/{}",
                            metadata_encoding, data_encoding
                        ),
                    });
                }
                *self.encodings.lock().expect("lock poisoned") = pair;
                debug!(metadata_encoding, data_encoding, "setup accepted");
                self.setup_tx.send_replace(true);
                Ok(())
            }
            Role::Client => Err(RSocketError::Protocol(
                "SETUP received on a client connection".to_string(),
            )),
        }
    }

    fn on_lease(&self, ttl_ms: u32, budget: u32) {
        if self.role != Role::Client {
            warn!("ignoring LEASE on a server connection");
            return;
        }
        debug!(budget, ttl_ms, "lease granted");
        self.lease.grant(budget, Duration::from_millis(ttl_ms as u64));
        self.lease_tx.send_replace(true);
    }

    async fn on_keepalive(&self, frame: &Frame) -> Result<()> {
        if frame.wants_keepalive_response() {
            self.send_frame(&Frame::keepalive(flags::NONE, frame.data.clone()))
                .await?;
        }
        Ok(())
    }

    async fn on_request(self: &Arc<Self>, frame: Frame) -> Result<()> {
        let stream_id = frame.stream_id;
        let Some(responder) = &self.responder else {
            self.send_frame(&Frame::error(
                stream_id,
                ErrorCode::Invalid,
                "No request handler",
            ))
            .await?;
            return Ok(());
        };

        let follows = frame.has_follows();
        let accumulated = {
            let mut partials = self.inbound_partial.lock().expect("lock poisoned");
            let mut accumulated = partials.remove(&stream_id).unwrap_or_default();
            merge_payload(&mut accumulated, frame.payload());
            if follows {
                partials.insert(stream_id, accumulated);
                return Ok(());
            }
            accumulated
        };

        self.active_requests
            .lock()
            .expect("lock poisoned")
            .insert(stream_id);

        let shared = Arc::clone(self);
        let future = responder(accumulated);
        tokio::spawn(async move {
            let result = future.await;
            // A CANCEL while the responder ran drops the outcome.
            if !shared
                .active_requests
                .lock()
                .expect("lock poisoned")
                .remove(&stream_id)
            {
                return;
            }
            let frame = match result {
                Ok(payload) => Frame::response(stream_id, flags::NONE, payload),
                Err((code, message)) => Frame::error(stream_id, code, &message),
            };
            if let Err(e) = shared.send_frame(&frame).await {
                debug!(stream_id, "response dropped: {e}");
            }
        });
        Ok(())
    }

    fn on_response(&self, frame: Frame) {
        let mut streams = self.streams.lock().expect("lock poisoned");
        let Some(entry) = streams.get_mut(&frame.stream_id) else {
            debug!(stream_id = frame.stream_id, "discarding frame for unknown stream");
            return;
        };

        if frame.has_follows() {
            merge_payload(&mut entry.partial, frame.payload());
            return;
        }

        let entry = streams.remove(&frame.stream_id).expect("entry exists");
        drop(streams);

        let mut payload = entry.partial;
        merge_payload(&mut payload, frame.payload());
        let _ = entry.sender.send(Ok(payload));
    }

    fn on_error(&self, code: ErrorCode, frame: &Frame) -> Result<()> {
        let message = frame.error_message();

        if frame.stream_id == 0 || code.is_connection_scoped() {
            // Setup and connection errors reach the named stream too, then
            // tear the connection down (the read loop exits on the error).
            if frame.stream_id != 0 {
                if let Some(entry) = self
                    .streams
                    .lock()
                    .expect("lock poisoned")
                    .remove(&frame.stream_id)
                {
                    let _ = entry
                        .sender
                        .send(Err(RSocketError::from_wire(code, message.clone())));
                }
            }
            return Err(RSocketError::from_wire(code, message));
        }

        match self
            .streams
            .lock()
            .expect("lock poisoned")
            .remove(&frame.stream_id)
        {
            Some(entry) => {
                let _ = entry.sender.send(Err(RSocketError::from_wire(code, message)));
            }
            None => debug!(
                stream_id = frame.stream_id,
                "discarding error for unknown stream"
            ),
        }
        Ok(())
    }

    fn on_cancel(&self, stream_id: u32) {
        // Server side: drop the in-flight responder outcome and fragments.
        self.active_requests
            .lock()
            .expect("lock poisoned")
            .remove(&stream_id);
        self.inbound_partial
            .lock()
            .expect("lock poisoned")
            .remove(&stream_id);

        // Client side: the peer cancelled one of our streams.
        if let Some(entry) = self
            .streams
            .lock()
            .expect("lock poisoned")
            .remove(&stream_id)
        {
            let _ = entry
                .sender
                .send(Err(RSocketError::Canceled("Cancelled by peer".to_string())));
        }
    }
}

/// Removes the stream entry if the request future is dropped before a
/// terminal outcome, so the table never leaks abandoned streams.
struct StreamGuard {
    shared: Arc<Shared>,
    stream_id: u32,
    armed: bool,
}

impl StreamGuard {
    fn disarm(mut self) {
        self.armed = false;
    }

    fn finish_with_cancel(mut self) {
        self.armed = false;
        self.shared.cancel_stream(self.stream_id);
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if self.armed {
            self.shared.cancel_stream(self.stream_id);
        }
    }
}

/// Main read loop: bytes in, frames dispatched.
async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    shared: &Arc<Shared>,
    framing: FramingMode,
) -> Result<()> {
    let mut framer = FrameBuffer::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) => return Err(RSocketError::Io(e)),
        };

        let frames = match framing {
            FramingMode::Framed => framer.push(&buf[..n])?,
            // Message transports deliver exactly one frame per chunk.
            FramingMode::Messages => vec![decode_frame(&buf[..n])?],
        };

        for frame in frames {
            shared.frames_received.increment();
            shared.dispatch(frame).await?;
        }
    }
}

fn spawn_keepalive(shared: &Arc<Shared>, keepalive_ms: u32) {
    let shared = Arc::clone(shared);
    let mut close_rx = shared.close_tx.subscribe();
    tokio::spawn(async move {
        let period = Duration::from_millis(keepalive_ms.max(1) as u64);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let frame = Frame::keepalive(flags::KEEPALIVE_RESPONSE, None);
                    if shared.send_frame(&frame).await.is_err() {
                        break;
                    }
                }
                _ = close_rx.changed() => break,
            }
        }
    });
}

fn spawn_lease_broadcaster(shared: &Arc<Shared>, config: LeaseConfig) {
    let shared = Arc::clone(shared);
    let mut close_rx = shared.close_tx.subscribe();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let frame = Frame::lease(config.ttl_ms, config.budget, None);
                    if shared.send_frame(&frame).await.is_err() {
                        break;
                    }
                }
                _ = close_rx.changed() => break,
            }
        }
    });
}

/// Wait for a readiness flag, failing if the connection closes first.
async fn wait_for_flag(
    mut flag_rx: watch::Receiver<bool>,
    mut close_rx: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        if *flag_rx.borrow() {
            return Ok(());
        }
        if *close_rx.borrow() {
            return Err(RSocketError::ConnectionClosed);
        }
        tokio::select! {
            changed = flag_rx.changed() => {
                if changed.is_err() {
                    return Err(RSocketError::ConnectionClosed);
                }
            }
            changed = close_rx.changed() => {
                if changed.is_err() || *close_rx.borrow() {
                    return Err(RSocketError::ConnectionClosed);
                }
            }
        }
    }
}

fn merge_payload(base: &mut Payload, next: Payload) {
    base.metadata = concat_blocks(base.metadata.take(), next.metadata);
    base.data = concat_blocks(base.data.take(), next.data);
}

fn concat_blocks(first: Option<Bytes>, second: Option<Bytes>) -> Option<Bytes> {
    match (first, second) {
        (None, second) => second,
        (first, None) => first,
        (Some(first), Some(second)) => {
            let mut joined = BytesMut::with_capacity(first.len() + second.len());
            joined.extend_from_slice(&first);
            joined.extend_from_slice(&second);
            Some(joined.freeze())
        }
    }
}
