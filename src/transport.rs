//! Transport core: connection lifecycle, the public API, go-away
//! coordination, and failure fan-out.
//!
//! A transport is single-use: construct, `start`, issue calls, `shutdown`.
//! The writer thread doubles as the serializing executor. It performs the
//! connect/negotiate work first, then drains write commands in submission
//! order, so stream creation enqueued before the connection is up simply
//! waits its turn. A dedicated reader thread runs the frame dispatcher.
//!
//! All shared state sits behind one mutex. Listener and user callbacks are
//! never invoked while it is held, and no socket I/O happens under it; the
//! write queue may be appended to under the lock because it never blocks.

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;

use bytes::Bytes;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::codec::{ErrorCode, FrameWriter, Http2Settings, Variant};
use crate::dispatcher;
use crate::flow::{OutboundFlow, PendingData, StreamOutboundFlow, DEFAULT_WINDOW_SIZE};
use crate::metadata::{create_request_headers, Metadata};
use crate::method::MethodDescriptor;
use crate::negotiator::{Negotiated, Negotiator, SocketHandle};
use crate::ping::{OutstandingPing, PingCallback};
use crate::registry::{StreamRegistry, MAX_STREAM_ID};
use crate::status::{Code, Status};
use crate::stream::{ClientStream, StreamListener};
use crate::write_queue::{self, complete, Submission, WriteCmd, WriteQueue};

/// Observes the transport's lifecycle.
///
/// `transport_shutdown` is delivered exactly once and always before
/// `transport_terminated`.
pub trait TransportListener: Send + Sync {
    /// The connection is up and the server's first SETTINGS arrived.
    fn transport_ready(&self);

    /// The transport began going away; no new streams will be accepted.
    fn transport_shutdown(&self, status: &Status);

    /// All streams have finished and no more I/O will occur.
    fn transport_terminated(&self);
}

/// Coarse lifecycle state, derived for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Ready,
    GoingAway,
    Terminated,
}

/// Transport construction limits.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Upper bound on bytes a stream may hold undrained by its listener.
    pub max_message_size: usize,
    /// Inbound window advertised per stream.
    pub initial_window_size: u32,
    /// MAX_HEADER_LIST_SIZE advertised in the initial SETTINGS.
    pub max_header_list_size: u32,
    /// First stream id to assign. The default of 3 leaves stream 1 reserved
    /// for an HTTP/1.1 Upgrade response.
    pub start_stream_id: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_size: 4 * 1024 * 1024,
            initial_window_size: DEFAULT_WINDOW_SIZE as u32,
            max_header_list_size: 8192,
            start_stream_id: 3,
        }
    }
}

/// Client-side HTTP/2 transport: one connection, many multiplexed calls.
pub struct Http2Transport {
    inner: Arc<TransportInner>,
}

impl Http2Transport {
    pub fn new(
        addr: SocketAddr,
        authority: impl Into<String>,
        negotiator: Arc<dyn Negotiator>,
        variant: Arc<dyn Variant>,
        config: TransportConfig,
    ) -> Self {
        let (queue, writer_rx) = WriteQueue::new();
        let start_stream_id = config.start_stream_id;
        Self {
            inner: Arc::new(TransportInner {
                addr,
                authority: authority.into(),
                config,
                negotiator,
                variant,
                queue,
                writer_rx: Mutex::new(Some(writer_rx)),
                listener: OnceLock::new(),
                started: AtomicBool::new(false),
                reader_started: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                shared: Mutex::new(Shared {
                    registry: StreamRegistry::new(start_stream_id),
                    conn_flow: OutboundFlow::default(),
                    initial_send_window: DEFAULT_WINDOW_SIZE,
                    ready: false,
                    go_away: false,
                    started_go_away: false,
                    go_away_status: None,
                    stopped: false,
                    ping: None,
                }),
            }),
        }
    }

    /// Begin the asynchronous connect. One-shot; later calls are ignored.
    pub fn start(&self, listener: Arc<dyn TransportListener>) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!("transport already started, ignoring");
            return;
        }
        let _ = self.inner.listener.set(listener);
        let rx = self.inner.writer_rx.lock().take();
        if let Some(rx) = rx {
            // The writer holds only a weak reference: the queue's sender
            // lives inside TransportInner, so a strong reference here would
            // keep the channel connected and this thread alive forever.
            let inner = Arc::downgrade(&self.inner);
            let _ = thread::Builder::new()
                .name("h2-transport-writer".into())
                .spawn(move || writer_thread(inner, rx));
        }
    }

    /// Create a stream for `method`. Returns immediately; admission runs on
    /// the write queue so it observes connection readiness and wire-level
    /// ordering. A rejected stream reports its status through `listener`.
    pub fn new_stream(
        &self,
        method: MethodDescriptor,
        mut metadata: Metadata,
        listener: Box<dyn StreamListener>,
    ) -> Arc<ClientStream> {
        let path = method.path();
        let headers = create_request_headers(
            &mut metadata,
            &path,
            &self.inner.authority,
            self.inner.negotiator.scheme(),
        );
        let stream = Arc::new(ClientStream::new(
            method,
            listener,
            Arc::downgrade(&self.inner),
            headers,
            self.inner.config.initial_window_size as i32,
            self.inner.config.max_message_size,
        ));
        self.inner
            .queue
            .enqueue(WriteCmd::CreateStream(stream.clone()));
        stream
    }

    /// Measure a PING round-trip. At most one PING is outstanding; a caller
    /// arriving while one is in flight shares its sample.
    pub fn ping(&self, callback: PingCallback) {
        self.inner.ping(callback);
    }

    /// Graceful shutdown: emit GOAWAY and let active streams finish.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Derived lifecycle state.
    pub fn state(&self) -> TransportState {
        self.inner.state()
    }

    /// Snapshot of the currently active streams.
    pub fn active_streams(&self) -> Vec<Arc<ClientStream>> {
        self.inner.shared.lock().registry.snapshot()
    }

    /// Number of streams waiting for admission.
    pub fn pending_stream_count(&self) -> usize {
        self.inner.shared.lock().registry.pending_count()
    }
}

impl fmt::Display for Http2Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Http2Transport({})", self.inner.addr)
    }
}

struct Shared {
    registry: StreamRegistry,
    conn_flow: OutboundFlow,
    /// Peer's INITIAL_WINDOW_SIZE; seeds each started stream's window.
    initial_send_window: i32,
    ready: bool,
    /// Post-transition state: no new streams, existing ones may continue.
    go_away: bool,
    /// In-progress marker, set before `transport_shutdown` is delivered so a
    /// concurrent terminator cannot observe TERMINATED before SHUTDOWN.
    started_go_away: bool,
    go_away_status: Option<Status>,
    stopped: bool,
    ping: Option<OutstandingPing>,
}

pub(crate) struct TransportInner {
    addr: SocketAddr,
    authority: String,
    config: TransportConfig,
    negotiator: Arc<dyn Negotiator>,
    variant: Arc<dyn Variant>,
    queue: WriteQueue,
    writer_rx: Mutex<Option<Receiver<Submission>>>,
    listener: OnceLock<Arc<dyn TransportListener>>,
    started: AtomicBool,
    reader_started: AtomicBool,
    terminated: AtomicBool,
    shared: Mutex<Shared>,
}

impl TransportInner {
    pub(crate) fn enqueue(&self, cmd: WriteCmd) {
        self.queue.enqueue(cmd);
    }

    pub(crate) fn get_stream(&self, stream_id: u32) -> Option<Arc<ClientStream>> {
        self.shared.lock().registry.get(stream_id).cloned()
    }

    pub(crate) fn may_have_created_stream(&self, stream_id: u32) -> bool {
        self.shared.lock().registry.may_have_created(stream_id)
    }

    fn state(&self) -> TransportState {
        if self.terminated.load(Ordering::SeqCst) {
            return TransportState::Terminated;
        }
        let shared = self.shared.lock();
        if shared.started_go_away || shared.go_away {
            TransportState::GoingAway
        } else if shared.ready {
            TransportState::Ready
        } else if self.started.load(Ordering::SeqCst) {
            TransportState::Connecting
        } else {
            TransportState::New
        }
    }

    fn shutdown(&self) {
        {
            let shared = self.shared.lock();
            if shared.go_away {
                return;
            }
        }
        // lastGoodStreamId of 0: no server-initiated streams are expected.
        self.queue.enqueue(WriteCmd::GoAway {
            last_good_stream_id: 0,
            error_code: ErrorCode::NoError,
            debug_data: Vec::new(),
        });
        // MAX_STREAM_ID keeps every active stream alive until it completes
        // naturally.
        self.start_go_away(MAX_STREAM_ID, Status::unavailable("Transport stopped"));
    }

    fn ping(&self, callback: PingCallback) {
        let mut callback = Some(callback);
        let mut failure = None;
        let mut payload_to_send = None;
        {
            let mut shared = self.shared.lock();
            if shared.stopped {
                failure = Some(ping_failure_status(&shared));
            } else if let Some(outstanding) = shared.ping.as_mut() {
                if let Some(callback) = callback.take() {
                    outstanding.add_callback(callback);
                }
            } else {
                let payload = rand::random::<u64>();
                let mut outstanding = OutstandingPing::new(payload);
                if let Some(callback) = callback.take() {
                    outstanding.add_callback(callback);
                }
                shared.ping = Some(outstanding);
                payload_to_send = Some(payload);
            }
        }
        if let (Some(status), Some(callback)) = (failure, callback.take()) {
            callback(Err(status));
        }
        if let Some(payload) = payload_to_send {
            self.queue.enqueue(WriteCmd::Ping {
                ack: false,
                payload,
            });
        }
    }

    pub(crate) fn complete_ping(&self, payload: u64) {
        let completed = {
            let mut shared = self.shared.lock();
            match shared.ping.take() {
                Some(outstanding) if outstanding.payload() == payload => Some(outstanding),
                Some(outstanding) => {
                    warn!(
                        expected = outstanding.payload(),
                        got = payload,
                        "received unexpected ping ack"
                    );
                    shared.ping = Some(outstanding);
                    None
                }
                None => {
                    warn!("received ping ack but no ping outstanding");
                    None
                }
            }
        };
        if let Some(outstanding) = completed {
            outstanding.complete();
        }
    }

    /// Finish all active streams and tear the transport down after an I/O
    /// failure.
    pub(crate) fn on_exception(&self, cause: io::Error) {
        warn!(error = %cause, "transport failed");
        self.start_go_away(
            0,
            Status::from_code(Code::Unavailable).with_cause(cause.to_string()),
        );
    }

    /// Send GOAWAY for a locally detected protocol error, then tear down.
    pub(crate) fn on_error(&self, error_code: ErrorCode, detail: &str) {
        self.queue.enqueue(WriteCmd::GoAway {
            last_good_stream_id: 0,
            error_code,
            debug_data: Vec::new(),
        });
        self.start_go_away(
            0,
            dispatcher::status_for_rst_code(error_code).augment_description(detail),
        );
    }

    pub(crate) fn start_go_away(&self, last_known_stream_id: u32, status: Status) {
        {
            let mut shared = self.shared.lock();
            if shared.started_go_away {
                return;
            }
            // Flip the in-progress marker before go_away itself: once
            // go_away is visible, stop_if_necessary on another thread may
            // terminate the transport, and transport_terminated must not
            // outrun the transport_shutdown call below.
            shared.started_go_away = true;
        }

        if let Some(listener) = self.listener.get() {
            listener.transport_shutdown(&status);
        }

        let (removed, pending) = {
            let mut shared = self.shared.lock();
            shared.go_away = true;
            shared.go_away_status = Some(status.clone());
            let removed = shared.registry.remove_above(last_known_stream_id);
            let pending = shared.registry.take_pending();
            (removed, pending)
        };
        for stream in removed {
            stream.report_status(status.clone(), false);
        }
        for stream in pending {
            stream.report_status(status.clone(), true);
        }

        self.stop_if_necessary();
    }

    /// Once go-away is underway and the last stream is gone, close the
    /// writer (which closes the socket and thereby unblocks the reader) and
    /// fail any outstanding ping.
    pub(crate) fn stop_if_necessary(&self) {
        let failed_ping = {
            let mut shared = self.shared.lock();
            if !shared.go_away || !shared.registry.is_empty() || shared.stopped {
                return;
            }
            shared.stopped = true;
            self.queue.enqueue(WriteCmd::Close);
            shared.ping.take().map(|ping| (ping, ping_failure_status(&shared)))
        };
        if let Some((ping, status)) = failed_ping {
            ping.fail(status);
        }
    }

    pub(crate) fn notify_ready(&self) {
        if let Some(listener) = self.listener.get() {
            listener.transport_ready();
        }
    }

    pub(crate) fn notify_terminated(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(listener) = self.listener.get() {
            listener.transport_terminated();
        }
    }

    /// Remove a stream from the registry, optionally resetting it on the
    /// wire and reporting its terminal status, then admit pending streams or
    /// stop the transport if this was the last one under go-away.
    pub(crate) fn finish_stream(
        &self,
        stream_id: u32,
        status: Option<Status>,
        error_code: Option<ErrorCode>,
    ) {
        let (stream, started_any, exhausted) = {
            let mut shared = self.shared.lock();
            let stream = match shared.registry.remove(stream_id) {
                Some(stream) => stream,
                None => return,
            };
            if let Some(error_code) = error_code {
                self.queue.enqueue(WriteCmd::RstStream {
                    stream_id,
                    error_code,
                });
            }
            let (started_any, exhausted) = self.start_pending_locked(&mut shared);
            (stream, started_any, exhausted)
        };
        if let Some(status) = status {
            let stop_delivery =
                matches!(status.code(), Code::Cancelled | Code::DeadlineExceeded);
            stream.report_status(status, stop_delivery);
        }
        if exhausted {
            self.start_go_away(MAX_STREAM_ID, Status::internal("Stream ids exhausted"));
        }
        if !started_any {
            self.stop_if_necessary();
        }
    }

    /// Admission for a newly created stream; runs on the writer thread.
    pub(crate) fn handle_create_stream(&self, stream: Arc<ClientStream>) {
        enum Admission {
            Rejected(Status),
            Admitted { exhausted: bool },
            Queued,
        }
        let admission = {
            let mut shared = self.shared.lock();
            if stream.is_terminated() {
                // Cancelled while queued for admission.
                Admission::Queued
            } else if shared.go_away {
                Admission::Rejected(
                    shared
                        .go_away_status
                        .clone()
                        .unwrap_or_else(|| Status::unavailable("Transport stopped")),
                )
            } else if !shared.registry.has_capacity() {
                shared.registry.push_pending(stream.clone());
                Admission::Queued
            } else {
                let exhausted = self.start_stream_locked(&mut shared, &stream);
                Admission::Admitted { exhausted }
            }
        };
        match admission {
            Admission::Rejected(status) => stream.report_status(status, true),
            Admission::Admitted { exhausted } => {
                if exhausted {
                    self.start_go_away(
                        MAX_STREAM_ID,
                        Status::internal("Stream ids exhausted"),
                    );
                }
            }
            Admission::Queued => {}
        }
    }

    /// Assign an id, register the stream, and enqueue its HEADERS (plus any
    /// buffered body). Id assignment and HEADERS submission happen under the
    /// same lock acquisition, which is what keeps ids and wire order
    /// consistent. Returns whether the id space is exhausted.
    fn start_stream_locked(&self, shared: &mut Shared, stream: &Arc<ClientStream>) -> bool {
        let (id, exhausted) = shared.registry.assign_and_insert(stream.clone());
        let mut inner = stream.lock();
        inner.id = id;
        inner.flow = StreamOutboundFlow::new(shared.initial_send_window);
        let headers = inner.request_headers.take().unwrap_or_default();
        self.queue.enqueue_for_stream(
            WriteCmd::Headers {
                stream_id: id,
                headers,
                end_stream: false,
            },
            stream.clone(),
        );
        let buffered: Vec<PendingData> = inner.pending_out.drain(..).collect();
        for pending in buffered {
            let chunks = inner
                .flow
                .send(pending.payload, pending.end_stream, &mut shared.conn_flow);
            for chunk in chunks {
                self.queue.enqueue_for_stream(
                    WriteCmd::Data {
                        stream_id: id,
                        payload: chunk.payload,
                        end_stream: chunk.end_stream,
                    },
                    stream.clone(),
                );
            }
        }
        drop(inner);
        // A single-message client will enqueue DATA momentarily; everyone
        // else gets their HEADERS flushed now.
        if !stream.method().method_type().client_sends_one_message() {
            self.queue.enqueue(WriteCmd::Flush);
        }
        exhausted
    }

    /// Start pending streams in FIFO order while capacity remains. Returns
    /// (whether any stream started, whether the id space is exhausted).
    fn start_pending_locked(&self, shared: &mut Shared) -> (bool, bool) {
        let mut started_any = false;
        while shared.registry.has_capacity() {
            let stream = match shared.registry.pop_pending() {
                Some(stream) => stream,
                None => break,
            };
            if stream.is_terminated() {
                continue;
            }
            started_any = true;
            if self.start_stream_locked(shared, &stream) {
                return (started_any, true);
            }
        }
        (started_any, false)
    }

    pub(crate) fn remove_pending(&self, stream: &ClientStream) {
        self.shared.lock().registry.remove_pending(stream);
    }

    /// Flow-controlled send for a stream; buffers locally if the stream has
    /// not started yet.
    pub(crate) fn stream_send(&self, stream: &ClientStream, payload: Bytes, end_stream: bool) {
        let mut shared = self.shared.lock();
        let shared = &mut *shared;
        let mut inner = stream.lock();
        if inner.status.is_some() || inner.out_closed {
            return;
        }
        if end_stream {
            inner.out_closed = true;
        }
        if inner.id == 0 {
            inner.pending_out.push_back(PendingData {
                payload,
                end_stream,
            });
            return;
        }
        let stream_id = inner.id;
        let chunks = inner.flow.send(payload, end_stream, &mut shared.conn_flow);
        drop(inner);
        let stream = shared.registry.get(stream_id).cloned();
        for chunk in chunks {
            let cmd = WriteCmd::Data {
                stream_id,
                payload: chunk.payload,
                end_stream: chunk.end_stream,
            };
            match &stream {
                Some(stream) => self.queue.enqueue_for_stream(cmd, stream.clone()),
                None => self.queue.enqueue(cmd),
            }
        }
    }

    /// Apply a SETTINGS frame from the peer. Returns whether this was the
    /// first SETTINGS (i.e. the transport just became ready).
    pub(crate) fn apply_remote_settings(&self, settings: &Http2Settings) -> bool {
        let (first, exhausted) = {
            let mut shared = self.shared.lock();
            let shared = &mut *shared;
            if let Some(max) = settings.max_concurrent_streams {
                shared.registry.set_max_concurrent(max);
            }
            if let Some(window) = settings.initial_window_size {
                self.apply_initial_window_locked(shared, window);
            }
            let exhausted = if settings.max_concurrent_streams.is_some() {
                self.start_pending_locked(shared).1
            } else {
                false
            };
            let first = !shared.ready;
            shared.ready = true;
            (first, exhausted)
        };
        if exhausted {
            self.start_go_away(MAX_STREAM_ID, Status::internal("Stream ids exhausted"));
        }
        first
    }

    /// Rebase every stream's outbound window on a new INITIAL_WINDOW_SIZE.
    fn apply_initial_window_locked(&self, shared: &mut Shared, new_size: u32) {
        let new_size = new_size.min(MAX_STREAM_ID) as i32;
        let delta = new_size - shared.initial_send_window;
        shared.initial_send_window = new_size;
        if delta == 0 {
            return;
        }
        for stream_id in shared.registry.ids_sorted() {
            let stream = match shared.registry.get(stream_id) {
                Some(stream) => stream.clone(),
                None => continue,
            };
            let mut inner = stream.lock();
            inner.flow.adjust(delta);
            if delta > 0 {
                let chunks = inner.flow.drain(&mut shared.conn_flow);
                drop(inner);
                for chunk in chunks {
                    self.queue.enqueue_for_stream(
                        WriteCmd::Data {
                            stream_id,
                            payload: chunk.payload,
                            end_stream: chunk.end_stream,
                        },
                        stream.clone(),
                    );
                }
            }
        }
    }

    /// Credit the connection window and greedily drain blocked streams in
    /// id order.
    pub(crate) fn handle_conn_window_update(&self, increment: u32) {
        let mut shared = self.shared.lock();
        let shared = &mut *shared;
        shared.conn_flow.credit(increment);
        for stream_id in shared.registry.ids_sorted() {
            if shared.conn_flow.available() == 0 {
                break;
            }
            let stream = match shared.registry.get(stream_id) {
                Some(stream) => stream.clone(),
                None => continue,
            };
            let mut inner = stream.lock();
            if !inner.flow.has_queued() {
                continue;
            }
            let chunks = inner.flow.drain(&mut shared.conn_flow);
            drop(inner);
            for chunk in chunks {
                self.queue.enqueue_for_stream(
                    WriteCmd::Data {
                        stream_id,
                        payload: chunk.payload,
                        end_stream: chunk.end_stream,
                    },
                    stream.clone(),
                );
            }
        }
    }

    /// Credit one stream's window. Returns false when the stream is unknown
    /// and was never created, which the caller treats as a protocol error.
    pub(crate) fn handle_stream_window_update(&self, stream_id: u32, increment: u32) -> bool {
        let mut shared = self.shared.lock();
        let shared = &mut *shared;
        match shared.registry.get(stream_id) {
            Some(stream) => {
                let stream = stream.clone();
                let mut inner = stream.lock();
                inner.flow.credit(increment);
                let chunks = inner.flow.drain(&mut shared.conn_flow);
                drop(inner);
                for chunk in chunks {
                    self.queue.enqueue_for_stream(
                        WriteCmd::Data {
                            stream_id,
                            payload: chunk.payload,
                            end_stream: chunk.end_stream,
                        },
                        stream.clone(),
                    );
                }
                true
            }
            None => shared.registry.may_have_created(stream_id),
        }
    }
}

fn ping_failure_status(shared: &Shared) -> Status {
    shared
        .go_away_status
        .clone()
        .unwrap_or_else(|| Status::unavailable("Connection closed"))
}

fn initial_settings(config: &TransportConfig) -> Http2Settings {
    let mut settings = Http2Settings::default();
    settings.max_header_list_size = Some(config.max_header_list_size);
    if config.initial_window_size != DEFAULT_WINDOW_SIZE as u32 {
        settings.initial_window_size = Some(config.initial_window_size);
    }
    settings
}

/// Connect and negotiate. Returns `Ok(None)` when shutdown() raced the
/// connect, in which case the fresh socket is closed here.
fn connect(inner: &Arc<TransportInner>) -> io::Result<Option<Negotiated>> {
    let socket = TcpStream::connect(inner.addr)?;
    socket.set_nodelay(true)?;
    let negotiated = inner.negotiator.negotiate(socket, &inner.authority)?;
    let mut shared = inner.shared.lock();
    if shared.stopped {
        let _ = negotiated.socket.close();
        return Ok(None);
    }
    // The real limit arrives with the server's SETTINGS.
    shared.registry.set_max_concurrent(u32::MAX);
    Ok(Some(negotiated))
}

fn writer_thread(inner: Weak<TransportInner>, rx: Receiver<Submission>) {
    let mut writer: Option<Box<dyn FrameWriter>> = None;
    let mut socket: Option<Box<dyn SocketHandle>> = None;
    let mut broken = false;

    if let Some(transport) = inner.upgrade() {
        match connect(&transport) {
            Ok(Some(negotiated)) => {
                let Negotiated {
                    reader,
                    writer: sink,
                    socket: socket_handle,
                } = negotiated;
                let mut frame_writer = transport.variant.new_writer(sink);
                // Preface and initial SETTINGS go out on this thread, ahead
                // of any queued stream work.
                let startup = frame_writer
                    .connection_preface()
                    .and_then(|_| frame_writer.settings(&initial_settings(&transport.config)))
                    .and_then(|_| frame_writer.flush());
                match startup {
                    Ok(()) => {
                        writer = Some(frame_writer);
                        socket = Some(socket_handle);
                        let frame_reader = transport.variant.new_reader(reader);
                        transport.reader_started.store(true, Ordering::SeqCst);
                        let reader_transport = transport.clone();
                        let spawned = thread::Builder::new()
                            .name("h2-transport-reader".into())
                            .spawn(move || {
                                dispatcher::run_reader(reader_transport, frame_reader)
                            });
                        if let Err(cause) = spawned {
                            transport.reader_started.store(false, Ordering::SeqCst);
                            broken = true;
                            transport.on_exception(cause);
                        }
                    }
                    Err(cause) => {
                        socket = Some(socket_handle);
                        broken = true;
                        transport.on_exception(cause);
                    }
                }
            }
            Ok(None) => {
                broken = true;
            }
            Err(cause) => {
                broken = true;
                transport.on_exception(cause);
            }
        }
    } else {
        broken = true;
    }

    // Drain commands for the life of the transport; the channel disconnects
    // once every strong reference (public handle, reader thread) is gone.
    // After a failure the writer stays in place so Close can still tear the
    // socket down, but every frame command resolves with an error.
    loop {
        let Submission { cmd, done } = match rx.recv() {
            Ok(submission) => submission,
            Err(_) => break,
        };
        let transport = inner.upgrade();
        match cmd {
            WriteCmd::CreateStream(stream) => {
                match &transport {
                    Some(transport) => transport.handle_create_stream(stream),
                    None => stream.report_status(Status::unavailable("Transport stopped"), true),
                }
                complete(done, Ok(()));
            }
            WriteCmd::Close => {
                if let Some(mut frame_writer) = writer.take() {
                    let _ = frame_writer.close();
                }
                if let Some(socket_handle) = socket.take() {
                    let _ = socket_handle.close();
                }
                broken = true;
                // Without a reader thread, terminating falls to us.
                if let Some(transport) = &transport {
                    if !transport.reader_started.load(Ordering::SeqCst) {
                        transport.notify_terminated();
                    }
                }
                complete(done, Ok(()));
            }
            cmd => match writer.as_deref_mut() {
                Some(frame_writer) if !broken => {
                    match write_queue::execute(frame_writer, &cmd) {
                        Ok(()) => {
                            if rx.is_empty() {
                                let _ = frame_writer.flush();
                            }
                            complete(done, Ok(()));
                        }
                        Err(cause) => {
                            broken = true;
                            complete(
                                done,
                                Err(io::Error::new(cause.kind(), cause.to_string())),
                            );
                            if let Some(transport) = &transport {
                                transport.on_exception(cause);
                            }
                        }
                    }
                }
                _ => complete(
                    done,
                    Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "connection closed",
                    )),
                ),
            },
        }
    }
}

