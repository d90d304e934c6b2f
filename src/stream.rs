//! Per-RPC stream handle.
//!
//! A `ClientStream` represents one call multiplexed onto the transport's
//! connection. Until the stream is admitted and assigned an HTTP/2 id its
//! outbound messages buffer locally; once started they flow through the
//! outbound flow controller. Inbound bytes are handed to the stream's
//! [`StreamListener`] as they arrive, and the terminal status is reported
//! exactly once.

use std::collections::VecDeque;
use std::sync::Weak;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};

use crate::codec::{ErrorCode, HeaderField};
use crate::flow::{PendingData, StreamOutboundFlow};
use crate::method::MethodDescriptor;
use crate::status::Status;
use crate::transport::TransportInner;

/// Receives a stream's inbound events. Implemented by the message codec
/// layered above the transport.
///
/// Callbacks are never invoked while transport locks are held. `data_received`
/// gets the stream's inbound buffer; the implementation drains the messages
/// it can decode and leaves any trailing partial message in place.
pub trait StreamListener: Send + Sync {
    /// Response or trailer headers arrived.
    fn headers_received(&self, headers: Vec<HeaderField>, end_stream: bool);

    /// Message bytes arrived. Decode and drain from `buf`; bytes left behind
    /// stay buffered for the next call.
    fn data_received(&self, buf: &mut BytesMut, end_stream: bool);

    /// The stream reached its terminal status. Called exactly once.
    fn closed(&self, status: &Status);
}

pub(crate) struct StreamInner {
    /// Assigned HTTP/2 stream id; 0 until admission.
    pub id: u32,
    /// Request headers, held until the HEADERS frame is emitted.
    pub request_headers: Option<Vec<HeaderField>>,
    /// Outbound payloads submitted before the stream started.
    pub pending_out: VecDeque<PendingData>,
    /// The local side has submitted END_STREAM.
    pub out_closed: bool,
    /// Outbound window and credit-blocked queue; live once started.
    pub flow: StreamOutboundFlow,
    /// Inbound bytes the listener has not yet drained.
    pub inbound: BytesMut,
    /// Remaining inbound window advertised to the peer.
    pub in_window: i32,
    /// Inbound bytes read but not yet acknowledged via WINDOW_UPDATE.
    pub in_unacked: u32,
    /// The peer half-closed with END_STREAM.
    pub remote_closed: bool,
    /// Terminal status, set at most once.
    pub status: Option<Status>,
}

/// Result of feeding inbound DATA to a stream.
pub(crate) enum DataOutcome {
    /// Bytes delivered. Carries a stream-level WINDOW_UPDATE increment to
    /// send, if the unacknowledged total crossed the threshold.
    Accepted { window_update: Option<u32> },
    /// The peer sent more than the advertised inbound window.
    WindowOverrun,
    /// Undrained buffered bytes exceeded the configured message size limit.
    BufferOverflow,
    /// The stream already terminated; bytes were dropped.
    Ignored,
}

pub struct ClientStream {
    method: MethodDescriptor,
    listener: Box<dyn StreamListener>,
    transport: Weak<TransportInner>,
    recv_window: i32,
    max_message_size: usize,
    pub(crate) inner: Mutex<StreamInner>,
}

impl ClientStream {
    pub(crate) fn new(
        method: MethodDescriptor,
        listener: Box<dyn StreamListener>,
        transport: Weak<TransportInner>,
        request_headers: Vec<HeaderField>,
        recv_window: i32,
        max_message_size: usize,
    ) -> Self {
        Self {
            method,
            listener,
            transport,
            recv_window,
            max_message_size,
            inner: Mutex::new(StreamInner {
                id: 0,
                request_headers: Some(request_headers),
                pending_out: VecDeque::new(),
                out_closed: false,
                flow: StreamOutboundFlow::new(0),
                inbound: BytesMut::new(),
                in_window: recv_window,
                in_unacked: 0,
                remote_closed: false,
                status: None,
            }),
        }
    }

    /// The method this stream was created for.
    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    /// The assigned HTTP/2 stream id, once admission completed.
    pub fn id(&self) -> Option<u32> {
        let id = self.inner.lock().id;
        if id == 0 {
            None
        } else {
            Some(id)
        }
    }

    /// Whether a terminal status has been reported.
    pub fn is_terminated(&self) -> bool {
        self.inner.lock().status.is_some()
    }

    /// Submit message bytes. Buffers locally until the stream starts, then
    /// sends subject to flow control. After `end_stream` or a terminal
    /// status, further submissions are dropped.
    pub fn send_message(&self, payload: Bytes, end_stream: bool) {
        if let Some(transport) = self.transport.upgrade() {
            transport.stream_send(self, payload, end_stream);
        }
    }

    /// Cancel the call. A started stream is reset on the wire; a pending
    /// stream is withdrawn with no wire traffic. The status is reported to
    /// the listener either way.
    pub fn cancel(&self, status: Status) {
        let id = self.inner.lock().id;
        let transport = match self.transport.upgrade() {
            Some(transport) => transport,
            None => {
                self.report_status(status, true);
                return;
            }
        };
        if id == 0 {
            transport.remove_pending(self);
            self.report_status(status, true);
        } else {
            transport.finish_stream(id, Some(status), Some(ErrorCode::Cancel));
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, StreamInner> {
        self.inner.lock()
    }

    /// Report the terminal status to the listener. Only the first report
    /// takes effect. `stop_delivery` discards any buffered inbound bytes so
    /// nothing is handed up after a cancellation.
    pub(crate) fn report_status(&self, status: Status, stop_delivery: bool) {
        {
            let mut inner = self.inner.lock();
            if inner.status.is_some() {
                return;
            }
            inner.status = Some(status.clone());
            if stop_delivery {
                inner.inbound.clear();
            }
            inner.pending_out.clear();
        }
        self.listener.closed(&status);
    }

    /// Deliver inbound header block to the listener.
    pub(crate) fn transport_headers_received(&self, headers: Vec<HeaderField>, end_stream: bool) {
        {
            let mut inner = self.inner.lock();
            if inner.status.is_some() {
                return;
            }
            if end_stream {
                inner.remote_closed = true;
            }
        }
        self.listener.headers_received(headers, end_stream);
    }

    /// Deliver inbound DATA to the listener, accounting the inbound window.
    pub(crate) fn transport_data_received(&self, payload: Bytes, end_stream: bool) -> DataOutcome {
        let len = payload.len() as u32;
        let mut buf = {
            let mut inner = self.inner.lock();
            if inner.status.is_some() {
                return DataOutcome::Ignored;
            }
            inner.in_window -= len as i32;
            if inner.in_window < 0 {
                return DataOutcome::WindowOverrun;
            }
            if end_stream {
                inner.remote_closed = true;
            }
            let mut buf = std::mem::take(&mut inner.inbound);
            buf.extend_from_slice(&payload);
            buf
        };

        self.listener.data_received(&mut buf, end_stream);

        let mut window_update = None;
        {
            let mut inner = self.inner.lock();
            if buf.len() > self.max_message_size {
                return DataOutcome::BufferOverflow;
            }
            inner.inbound = buf;
            inner.in_unacked = inner.in_unacked.saturating_add(len);
            if !inner.remote_closed && inner.in_unacked as i64 >= self.recv_window as i64 / 2 {
                let acked = inner.in_unacked;
                inner.in_window = inner.in_window.saturating_add(acked as i32);
                inner.in_unacked = 0;
                window_update = Some(acked);
            }
        }
        DataOutcome::Accepted { window_update }
    }

    #[cfg(test)]
    pub(crate) fn for_registry_tests(method: MethodDescriptor) -> std::sync::Arc<Self> {
        struct NoopListener;
        impl StreamListener for NoopListener {
            fn headers_received(&self, _headers: Vec<HeaderField>, _end_stream: bool) {}
            fn data_received(&self, _buf: &mut BytesMut, _end_stream: bool) {}
            fn closed(&self, _status: &Status) {}
        }
        std::sync::Arc::new(Self::new(
            method,
            Box::new(NoopListener),
            Weak::new(),
            Vec::new(),
            crate::flow::DEFAULT_WINDOW_SIZE,
            4 * 1024 * 1024,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::method::MethodType;

    #[derive(Default)]
    struct CountingListener {
        headers: AtomicUsize,
        data_bytes: AtomicUsize,
        closed: AtomicUsize,
        drain: bool,
    }

    impl StreamListener for CountingListener {
        fn headers_received(&self, _headers: Vec<HeaderField>, _end_stream: bool) {
            self.headers.fetch_add(1, Ordering::SeqCst);
        }

        fn data_received(&self, buf: &mut BytesMut, _end_stream: bool) {
            self.data_bytes.fetch_add(buf.len(), Ordering::SeqCst);
            if self.drain {
                buf.clear();
            }
        }

        fn closed(&self, _status: &Status) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn stream_with(
        listener: Arc<CountingListener>,
        recv_window: i32,
        max_message_size: usize,
    ) -> ClientStream {
        struct Forward(Arc<CountingListener>);
        impl StreamListener for Forward {
            fn headers_received(&self, headers: Vec<HeaderField>, end_stream: bool) {
                self.0.headers_received(headers, end_stream)
            }
            fn data_received(&self, buf: &mut BytesMut, end_stream: bool) {
                self.0.data_received(buf, end_stream)
            }
            fn closed(&self, status: &Status) {
                self.0.closed(status)
            }
        }
        ClientStream::new(
            MethodDescriptor::new("svc/M", MethodType::Unary),
            Box::new(Forward(listener)),
            Weak::new(),
            Vec::new(),
            recv_window,
            max_message_size,
        )
    }

    #[test]
    fn status_reported_exactly_once() {
        let listener = Arc::new(CountingListener {
            drain: true,
            ..Default::default()
        });
        let stream = stream_with(listener.clone(), 65_535, 1 << 20);

        stream.report_status(Status::cancelled("Cancelled"), true);
        stream.report_status(Status::internal("again"), false);

        assert_eq!(listener.closed.load(Ordering::SeqCst), 1);
        assert!(stream.is_terminated());
    }

    #[test]
    fn data_after_terminal_status_is_ignored() {
        let listener = Arc::new(CountingListener {
            drain: true,
            ..Default::default()
        });
        let stream = stream_with(listener.clone(), 65_535, 1 << 20);
        stream.report_status(Status::cancelled("Cancelled"), true);

        let outcome = stream.transport_data_received(Bytes::from_static(b"late"), false);
        assert!(matches!(outcome, DataOutcome::Ignored));
        assert_eq!(listener.data_bytes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn window_update_after_half_window_consumed() {
        let listener = Arc::new(CountingListener {
            drain: true,
            ..Default::default()
        });
        let stream = stream_with(listener.clone(), 1000, 1 << 20);

        let outcome = stream.transport_data_received(Bytes::from(vec![0u8; 499]), false);
        match outcome {
            DataOutcome::Accepted { window_update } => assert!(window_update.is_none()),
            _ => panic!("expected accepted"),
        }

        let outcome = stream.transport_data_received(Bytes::from(vec![0u8; 1]), false);
        match outcome {
            DataOutcome::Accepted { window_update } => assert_eq!(window_update, Some(500)),
            _ => panic!("expected accepted"),
        }
    }

    #[test]
    fn no_window_update_after_remote_close() {
        let listener = Arc::new(CountingListener {
            drain: true,
            ..Default::default()
        });
        let stream = stream_with(listener, 100, 1 << 20);

        let outcome = stream.transport_data_received(Bytes::from(vec![0u8; 80]), true);
        match outcome {
            DataOutcome::Accepted { window_update } => assert!(window_update.is_none()),
            _ => panic!("expected accepted"),
        }
    }

    #[test]
    fn overrun_of_inbound_window_is_flagged() {
        let listener = Arc::new(CountingListener {
            drain: true,
            ..Default::default()
        });
        let stream = stream_with(listener, 10, 1 << 20);

        let outcome = stream.transport_data_received(Bytes::from(vec![0u8; 11]), false);
        assert!(matches!(outcome, DataOutcome::WindowOverrun));
    }

    #[test]
    fn undrained_buffer_over_limit_is_flagged() {
        // Listener never drains; the second delivery pushes the buffer past
        // the limit.
        let listener = Arc::new(CountingListener::default());
        let stream = stream_with(listener, 65_535, 16);

        let outcome = stream.transport_data_received(Bytes::from(vec![0u8; 10]), false);
        assert!(matches!(outcome, DataOutcome::Accepted { .. }));
        let outcome = stream.transport_data_received(Bytes::from(vec![0u8; 10]), false);
        assert!(matches!(outcome, DataOutcome::BufferOverflow));
    }

    #[test]
    fn headers_counted_and_suppressed_after_close() {
        let listener = Arc::new(CountingListener {
            drain: true,
            ..Default::default()
        });
        let stream = stream_with(listener.clone(), 65_535, 1 << 20);

        stream.transport_headers_received(vec![HeaderField::new(":status", "200")], false);
        assert_eq!(listener.headers.load(Ordering::SeqCst), 1);

        stream.report_status(Status::cancelled("Cancelled"), true);
        stream.transport_headers_received(vec![HeaderField::new("grpc-status", "0")], true);
        assert_eq!(listener.headers.load(Ordering::SeqCst), 1);
    }
}
