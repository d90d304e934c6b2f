//! Inbound frame dispatch.
//!
//! The reader thread loops pulling frames until the socket closes or the
//! reader fails, handing each typed frame to the [`FrameDispatcher`]. A
//! clean end of stream drains into go-away; a read or framing failure sends
//! GOAWAY(PROTOCOL_ERROR) and tears the transport down. Either way the
//! reader is closed and `transport_terminated` fires on the way out.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::codec::{ErrorCode, FrameReader, FrameSink, HeaderField, Http2Settings};
use crate::flow::DEFAULT_WINDOW_SIZE;
use crate::status::{Code, Status};
use crate::stream::DataOutcome;
use crate::transport::TransportInner;
use crate::write_queue::WriteCmd;

/// Map an HTTP/2 error code on RST_STREAM (or a locally detected error) to
/// the status reported to the affected stream.
pub(crate) fn status_for_rst_code(error_code: ErrorCode) -> Status {
    match error_code {
        ErrorCode::NoError => {
            Status::internal("No error: A GRPC status of OK should have been sent")
        }
        ErrorCode::ProtocolError => Status::internal("Protocol error"),
        ErrorCode::InternalError => Status::internal("Internal error"),
        ErrorCode::FlowControlError => Status::internal("Flow control error"),
        ErrorCode::StreamClosed => Status::internal("Stream closed"),
        ErrorCode::FrameSizeError => Status::internal("Frame too large"),
        ErrorCode::RefusedStream => Status::unavailable("Refused stream"),
        ErrorCode::Cancel => Status::cancelled("Cancelled"),
        ErrorCode::CompressionError => Status::internal("Compression error"),
        ErrorCode::ConnectError => Status::internal("Connect error"),
        ErrorCode::EnhanceYourCalm => Status::resource_exhausted("Enhance your calm"),
        ErrorCode::InadequateSecurity => Status::permission_denied("Inadequate security"),
        other => Status::unknown(format!("Unknown http2 error code: {}", other.to_u32())),
    }
}

/// Map a GOAWAY error code to the status for streams the go-away kills.
///
/// This table differs from the RST_STREAM one: a graceful NO_ERROR or
/// REFUSED_STREAM go-away leaves the affected calls safely retryable, so
/// they report UNAVAILABLE rather than INTERNAL.
pub(crate) fn status_for_goaway_code(error_code: ErrorCode) -> Status {
    match error_code {
        ErrorCode::NoError | ErrorCode::RefusedStream => Status::from_code(Code::Unavailable),
        ErrorCode::Cancel => Status::from_code(Code::Cancelled),
        ErrorCode::EnhanceYourCalm => Status::resource_exhausted("Bandwidth exhausted"),
        ErrorCode::InadequateSecurity => {
            Status::permission_denied("Permission denied as protocol is not secure enough to call")
        }
        ErrorCode::Unknown(code) => {
            Status::unknown(format!("Unknown http2 error code: {}", code))
        }
        _ => Status::from_code(Code::Internal),
    }
}

pub(crate) struct FrameDispatcher {
    transport: Arc<TransportInner>,
    first_settings: bool,
    /// Inbound payload bytes not yet acknowledged at connection scope.
    connection_unacked: u32,
}

/// Reader-task entry point: loop until end of stream or failure, then tear
/// down and emit `transport_terminated`.
pub(crate) fn run_reader(transport: Arc<TransportInner>, mut reader: Box<dyn FrameReader>) {
    let mut dispatcher = FrameDispatcher {
        transport: transport.clone(),
        first_settings: true,
        connection_unacked: 0,
    };

    let outcome = loop {
        match reader.next_frame(&mut dispatcher) {
            Ok(true) => continue,
            Ok(false) => break Ok(()),
            Err(cause) => break Err(cause),
        }
    };

    match outcome {
        // The socket closed under us. Usually this is our own shutdown
        // finishing up, in which case go-away already ran and this is a
        // no-op; otherwise it is a real I/O teardown.
        Ok(()) => transport.start_go_away(0, Status::from_code(Code::Unavailable)),
        Err(cause) => {
            transport.enqueue(WriteCmd::GoAway {
                last_good_stream_id: 0,
                error_code: ErrorCode::ProtocolError,
                debug_data: Vec::new(),
            });
            transport.on_exception(cause);
        }
    }

    if let Err(cause) = reader.close() {
        debug!(error = %cause, "error closing frame reader");
    }
    transport.notify_terminated();
}

impl FrameSink for FrameDispatcher {
    fn data(&mut self, end_stream: bool, stream_id: u32, payload: Bytes) {
        let len = payload.len() as u32;
        match self.transport.get_stream(stream_id) {
            None => {
                if self.transport.may_have_created_stream(stream_id) {
                    self.transport.enqueue(WriteCmd::RstStream {
                        stream_id,
                        error_code: ErrorCode::InvalidStream,
                    });
                } else {
                    self.transport.on_error(
                        ErrorCode::ProtocolError,
                        &format!("Received data for unknown stream: {}", stream_id),
                    );
                    return;
                }
            }
            Some(stream) => match stream.transport_data_received(payload, end_stream) {
                DataOutcome::Accepted { window_update } => {
                    if let Some(increment) = window_update {
                        self.transport.enqueue(WriteCmd::WindowUpdate {
                            stream_id,
                            increment,
                        });
                    }
                    if end_stream {
                        self.transport.finish_stream(stream_id, Some(Status::ok()), None);
                    }
                }
                DataOutcome::WindowOverrun => {
                    self.transport.finish_stream(
                        stream_id,
                        Some(Status::internal(
                            "Received data size exceeded our receiving window size",
                        )),
                        Some(ErrorCode::FlowControlError),
                    );
                }
                DataOutcome::BufferOverflow => {
                    self.transport.finish_stream(
                        stream_id,
                        Some(Status::resource_exhausted(
                            "Received message larger than the configured maximum",
                        )),
                        Some(ErrorCode::Cancel),
                    );
                }
                DataOutcome::Ignored => {}
            },
        }

        // Connection-scope acknowledgment covers every inbound payload byte,
        // including ones for streams we have already forgotten.
        self.connection_unacked += len;
        if self.connection_unacked >= DEFAULT_WINDOW_SIZE as u32 / 2 {
            self.transport.enqueue(WriteCmd::WindowUpdate {
                stream_id: 0,
                increment: self.connection_unacked,
            });
            self.connection_unacked = 0;
        }
    }

    fn headers(&mut self, end_stream: bool, stream_id: u32, headers: Vec<HeaderField>) {
        match self.transport.get_stream(stream_id) {
            None => {
                if self.transport.may_have_created_stream(stream_id) {
                    self.transport.enqueue(WriteCmd::RstStream {
                        stream_id,
                        error_code: ErrorCode::InvalidStream,
                    });
                } else {
                    // No server-initiated streams are expected.
                    self.transport.on_error(
                        ErrorCode::ProtocolError,
                        &format!("Received header for unknown stream: {}", stream_id),
                    );
                }
            }
            Some(stream) => {
                stream.transport_headers_received(headers, end_stream);
                if end_stream {
                    self.transport.finish_stream(stream_id, Some(Status::ok()), None);
                }
            }
        }
    }

    fn rst_stream(&mut self, stream_id: u32, error_code: ErrorCode) {
        self.transport
            .finish_stream(stream_id, Some(status_for_rst_code(error_code)), None);
    }

    fn settings(&mut self, settings: Http2Settings) {
        let first = self.transport.apply_remote_settings(&settings);
        if first && self.first_settings {
            self.first_settings = false;
            self.transport.notify_ready();
        }
        self.transport.enqueue(WriteCmd::Settings {
            ack: true,
            settings: Http2Settings::default(),
        });
    }

    fn ack_settings(&mut self) {
        debug!("settings acknowledged");
    }

    fn ping(&mut self, ack: bool, payload: u64) {
        if ack {
            self.transport.complete_ping(payload);
        } else {
            self.transport.enqueue(WriteCmd::Ping { ack: true, payload });
        }
    }

    fn goaway(&mut self, last_good_stream_id: u32, error_code: ErrorCode, debug_data: Bytes) {
        debug!(
            last_good_stream_id,
            error_code = error_code.to_u32(),
            "received GOAWAY"
        );
        let mut status = status_for_goaway_code(error_code);
        if !debug_data.is_empty() {
            status = status.augment_description(String::from_utf8_lossy(&debug_data).into_owned());
        }
        self.transport.start_go_away(last_good_stream_id, status);
    }

    fn window_update(&mut self, stream_id: u32, increment: u32) {
        if increment == 0 {
            let detail = "Received 0 flow control window increment.";
            if stream_id == 0 {
                self.transport.on_error(ErrorCode::ProtocolError, detail);
            } else {
                self.transport.finish_stream(
                    stream_id,
                    Some(Status::internal(detail)),
                    Some(ErrorCode::ProtocolError),
                );
            }
            return;
        }
        if stream_id == 0 {
            self.transport.handle_conn_window_update(increment);
        } else if !self.transport.handle_stream_window_update(stream_id, increment) {
            self.transport.on_error(
                ErrorCode::ProtocolError,
                &format!("Received window_update for unknown stream: {}", stream_id),
            );
        }
    }

    fn push_promise(
        &mut self,
        stream_id: u32,
        promised_stream_id: u32,
        _headers: Vec<HeaderField>,
    ) {
        // Server-initiated streams are never accepted.
        debug!(stream_id, promised_stream_id, "refusing PUSH_PROMISE");
        self.transport.enqueue(WriteCmd::RstStream {
            stream_id: promised_stream_id,
            error_code: ErrorCode::ProtocolError,
        });
    }

    fn priority(&mut self, _stream_id: u32, _dependency: u32, _weight: u8, _exclusive: bool) {
        // Priority is advisory and ignored.
    }

    fn alt_svc(&mut self, _stream_id: u32, _origin: String) {
        // ALTSVC is not handled.
    }
}
