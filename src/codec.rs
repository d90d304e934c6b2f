//! Abstract HTTP/2 frame codec interface.
//!
//! The transport does not parse or serialize HTTP/2 frames itself. It
//! consumes a [`FrameReader`] that turns wire bytes into typed callbacks on a
//! [`FrameSink`], and a [`FrameWriter`] that turns typed commands into wire
//! bytes. A [`Variant`] builds both from the raw byte stream halves the
//! negotiator produced. Framing is bit-exact per RFC 7540 and belongs to the
//! codec implementation, not to this crate.

use std::io::{self, Read, Write};

use bytes::Bytes;

/// The HTTP/2 connection preface the client sends before any frame.
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// A single HTTP/2 header field, name and value as raw octets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    /// Create a header field from anything byte-like.
    pub fn new(name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Self {
        Self {
            name: name.as_ref().to_vec(),
            value: value.as_ref().to_vec(),
        }
    }
}

/// HTTP/2 error codes (RFC 7540 Section 7).
///
/// Unrecognized codes are preserved rather than collapsed, since the status
/// mapping reports the raw value for codes it does not know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Graceful shutdown.
    NoError,
    /// Protocol error detected.
    ProtocolError,
    /// Implementation fault.
    InternalError,
    /// Flow control limits exceeded.
    FlowControlError,
    /// Settings not acknowledged in time.
    SettingsTimeout,
    /// Frame received for a closed stream.
    StreamClosed,
    /// Frame size incorrect.
    FrameSizeError,
    /// Stream not processed.
    RefusedStream,
    /// Stream cancelled.
    Cancel,
    /// Compression state not updated.
    CompressionError,
    /// TCP connection error for CONNECT method.
    ConnectError,
    /// Processing capacity exceeded.
    EnhanceYourCalm,
    /// Negotiated TLS requirements not met.
    InadequateSecurity,
    /// HTTP/1.1 required.
    Http11Required,
    /// Frame received for a stream this client never opened. Outbound-only
    /// sentinel; shares PROTOCOL_ERROR's wire code, so it never appears on
    /// the inbound side.
    InvalidStream,
    /// A code this implementation does not recognize.
    Unknown(u32),
}

impl ErrorCode {
    pub fn from_u32(code: u32) -> Self {
        match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x2 => ErrorCode::InternalError,
            0x3 => ErrorCode::FlowControlError,
            0x4 => ErrorCode::SettingsTimeout,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameSizeError,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            0xd => ErrorCode::Http11Required,
            other => ErrorCode::Unknown(other),
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            ErrorCode::NoError => 0x0,
            ErrorCode::ProtocolError => 0x1,
            ErrorCode::InternalError => 0x2,
            ErrorCode::FlowControlError => 0x3,
            ErrorCode::SettingsTimeout => 0x4,
            ErrorCode::StreamClosed => 0x5,
            ErrorCode::FrameSizeError => 0x6,
            ErrorCode::RefusedStream => 0x7,
            ErrorCode::Cancel => 0x8,
            ErrorCode::CompressionError => 0x9,
            ErrorCode::ConnectError => 0xa,
            ErrorCode::EnhanceYourCalm => 0xb,
            ErrorCode::InadequateSecurity => 0xc,
            ErrorCode::Http11Required => 0xd,
            ErrorCode::InvalidStream => 0x1,
            ErrorCode::Unknown(code) => code,
        }
    }
}

/// Settings carried by a SETTINGS frame. Only the parameters the transport
/// reacts to are modeled; a codec may ignore the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Http2Settings {
    pub header_table_size: Option<u32>,
    pub enable_push: Option<bool>,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub max_header_list_size: Option<u32>,
}

/// Typed callbacks for inbound frames, invoked by a [`FrameReader`].
pub trait FrameSink {
    /// A DATA frame.
    fn data(&mut self, end_stream: bool, stream_id: u32, payload: Bytes);

    /// A complete header block (HEADERS plus any CONTINUATIONs).
    fn headers(&mut self, end_stream: bool, stream_id: u32, headers: Vec<HeaderField>);

    /// An RST_STREAM frame.
    fn rst_stream(&mut self, stream_id: u32, error_code: ErrorCode);

    /// A SETTINGS frame (not an ack).
    fn settings(&mut self, settings: Http2Settings);

    /// A SETTINGS ack.
    fn ack_settings(&mut self);

    /// A PING frame; `payload` is the 8-byte opaque value.
    fn ping(&mut self, ack: bool, payload: u64);

    /// A GOAWAY frame.
    fn goaway(&mut self, last_good_stream_id: u32, error_code: ErrorCode, debug_data: Bytes);

    /// A WINDOW_UPDATE frame.
    fn window_update(&mut self, stream_id: u32, increment: u32);

    /// A PUSH_PROMISE frame.
    fn push_promise(&mut self, stream_id: u32, promised_stream_id: u32, headers: Vec<HeaderField>);

    /// A PRIORITY frame.
    fn priority(&mut self, stream_id: u32, dependency: u32, weight: u8, exclusive: bool);

    /// An ALTSVC frame.
    fn alt_svc(&mut self, stream_id: u32, origin: String);
}

/// Blocking reader of HTTP/2 frames.
pub trait FrameReader: Send {
    /// Read the next frame and dispatch it to `sink`.
    ///
    /// Returns `Ok(true)` after dispatching a frame, `Ok(false)` when the
    /// underlying byte stream ended cleanly, and `Err` on read or framing
    /// failures.
    fn next_frame(&mut self, sink: &mut dyn FrameSink) -> io::Result<bool>;

    /// Release the reader's resources.
    fn close(&mut self) -> io::Result<()>;
}

/// Writer of HTTP/2 frames. Calls serialize and buffer; `flush` pushes
/// buffered bytes to the socket.
pub trait FrameWriter: Send {
    /// Write the client connection preface.
    fn connection_preface(&mut self) -> io::Result<()>;

    /// Write a SETTINGS frame.
    fn settings(&mut self, settings: &Http2Settings) -> io::Result<()>;

    /// Write a SETTINGS ack.
    fn ack_settings(&mut self) -> io::Result<()>;

    /// Write a HEADERS frame (with CONTINUATIONs as needed).
    fn headers(&mut self, end_stream: bool, stream_id: u32, headers: &[HeaderField])
        -> io::Result<()>;

    /// Write a DATA frame.
    fn data(&mut self, end_stream: bool, stream_id: u32, payload: &Bytes) -> io::Result<()>;

    /// Write an RST_STREAM frame.
    fn rst_stream(&mut self, stream_id: u32, error_code: ErrorCode) -> io::Result<()>;

    /// Write a PING frame with the 8-byte opaque payload.
    fn ping(&mut self, ack: bool, payload: u64) -> io::Result<()>;

    /// Write a GOAWAY frame.
    fn goaway(&mut self, last_good_stream_id: u32, error_code: ErrorCode, debug_data: &[u8])
        -> io::Result<()>;

    /// Write a WINDOW_UPDATE frame.
    fn window_update(&mut self, stream_id: u32, increment: u32) -> io::Result<()>;

    /// Flush buffered bytes to the socket.
    fn flush(&mut self) -> io::Result<()>;

    /// Close the writer and the underlying sink.
    fn close(&mut self) -> io::Result<()>;
}

/// Factory that attaches a frame codec to the negotiated byte stream.
pub trait Variant: Send + Sync {
    /// Build a frame reader over the read half.
    fn new_reader(&self, source: Box<dyn Read + Send>) -> Box<dyn FrameReader>;

    /// Build a frame writer over the write half.
    fn new_writer(&self, sink: Box<dyn Write + Send>) -> Box<dyn FrameWriter>;
}
