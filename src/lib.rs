//! Client-side HTTP/2 transport for an RPC framework.
//!
//! One [`Http2Transport`] owns exactly one TCP (optionally TLS) connection to
//! a single server endpoint and multiplexes many logical RPC calls over it as
//! HTTP/2 streams. For each call it carries request headers, request message
//! bytes, response headers, response message bytes, and a terminal status,
//! while enforcing HTTP/2 framing rules, flow control, concurrent-stream
//! limits, ping round-trips, and graceful shutdown.
//!
//! # Architecture
//!
//! ```text
//!   new_stream / ping / shutdown          (any application thread)
//!          |
//!   +------v----------+
//!   | write queue     |  one writer thread, commands in submission order
//!   +------+----------+
//!          |
//!   +------v----------+      +-----------------+
//!   | FrameWriter     |      | FrameReader     |  one reader thread
//!   +------+----------+      +--------+--------+
//!          |                          |
//!        socket  <-------------------->  frame dispatcher -> streams/ping/go-away
//! ```
//!
//! The transport consumes an abstract frame codec (see [`codec`]) and
//! produces lifecycle callbacks on a [`TransportListener`]. Message framing
//! and serialization live above this crate: streams hand raw bytes to a
//! [`StreamListener`] and accept raw bytes to send.
//!
//! Scope notes: server-initiated streams are refused (PUSH_PROMISE is always
//! reset), stream priority and ALTSVC are ignored, and there is no connection
//! pooling or automatic reconnect. One transport equals one connection.

mod codec;
mod dispatcher;
mod flow;
mod metadata;
mod method;
mod negotiator;
mod ping;
mod registry;
mod status;
mod stream;
mod transport;
mod write_queue;

pub use codec::{
    ErrorCode, FrameReader, FrameSink, FrameWriter, HeaderField, Http2Settings, Variant,
    CONNECTION_PREFACE,
};
pub use metadata::{Metadata, AUTHORITY_OVERRIDE_KEY};
pub use method::{MethodDescriptor, MethodType};
pub use negotiator::{
    authority_host, authority_port, AuthorityError, Negotiated, Negotiator, PlaintextNegotiator,
    SocketHandle, TlsNegotiator, UpgradeNegotiator,
};
pub use ping::PingCallback;
pub use status::{Code, Status};
pub use stream::{ClientStream, StreamListener};
pub use transport::{
    Http2Transport, TransportConfig, TransportListener, TransportState,
};
