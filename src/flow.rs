//! Outbound flow control.
//!
//! HTTP/2 flow control is credit based: the peer grants a window at the
//! connection level and per stream, and every outbound DATA payload byte
//! debits both. A send that exceeds the available credit is queued on its
//! stream and drained as WINDOW_UPDATE frames arrive.

use std::cmp;
use std::collections::VecDeque;

use bytes::Bytes;

/// Default initial window size (RFC 7540 Section 6.9.2).
pub(crate) const DEFAULT_WINDOW_SIZE: i32 = 65_535;

/// Largest DATA payload emitted in a single frame.
pub(crate) const MAX_DATA_CHUNK: usize = 16_384;

/// Connection-level outbound window.
#[derive(Debug)]
pub(crate) struct OutboundFlow {
    window: i32,
}

impl OutboundFlow {
    pub fn new(initial: i32) -> Self {
        Self { window: initial }
    }

    /// Currently available credit; never reported below zero.
    pub fn available(&self) -> i32 {
        cmp::max(self.window, 0)
    }

    pub fn debit(&mut self, amount: u32) {
        self.window -= amount as i32;
    }

    pub fn credit(&mut self, amount: u32) {
        self.window = self.window.saturating_add(amount as i32);
    }
}

impl Default for OutboundFlow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

/// A DATA payload waiting for credit, with its END_STREAM marker.
#[derive(Debug)]
pub(crate) struct PendingData {
    pub payload: Bytes,
    pub end_stream: bool,
}

/// Per-stream outbound window plus the queue of payloads awaiting credit.
#[derive(Debug)]
pub(crate) struct StreamOutboundFlow {
    window: i32,
    queued: VecDeque<PendingData>,
}

impl StreamOutboundFlow {
    pub fn new(initial: i32) -> Self {
        Self {
            window: initial,
            queued: VecDeque::new(),
        }
    }

    pub fn credit(&mut self, amount: u32) {
        self.window = self.window.saturating_add(amount as i32);
    }

    /// Adjust the window when the peer changes INITIAL_WINDOW_SIZE. The
    /// delta may be negative, driving the window below zero until credited.
    pub fn adjust(&mut self, delta: i32) {
        self.window = self.window.saturating_add(delta);
    }

    /// Whether any payload is queued waiting for credit.
    pub fn has_queued(&self) -> bool {
        !self.queued.is_empty()
    }

    /// Submit a payload and immediately drain whatever credit allows.
    pub fn send(&mut self, payload: Bytes, end_stream: bool, conn: &mut OutboundFlow)
        -> Vec<PendingData> {
        self.queued.push_back(PendingData {
            payload,
            end_stream,
        });
        self.drain(conn)
    }

    /// Pop queued payloads while credit remains, debiting both windows.
    ///
    /// Payloads larger than the available credit (or [`MAX_DATA_CHUNK`]) are
    /// split; the remainder stays queued. Empty payloads carry no bytes and
    /// are released regardless of credit so an END_STREAM marker is never
    /// stranded.
    pub fn drain(&mut self, conn: &mut OutboundFlow) -> Vec<PendingData> {
        let mut out = Vec::new();
        while let Some(mut front) = self.queued.pop_front() {
            if front.payload.is_empty() {
                out.push(front);
                continue;
            }

            let writable = cmp::max(cmp::min(self.window, conn.available()), 0) as usize;
            if writable == 0 {
                self.queued.push_front(front);
                break;
            }

            let n = cmp::min(writable, cmp::min(front.payload.len(), MAX_DATA_CHUNK));
            self.window -= n as i32;
            conn.debit(n as u32);

            if n == front.payload.len() {
                out.push(front);
            } else {
                let chunk = front.payload.split_to(n);
                out.push(PendingData {
                    payload: chunk,
                    end_stream: false,
                });
                self.queued.push_front(front);
            }
        }
        out
    }
}
