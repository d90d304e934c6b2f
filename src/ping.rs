//! Keepalive PING round-trip tracking.

use std::time::{Duration, Instant};

use crate::status::Status;

/// Callback fired when a PING completes with the round-trip time, or fails
/// with the transport's terminal status.
pub type PingCallback = Box<dyn FnOnce(Result<Duration, Status>) + Send + 'static>;

/// The single outstanding PING a transport may have in flight.
///
/// Callers arriving while a PING is outstanding attach their callback to it
/// instead of sending another frame, so all of them observe the same
/// round-trip sample. The record completes or fails exactly once.
pub(crate) struct OutstandingPing {
    payload: u64,
    started: Instant,
    callbacks: Vec<PingCallback>,
}

impl OutstandingPing {
    pub fn new(payload: u64) -> Self {
        Self {
            payload,
            started: Instant::now(),
            callbacks: Vec::new(),
        }
    }

    /// The opaque 8-byte payload carried by the PING frame.
    pub fn payload(&self) -> u64 {
        self.payload
    }

    pub fn add_callback(&mut self, callback: PingCallback) {
        self.callbacks.push(callback);
    }

    /// Complete the ping: every attached callback observes the same elapsed
    /// time. Must be called outside the transport lock.
    pub fn complete(self) {
        let elapsed = self.started.elapsed();
        for callback in self.callbacks {
            callback(Ok(elapsed));
        }
    }

    /// Fail the ping with the given status. Must be called outside the
    /// transport lock.
    pub fn fail(self, status: Status) {
        for callback in self.callbacks {
            callback(Err(status.clone()));
        }
    }
}
