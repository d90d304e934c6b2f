//! Stream registry: id allocation, the active-stream map, and the pending
//! queue for admission-blocked streams.
//!
//! Client-initiated stream ids are odd and strictly increasing, starting at
//! 3 (1 stays reserved for an HTTP/1.1 Upgrade response). The registry is
//! always accessed under the transport lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::stream::ClientStream;

/// Largest assignable stream id (31-bit space).
pub(crate) const MAX_STREAM_ID: u32 = 0x7FFF_FFFF;

pub(crate) struct StreamRegistry {
    next_stream_id: u32,
    max_concurrent_streams: u32,
    streams: HashMap<u32, Arc<ClientStream>>,
    pending: VecDeque<Arc<ClientStream>>,
}

impl StreamRegistry {
    pub fn new(start_stream_id: u32) -> Self {
        debug_assert!(start_stream_id % 2 == 1, "client stream ids are odd");
        Self {
            next_stream_id: start_stream_id,
            // No streams may start before the connection is up; the connect
            // path raises this once the writer is bound.
            max_concurrent_streams: 0,
            streams: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn set_max_concurrent(&mut self, limit: u32) {
        self.max_concurrent_streams = limit;
    }

    pub fn has_capacity(&self) -> bool {
        (self.streams.len() as u64) < self.max_concurrent_streams as u64
    }

    /// Assign the next odd id to `stream` and insert it into the active map.
    ///
    /// Returns the id and whether the id space is now exhausted. On
    /// exhaustion `next_stream_id` is pinned to [`MAX_STREAM_ID`] so that
    /// `may_have_created` keeps answering correctly for every id ever
    /// assigned; the caller is responsible for initiating go-away.
    pub fn assign_and_insert(&mut self, stream: Arc<ClientStream>) -> (u32, bool) {
        let id = self.next_stream_id;
        self.streams.insert(id, stream);
        let exhausted = id >= MAX_STREAM_ID - 2;
        if exhausted {
            self.next_stream_id = MAX_STREAM_ID;
        } else {
            self.next_stream_id += 2;
        }
        (id, exhausted)
    }

    pub fn get(&self, stream_id: u32) -> Option<&Arc<ClientStream>> {
        self.streams.get(&stream_id)
    }

    /// Remove a stream; removal is idempotent.
    pub fn remove(&mut self, stream_id: u32) -> Option<Arc<ClientStream>> {
        self.streams.remove(&stream_id)
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Snapshot of the active streams.
    pub fn snapshot(&self) -> Vec<Arc<ClientStream>> {
        self.streams.values().cloned().collect()
    }

    /// Active stream ids in ascending order.
    pub fn ids_sorted(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.streams.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Whether a frame for `stream_id` could refer to a stream this client
    /// once created (and has since forgotten).
    pub fn may_have_created(&self, stream_id: u32) -> bool {
        stream_id < self.next_stream_id && stream_id % 2 == 1
    }

    pub fn push_pending(&mut self, stream: Arc<ClientStream>) {
        self.pending.push_back(stream);
    }

    /// Pop the oldest pending stream, honoring FIFO admission order.
    pub fn pop_pending(&mut self) -> Option<Arc<ClientStream>> {
        self.pending.pop_front()
    }

    /// Remove a specific pending stream (its call was cancelled before an id
    /// was assigned).
    pub fn remove_pending(&mut self, stream: &ClientStream) {
        let target = stream as *const ClientStream;
        self.pending
            .retain(|s| !std::ptr::eq(Arc::as_ptr(s), target));
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Clear the pending queue, returning the removed streams.
    pub fn take_pending(&mut self) -> Vec<Arc<ClientStream>> {
        self.pending.drain(..).collect()
    }

    /// Remove every active stream with id above `last_known_stream_id`,
    /// returning them. Streams at or below the cutoff continue to completion.
    pub fn remove_above(&mut self, last_known_stream_id: u32) -> Vec<Arc<ClientStream>> {
        let doomed: Vec<u32> = self
            .streams
            .keys()
            .copied()
            .filter(|id| *id > last_known_stream_id)
            .collect();
        doomed
            .into_iter()
            .filter_map(|id| self.streams.remove(&id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::method::{MethodDescriptor, MethodType};
    use crate::stream::ClientStream;

    fn stream() -> Arc<ClientStream> {
        ClientStream::for_registry_tests(MethodDescriptor::new(
            "test.Service/Method",
            MethodType::Unary,
        ))
    }

    fn registry() -> StreamRegistry {
        let mut registry = StreamRegistry::new(3);
        registry.set_max_concurrent(u32::MAX);
        registry
    }

    #[test]
    fn ids_are_odd_and_increasing_from_three() {
        let mut registry = registry();
        let (a, _) = registry.assign_and_insert(stream());
        let (b, _) = registry.assign_and_insert(stream());
        let (c, _) = registry.assign_and_insert(stream());
        assert_eq!((a, b, c), (3, 5, 7));
    }

    #[test]
    fn capacity_blocks_at_limit() {
        let mut registry = StreamRegistry::new(3);
        registry.set_max_concurrent(1);
        assert!(registry.has_capacity());
        registry.assign_and_insert(stream());
        assert!(!registry.has_capacity());
    }

    #[test]
    fn zero_limit_admits_nothing() {
        let registry = StreamRegistry::new(3);
        assert!(!registry.has_capacity());
    }

    #[test]
    fn pending_is_fifo() {
        let mut registry = registry();
        let first = stream();
        let second = stream();
        registry.push_pending(first.clone());
        registry.push_pending(second.clone());

        let popped = registry.pop_pending().unwrap();
        assert!(Arc::ptr_eq(&popped, &first));
        let popped = registry.pop_pending().unwrap();
        assert!(Arc::ptr_eq(&popped, &second));
        assert!(registry.pop_pending().is_none());
    }

    #[test]
    fn remove_pending_by_identity() {
        let mut registry = registry();
        let first = stream();
        let second = stream();
        registry.push_pending(first.clone());
        registry.push_pending(second.clone());

        registry.remove_pending(&first);
        assert_eq!(registry.pending_count(), 1);
        let popped = registry.pop_pending().unwrap();
        assert!(Arc::ptr_eq(&popped, &second));
    }

    #[test]
    fn may_have_created_tracks_assigned_space() {
        let mut registry = registry();
        registry.assign_and_insert(stream());
        registry.assign_and_insert(stream());
        // next id is 7 now
        assert!(registry.may_have_created(3));
        assert!(registry.may_have_created(5));
        assert!(!registry.may_have_created(7));
        // even ids are never client-created
        assert!(!registry.may_have_created(4));
    }

    #[test]
    fn removal_is_idempotent() {
        let mut registry = registry();
        let (id, _) = registry.assign_and_insert(stream());
        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
    }

    #[test]
    fn exhaustion_pins_next_id() {
        let mut registry = StreamRegistry::new(MAX_STREAM_ID - 2);
        registry.set_max_concurrent(u32::MAX);
        let (id, exhausted) = registry.assign_and_insert(stream());
        assert_eq!(id, MAX_STREAM_ID - 2);
        assert!(exhausted);
        // Every previously assigned odd id still answers true, and the
        // pinned ceiling itself is never considered created.
        assert!(registry.may_have_created(id));
        assert!(!registry.may_have_created(MAX_STREAM_ID));
    }

    #[test]
    fn remove_above_keeps_older_streams() {
        let mut registry = registry();
        registry.assign_and_insert(stream());
        registry.assign_and_insert(stream());
        registry.assign_and_insert(stream());

        let removed = registry.remove_above(5);
        assert_eq!(removed.len(), 1);
        assert!(registry.get(3).is_some());
        assert!(registry.get(5).is_some());
        assert!(registry.get(7).is_none());
    }
}
