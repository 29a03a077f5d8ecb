//! Ordered latency buffer for variable-rate, possibly out-of-order streams.
//!
//! Elements are keyed by their first timestamp in an ordered map behind a
//! reader/writer lock. Readers take an RAII accessor (the read guard), which
//! keeps structural removals out while any lookup or scan is in flight:
//! explicit acquire/release in place of the reference-counted accessor
//! tokens a concurrent skip list would carry. Eviction is driven by the
//! buffered timestamp span, not by occupancy.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockReadGuard};
use readout_frames::FrameChunk;

pub struct OrderedBuffer<T> {
    inner: RwLock<BTreeMap<u64, T>>,
    /// Evict from the head while `newest - oldest` exceeds this.
    max_span: u64,
    rejected: AtomicU64,
}

impl<T: FrameChunk> OrderedBuffer<T> {
    pub fn new(max_span: u64) -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
            max_span,
            rejected: AtomicU64::new(0),
        }
    }

    pub fn max_span(&self) -> u64 {
        self.max_span
    }

    /// Insert ordered by timestamp. A duplicate timestamp is rejected and
    /// counted, matching the drop-and-count write contract.
    pub fn write(&self, element: T) -> bool {
        let key = element.first_timestamp();
        let mut inner = self.inner.write();
        if inner.contains_key(&key) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        inner.insert(key, element);
        true
    }

    pub fn occupancy(&self) -> usize {
        self.inner.read().len()
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn front_timestamp(&self) -> Option<u64> {
        self.inner.read().keys().next().copied()
    }

    pub fn back_timestamp(&self) -> Option<u64> {
        self.inner.read().keys().next_back().copied()
    }

    /// Timestamp distance currently buffered.
    pub fn span(&self) -> u64 {
        let inner = self.inner.read();
        match (inner.keys().next(), inner.keys().next_back()) {
            (Some(oldest), Some(newest)) => newest - oldest,
            _ => 0,
        }
    }

    pub fn pop_front(&self, n: usize) -> usize {
        let mut inner = self.inner.write();
        let mut popped = 0;
        while popped < n {
            let Some(key) = inner.keys().next().copied() else {
                break;
            };
            inner.remove(&key);
            popped += 1;
        }
        popped
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    /// Elements that would have to go to restore the span invariant.
    pub fn over_span_count(&self) -> usize {
        let inner = self.inner.read();
        let Some(newest) = inner.keys().next_back().copied() else {
            return 0;
        };
        let cutoff = newest.saturating_sub(self.max_span);
        inner.range(..cutoff).count()
    }

    /// Acquire a read accessor. Scans and lookups made through it observe a
    /// consistent sequence; eviction blocks until the accessor is released.
    pub fn accessor(&self) -> ReadAccessor<'_, T> {
        ReadAccessor {
            guard: self.inner.read(),
        }
    }
}

pub struct ReadAccessor<'a, T> {
    guard: RwLockReadGuard<'a, BTreeMap<u64, T>>,
}

impl<'a, T: FrameChunk> ReadAccessor<'a, T> {
    pub fn len(&self) -> usize {
        self.guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard.is_empty()
    }

    /// Iterate from the element containing `ts`: the last element at or
    /// below it, or the first element above it when `ts` precedes the
    /// buffer. Returns `None` when nothing at or above `ts` is buffered.
    pub fn iter_from(&self, ts: u64) -> Option<impl Iterator<Item = &T> + '_> {
        let start = match self.guard.range(..=ts).next_back() {
            Some((key, _)) => *key,
            None => *self.guard.range(ts..).next().map(|(k, _)| k)?,
        };
        Some(self.guard.range(start..).map(|(_, v)| v))
    }

    pub fn last(&self) -> Option<&T> {
        self.guard.values().next_back()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use readout_frames::PdChunk;

    fn filled(max_span: u64, stamps: &[u64]) -> OrderedBuffer<PdChunk> {
        let buffer = OrderedBuffer::new(max_span);
        for ts in stamps {
            assert!(buffer.write(PdChunk::at_timestamp(*ts)));
        }
        buffer
    }

    #[test]
    fn out_of_order_writes_come_back_sorted() {
        let buffer = filled(10_000, &[900, 100, 500, 300]);
        let accessor = buffer.accessor();
        let stamps: Vec<u64> = accessor
            .iter_from(0)
            .unwrap()
            .map(|e| e.first_timestamp())
            .collect();
        assert_eq!(stamps, vec![100, 300, 500, 900]);
    }

    #[test]
    fn duplicate_timestamp_is_rejected_and_counted() {
        let buffer = filled(10_000, &[100]);
        assert!(!buffer.write(PdChunk::at_timestamp(100)));
        assert_eq!(buffer.rejected_count(), 1);
        assert_eq!(buffer.occupancy(), 1);
    }

    #[test]
    fn iter_from_starts_at_containing_element() {
        let buffer = filled(10_000, &[100, 500, 900]);
        let accessor = buffer.accessor();
        let first = accessor.iter_from(600).unwrap().next().unwrap();
        assert_eq!(first.first_timestamp(), 500);
        let first = accessor.iter_from(50).unwrap().next().unwrap();
        assert_eq!(first.first_timestamp(), 100);
        assert_eq!(
            accessor.iter_from(900).unwrap().next().unwrap().first_timestamp(),
            900
        );
    }

    #[test]
    fn span_eviction_candidates() {
        let buffer = filled(1000, &[0, 400, 800, 1600, 2000]);
        assert_eq!(buffer.span(), 2000);
        // newest = 2000, cutoff = 1000: elements 0, 400 and 800 are over.
        assert_eq!(buffer.over_span_count(), 3);
        assert_eq!(buffer.pop_front(3), 3);
        assert_eq!(buffer.front_timestamp(), Some(1600));
        assert!(buffer.span() <= 1000);
        assert_eq!(buffer.over_span_count(), 0);
    }

    #[test]
    fn accessor_sees_consistent_sequence_across_writes() {
        let buffer = filled(10_000, &[100, 200]);
        let accessor = buffer.accessor();
        assert_eq!(accessor.len(), 2);
        drop(accessor);
        buffer.write(PdChunk::at_timestamp(300));
        assert_eq!(buffer.occupancy(), 3);
    }
}
