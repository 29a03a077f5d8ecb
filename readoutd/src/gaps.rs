//! Registry of timestamp discontinuities seen by the preprocessor.
//!
//! The consumer pushes a record for every gap; request lookups consult
//! `has_gaps` to decide between the O(1) fixed-rate index and the
//! binary-search fallback; eviction drops records that fell off the front of
//! the latency buffer.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// One timestamp discontinuity: the timestamp the stream should have carried
/// next, and the one it actually carried.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GapRecord {
    pub expected_ts: u64,
    pub observed_ts: u64,
}

impl PartialOrd for GapRecord {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GapRecord {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.observed_ts
            .cmp(&other.observed_ts)
            .then(self.expected_ts.cmp(&other.expected_ts))
    }
}

#[derive(Default)]
pub struct GapRegistry {
    records: Mutex<BinaryHeap<Reverse<GapRecord>>>,
    // Fast path for the per-request check; kept in sync under the lock.
    non_empty: AtomicBool,
}

impl GapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, record: GapRecord) {
        let mut records = self.records.lock();
        records.push(Reverse(record));
        self.non_empty.store(true, Ordering::Release);
    }

    /// True while any gap is still inside the buffered timestamp range.
    pub fn has_gaps(&self) -> bool {
        self.non_empty.load(Ordering::Acquire)
    }

    /// Drop records whose observed timestamp fell behind the buffer front.
    pub fn remove_until(&self, front_ts: u64) {
        let mut records = self.records.lock();
        while records
            .peek()
            .is_some_and(|Reverse(r)| r.observed_ts < front_ts)
        {
            records.pop();
        }
        self.non_empty.store(!records.is_empty(), Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_gaps()
    }

    pub fn clear(&self) {
        let mut records = self.records.lock();
        records.clear();
        self.non_empty.store(false, Ordering::Release);
    }

    /// Oldest gap still registered, by observed timestamp.
    pub fn front(&self) -> Option<GapRecord> {
        self.records.lock().peek().map(|Reverse(r)| *r)
    }
}
