//! Single-producer / multi-reader lock-free ring for fixed-rate streams.
//!
//! One slot is sacrificed to distinguish full from empty, so a ring built
//! for capacity N allocates N + 1 slots. The backing storage is one flat
//! 4096-byte-aligned allocation: SIMD postprocessing reads element memory
//! directly and the zero-copy recorder hands spans of it to O_DIRECT writes.
//!
//! Writer protocol: exactly one producer thread calls `write`. Reader
//! protocol: `pop` and `clear` are serialized against window lookups by the
//! request handler's cleanup barrier; concurrent readers only touch the live
//! range `[read, write)`, which the producer never rewrites.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use readout_frames::FrameChunk;

/// Alignment of the backing allocation; satisfies both the SIMD-width
/// preprocessing loads and O_DIRECT block requirements.
pub const RING_ALLOC_ALIGN: usize = 4096;

/// Lookup headroom below the write index, in elements. The newest few slots
/// are considered unsettled because `occupancy` races the producer.
pub const DEFAULT_SAFETY_MARGIN: usize = 10;

/// Position of an element inside the ring, returned by lookups and consumed
/// by iteration. Only valid while the element has not been popped.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RingCursor {
    index: usize,
}

pub struct FrameRing<T> {
    storage: NonNull<T>,
    layout: Layout,
    /// Slot count; usable capacity is `size - 1`.
    size: usize,
    safety_margin: usize,
    read_idx: CachePadded<AtomicUsize>,
    write_idx: CachePadded<AtomicUsize>,
    overflow: AtomicU64,
}

// The ring hands out &T only for slots in the live range, which the single
// producer never mutates; index handoff uses acquire/release.
unsafe impl<T: Send> Send for FrameRing<T> {}
unsafe impl<T: Send + Sync> Sync for FrameRing<T> {}

impl<T> FrameRing<T> {
    pub fn new(capacity: usize) -> Self {
        Self::with_safety_margin(capacity, DEFAULT_SAFETY_MARGIN)
    }

    pub fn with_safety_margin(capacity: usize, safety_margin: usize) -> Self {
        assert!(capacity >= 1, "ring capacity must be at least 1");
        let size = capacity + 1;
        let align = std::mem::align_of::<T>().max(RING_ALLOC_ALIGN);
        let layout = Layout::from_size_align(size * std::mem::size_of::<T>(), align)
            .expect("ring layout");
        let storage = unsafe { alloc(layout) as *mut T };
        let storage = NonNull::new(storage).expect("ring allocation failed");
        Self {
            storage,
            layout,
            size,
            safety_margin,
            read_idx: CachePadded::new(AtomicUsize::new(0)),
            write_idx: CachePadded::new(AtomicUsize::new(0)),
            overflow: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.size - 1
    }

    fn wrap(&self, index: usize) -> usize {
        if index >= self.size {
            index - self.size
        } else {
            index
        }
    }

    fn slot_ptr(&self, index: usize) -> *mut T {
        debug_assert!(index < self.size);
        unsafe { self.storage.as_ptr().add(index) }
    }

    /// Producer side. Fails (and counts) instead of overrunning the oldest
    /// unread element.
    pub fn write(&self, item: T) -> bool {
        let current = self.write_idx.load(Ordering::Relaxed);
        let next = self.wrap(current + 1);
        if next == self.read_idx.load(Ordering::Acquire) {
            self.overflow.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        unsafe { ptr::write(self.slot_ptr(current), item) };
        self.write_idx.store(next, Ordering::Release);
        true
    }

    /// Advance the read index by up to `n`, running element destructors.
    /// Returns how many elements were actually popped.
    pub fn pop(&self, n: usize) -> usize {
        let mut popped = 0;
        let mut current = self.read_idx.load(Ordering::Relaxed);
        while popped < n {
            if current == self.write_idx.load(Ordering::Acquire) {
                break;
            }
            unsafe { ptr::drop_in_place(self.slot_ptr(current)) };
            current = self.wrap(current + 1);
            self.read_idx.store(current, Ordering::Release);
            popped += 1;
        }
        popped
    }

    pub fn clear(&self) {
        self.pop(self.occupancy());
    }

    pub fn is_empty(&self) -> bool {
        self.read_idx.load(Ordering::Acquire) == self.write_idx.load(Ordering::Acquire)
    }

    /// Estimate only: producer and readers mutate the indices concurrently,
    /// callers must tolerate a slack of one element.
    pub fn occupancy(&self) -> usize {
        let write = self.write_idx.load(Ordering::Acquire);
        let read = self.read_idx.load(Ordering::Acquire);
        if write >= read {
            write - read
        } else {
            write + self.size - read
        }
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    /// Oldest element. May be stale by the time the caller looks at it.
    pub fn front(&self) -> Option<&T> {
        let read = self.read_idx.load(Ordering::Relaxed);
        if read == self.write_idx.load(Ordering::Acquire) {
            return None;
        }
        Some(unsafe { &*self.slot_ptr(read) })
    }

    /// Newest element. May be stale by the time the caller looks at it.
    pub fn back(&self) -> Option<&T> {
        let write = self.write_idx.load(Ordering::Acquire);
        if write == self.read_idx.load(Ordering::Acquire) {
            return None;
        }
        let last = if write == 0 { self.size - 1 } else { write - 1 };
        Some(unsafe { &*self.slot_ptr(last) })
    }

    fn in_live_range(&self, index: usize) -> bool {
        let read = self.read_idx.load(Ordering::Acquire);
        let write = self.write_idx.load(Ordering::Acquire);
        if read <= write {
            index >= read && index < write
        } else {
            index >= read || index < write
        }
    }

    /// Iterate forward from `cursor`; stops as soon as the position leaves
    /// the live range, so a reader racing the producer sees a consistent
    /// prefix rather than garbage.
    pub fn iter_at(&self, cursor: RingCursor) -> RingIter<'_, T> {
        RingIter {
            ring: self,
            index: cursor.index,
        }
    }

    pub fn begin(&self) -> Option<RingCursor> {
        let read = self.read_idx.load(Ordering::Relaxed);
        if read == self.write_idx.load(Ordering::Acquire) {
            return None;
        }
        Some(RingCursor { index: read })
    }

    /// Flat view of the backing allocation for the zero-copy recorder.
    pub fn region(&self) -> RingRegion {
        RingRegion {
            base: self.storage.as_ptr() as *const u8,
            slots: self.size,
            slot_size: std::mem::size_of::<T>(),
        }
    }

    pub fn read_index(&self) -> usize {
        self.read_idx.load(Ordering::Acquire)
    }

    pub fn write_index(&self) -> usize {
        self.write_idx.load(Ordering::Acquire)
    }
}

impl<T: FrameChunk> FrameRing<T> {
    pub fn front_timestamp(&self) -> Option<u64> {
        self.front().map(|e| e.first_timestamp())
    }

    pub fn back_timestamp(&self) -> Option<u64> {
        self.back().map(|e| e.first_timestamp())
    }

    /// Locate the element whose timestamp range contains `ts`.
    ///
    /// Fixed-rate streams resolve this arithmetically in O(1); when the gap
    /// registry reports discontinuities (`with_gaps`), or the stream is
    /// variable-rate, the circular binary search is used instead.
    pub fn lower_bound(&self, ts: u64, with_gaps: bool) -> Option<RingCursor> {
        if with_gaps || T::TICK_DISTANCE == 0 {
            self.binary_search(ts)
        } else {
            self.fixed_rate_lookup(ts)
        }
    }

    fn fixed_rate_lookup(&self, ts: u64) -> Option<RingCursor> {
        let start = self.read_idx.load(Ordering::Relaxed);
        if start == self.write_idx.load(Ordering::Acquire) {
            return None;
        }
        let occupancy = self.occupancy();
        let front_ts = unsafe { &*self.slot_ptr(start) }.first_timestamp();
        let span = T::element_span();
        let settled = occupancy.saturating_sub(self.safety_margin) as u64;
        let newest_settled_ts = front_ts + settled * span;
        if ts < front_ts || ts > newest_settled_ts {
            return None;
        }
        let tick_diff = (ts - front_ts) / T::TICK_DISTANCE;
        let offset = tick_diff as usize / T::FRAMES_PER_CHUNK;
        let index = self.wrap(start + offset);
        if !self.in_live_range(index) {
            return None;
        }
        Some(RingCursor { index })
    }

    /// Bisection over the circular live range `[read, write)`. Returns the
    /// last element whose first timestamp does not exceed `ts` (the front
    /// element if `ts` precedes the whole buffer), or `None` when the newest
    /// element is still older than `ts`.
    fn binary_search(&self, ts: u64) -> Option<RingCursor> {
        let mut start = self.read_idx.load(Ordering::Relaxed);
        let end = self.write_idx.load(Ordering::Acquire);
        if start == end {
            return None;
        }
        let mut end = if end == 0 { self.size - 1 } else { end - 1 };

        let newest = unsafe { &*self.slot_ptr(end) }.first_timestamp();
        if newest < ts {
            return None;
        }

        loop {
            let diff = if start <= end {
                end - start
            } else {
                self.size + end - start
            };
            let middle = self.wrap(start + (diff + 1) / 2);
            if diff == 0 {
                return Some(RingCursor { index: middle });
            }
            let middle_ts = unsafe { &*self.slot_ptr(middle) }.first_timestamp();
            if ts < middle_ts {
                end = if middle == 0 { self.size - 1 } else { middle - 1 };
            } else {
                start = middle;
            }
        }
    }
}

impl<T> Drop for FrameRing<T> {
    fn drop(&mut self) {
        if std::mem::needs_drop::<T>() {
            let mut read = *self.read_idx.get_mut();
            let end = *self.write_idx.get_mut();
            while read != end {
                unsafe { ptr::drop_in_place(self.slot_ptr(read)) };
                read = self.wrap(read + 1);
            }
        }
        unsafe { dealloc(self.storage.as_ptr() as *mut u8, self.layout) };
    }
}

pub struct RingIter<'a, T> {
    ring: &'a FrameRing<T>,
    index: usize,
}

impl<'a, T> Iterator for RingIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        if !self.ring.in_live_range(self.index) {
            return None;
        }
        let item = unsafe { &*self.ring.slot_ptr(self.index) };
        self.index = self.ring.wrap(self.index + 1);
        Some(item)
    }
}

/// Read-side access to the raw ring allocation, for the zero-copy recorder.
///
/// Slots outside the live range hold dead data; callers must only interpret
/// slots inside `live_range()`, and only while eviction is prevented from
/// crossing their position.
pub trait RingAccess: Send + Sync {
    fn region(&self) -> RingRegion;

    /// Current `(read, write)` slot indices; the live range is `[read, write)`
    /// circularly.
    fn live_range(&self) -> (usize, usize);

    /// First timestamp of the element in `slot`. Meaningful only for live
    /// slots.
    fn slot_timestamp(&self, slot: usize) -> u64;
}

impl<T: FrameChunk> RingAccess for FrameRing<T> {
    fn region(&self) -> RingRegion {
        FrameRing::region(self)
    }

    fn live_range(&self) -> (usize, usize) {
        (
            self.read_idx.load(Ordering::Acquire),
            self.write_idx.load(Ordering::Acquire),
        )
    }

    fn slot_timestamp(&self, slot: usize) -> u64 {
        unsafe { &*self.slot_ptr(slot) }.first_timestamp()
    }
}

/// Raw span of the ring allocation, consumed by the zero-copy recorder.
#[derive(Debug, Copy, Clone)]
pub struct RingRegion {
    pub base: *const u8,
    pub slots: usize,
    pub slot_size: usize,
}

unsafe impl Send for RingRegion {}

impl RingRegion {
    pub fn len(&self) -> usize {
        self.slots * self.slot_size
    }

    pub fn is_empty(&self) -> bool {
        self.slots == 0
    }
}
