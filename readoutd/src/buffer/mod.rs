//! Latency buffer variants and the interface the rest of the core sees.

pub mod ordered;
pub mod ring;

pub use ordered::OrderedBuffer;
pub use ring::{FrameRing, RingCursor, RingRegion, DEFAULT_SAFETY_MARGIN};

use readout_frames::FrameChunk;

/// Outcome of a window scan start-position resolution.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScanStart {
    /// The start element was found and the visitor ran.
    Resolved,
    /// The start position could not be resolved (transient contention or a
    /// race with the producer); the caller may retry.
    NotResolved,
}

/// The operations the consumer, request handler, evictor and recorder need
/// from a latency buffer, monomorphised per link type.
pub trait LatencyBuffer<T: FrameChunk>: Send + Sync + 'static {
    /// Append; drop-and-count when the element cannot be admitted.
    fn write(&self, element: T) -> bool;

    /// Remove up to `n` elements from the front; returns how many went.
    fn pop(&self, n: usize) -> usize;

    fn occupancy(&self) -> usize;

    fn front_timestamp(&self) -> Option<u64>;

    fn back_timestamp(&self) -> Option<u64>;

    /// Writes refused so far (ring overrun or duplicate key).
    fn dropped_writes(&self) -> u64;

    fn clear(&self);

    /// Eviction predicate: occupancy high-water mark for the ring,
    /// timestamp span for the ordered variant.
    fn needs_eviction(&self, pop_limit_size: usize) -> bool;

    /// How many elements an eviction pass should try to pop.
    fn eviction_batch(&self, pop_size_pct: f32) -> usize;

    /// Visit elements in timestamp order starting at the element containing
    /// `ts`, while the visitor returns `true`. The whole scan observes a
    /// consistent sequence even while the producer appends.
    fn scan_from(&self, ts: u64, with_gaps: bool, visit: &mut dyn FnMut(&T) -> bool) -> ScanStart;

    /// Run `f` on the newest element, if any. Used by the postprocess stage
    /// on the just-written element.
    fn with_back(&self, f: &mut dyn FnMut(&T));
}

impl<T: FrameChunk> LatencyBuffer<T> for FrameRing<T> {
    fn write(&self, element: T) -> bool {
        FrameRing::write(self, element)
    }

    fn pop(&self, n: usize) -> usize {
        FrameRing::pop(self, n)
    }

    fn occupancy(&self) -> usize {
        FrameRing::occupancy(self)
    }

    fn front_timestamp(&self) -> Option<u64> {
        FrameRing::front_timestamp(self)
    }

    fn back_timestamp(&self) -> Option<u64> {
        FrameRing::back_timestamp(self)
    }

    fn dropped_writes(&self) -> u64 {
        self.overflow_count()
    }

    fn clear(&self) {
        FrameRing::clear(self)
    }

    fn needs_eviction(&self, pop_limit_size: usize) -> bool {
        self.occupancy() > pop_limit_size
    }

    fn eviction_batch(&self, pop_size_pct: f32) -> usize {
        (pop_size_pct * self.occupancy() as f32) as usize
    }

    fn scan_from(&self, ts: u64, with_gaps: bool, visit: &mut dyn FnMut(&T) -> bool) -> ScanStart {
        let Some(cursor) = self.lower_bound(ts, with_gaps) else {
            return ScanStart::NotResolved;
        };
        for element in self.iter_at(cursor) {
            if !visit(element) {
                break;
            }
        }
        ScanStart::Resolved
    }

    fn with_back(&self, f: &mut dyn FnMut(&T)) {
        if let Some(element) = self.back() {
            f(element);
        }
    }
}

impl<T: FrameChunk> LatencyBuffer<T> for OrderedBuffer<T> {
    fn write(&self, element: T) -> bool {
        OrderedBuffer::write(self, element)
    }

    fn pop(&self, n: usize) -> usize {
        self.pop_front(n)
    }

    fn occupancy(&self) -> usize {
        OrderedBuffer::occupancy(self)
    }

    fn front_timestamp(&self) -> Option<u64> {
        OrderedBuffer::front_timestamp(self)
    }

    fn back_timestamp(&self) -> Option<u64> {
        OrderedBuffer::back_timestamp(self)
    }

    fn dropped_writes(&self) -> u64 {
        self.rejected_count()
    }

    fn clear(&self) {
        OrderedBuffer::clear(self)
    }

    fn needs_eviction(&self, _pop_limit_size: usize) -> bool {
        self.span() > self.max_span()
    }

    fn eviction_batch(&self, _pop_size_pct: f32) -> usize {
        self.over_span_count()
    }

    fn scan_from(&self, ts: u64, with_gaps: bool, visit: &mut dyn FnMut(&T) -> bool) -> ScanStart {
        let _ = with_gaps; // ordered lookup is always a tree search
        let accessor = self.accessor();
        let Some(iter) = accessor.iter_from(ts) else {
            return ScanStart::NotResolved;
        };
        for element in iter {
            if !visit(element) {
                break;
            }
        }
        ScanStart::Resolved
    }

    fn with_back(&self, f: &mut dyn FnMut(&T)) {
        let accessor = self.accessor();
        if let Some(element) = accessor.last() {
            f(element);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use readout_frames::{PdChunk, TpcChunk};

    #[test]
    fn ring_scan_visits_in_order_until_visitor_stops() {
        let ring: FrameRing<TpcChunk> = FrameRing::with_safety_margin(32, 0);
        for i in 0..10u64 {
            ring.write(TpcChunk::at_timestamp(i * 300));
        }
        let mut seen = Vec::new();
        let outcome = LatencyBuffer::scan_from(&ring, 600, false, &mut |e: &TpcChunk| {
            seen.push(e.first_timestamp());
            e.first_timestamp() < 1500
        });
        assert_eq!(outcome, ScanStart::Resolved);
        assert_eq!(seen, vec![600, 900, 1200, 1500]);
    }

    #[test]
    fn ordered_scan_resolves_mid_gap() {
        let buffer: OrderedBuffer<PdChunk> = OrderedBuffer::new(100_000);
        for ts in [100u64, 700, 1300] {
            buffer.write(PdChunk::at_timestamp(ts));
        }
        let mut seen = Vec::new();
        let outcome = LatencyBuffer::scan_from(&buffer, 800, true, &mut |e: &PdChunk| {
            seen.push(e.first_timestamp());
            true
        });
        assert_eq!(outcome, ScanStart::Resolved);
        assert_eq!(seen, vec![700, 1300]);
    }

    #[test]
    fn eviction_predicates_differ_per_variant() {
        let ring: FrameRing<TpcChunk> = FrameRing::new(10);
        for i in 0..9u64 {
            ring.write(TpcChunk::at_timestamp(i * 300));
        }
        assert!(LatencyBuffer::needs_eviction(&ring, 8));
        assert!(!LatencyBuffer::needs_eviction(&ring, 9));

        let buffer: OrderedBuffer<PdChunk> = OrderedBuffer::new(500);
        buffer.write(PdChunk::at_timestamp(0));
        buffer.write(PdChunk::at_timestamp(400));
        assert!(!LatencyBuffer::needs_eviction(&buffer, usize::MAX));
        buffer.write(PdChunk::at_timestamp(900));
        assert!(LatencyBuffer::needs_eviction(&buffer, usize::MAX));
    }
}
