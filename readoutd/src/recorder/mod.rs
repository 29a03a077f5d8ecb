//! Concurrent recording of the latency buffer to disk.
//!
//! Two modes. Copy mode chases a timestamp cursor through the buffer with
//! gap-tolerant lookups and streams elements through the buffered writer
//! (optional compression, O_DIRECT block sink). Zero-copy direct mode walks
//! the ring allocation itself and hands page-aligned spans straight to the
//! file, clearing O_DIRECT only for the wrap tail and the final partial
//! element.
//!
//! Either way the recording treats the buffer as read-only, never blocks the
//! consumer, and publishes `next_timestamp_to_record` so eviction will not
//! pop data that has not been written yet.

pub mod writer;

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use readout_frames::FrameChunk;

use crate::buffer::ring::RingAccess;
use crate::buffer::LatencyBuffer;
use crate::error::{ReadoutError, Result};
use crate::metrics::LinkMetrics;
use crate::request::CleanupBarrier;
use writer::{set_o_direct, BufferedFileWriter, DIRECT_IO_ALIGNMENT};

/// Elements written per pass before re-checking the clock and the barrier.
const MAX_CHUNKS_PER_PASS: usize = 100_000;
/// Spans written per pass in direct mode.
const MAX_SPANS_PER_PASS: usize = 100;

/// State shared between the recording task and the evictor.
pub struct RecordingShared {
    pub recording: AtomicBool,
    /// Oldest timestamp the recording still needs; eviction never crosses
    /// it. `u64::MAX` while no recording is active, 0 while the cursor is
    /// still unseeded.
    pub next_timestamp_to_record: AtomicU64,
}

impl Default for RecordingShared {
    fn default() -> Self {
        Self {
            recording: AtomicBool::new(false),
            next_timestamp_to_record: AtomicU64::new(u64::MAX),
        }
    }
}

impl RecordingShared {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eviction_limit(&self) -> u64 {
        self.next_timestamp_to_record.load(Ordering::Acquire)
    }
}

/// Copy-mode recording loop. Runs on its own thread until the duration
/// elapses or the run stops; flushes the writer before returning.
pub fn run_copy_recording<T: FrameChunk, B: LatencyBuffer<T>>(
    buffer: &B,
    barrier: &CleanupBarrier,
    shared: &RecordingShared,
    writer: &mut BufferedFileWriter,
    duration: Duration,
    run_marker: &AtomicBool,
    metrics: &LinkMetrics,
) {
    info!("start recording for {}s to {}", duration.as_secs(), writer.path().display());
    shared.next_timestamp_to_record.store(0, Ordering::Release);
    let deadline = Instant::now() + duration;
    let mut write_failure_logged = false;

    while Instant::now() < deadline && run_marker.load(Ordering::Acquire) {
        barrier.wait_cleanup_clear();

        let mut next = shared.next_timestamp_to_record.load(Ordering::Acquire);
        if next == 0 {
            match buffer.front_timestamp() {
                Some(ts) => {
                    next = ts;
                    shared.next_timestamp_to_record.store(next, Ordering::Release);
                }
                None => {
                    std::thread::sleep(Duration::from_millis(1));
                    continue;
                }
            }
        }

        let mut processed = 0usize;
        let mut last_written: Option<u64> = None;
        barrier.enter_request();
        buffer.scan_from(next, true, &mut |element: &T| {
            let ts = element.first_timestamp();
            if ts >= next {
                if writer.write_element(element) {
                    processed += 1;
                    metrics.payloads_written.fetch_add(1, Ordering::Relaxed);
                } else if !write_failure_logged {
                    warn!("recording write failed, continuing");
                    write_failure_logged = true;
                }
                last_written = Some(ts);
            }
            processed < MAX_CHUNKS_PER_PASS
        });
        barrier.exit_request();

        match last_written {
            Some(ts) => {
                let advance = T::element_span().max(1);
                shared
                    .next_timestamp_to_record
                    .store(ts + advance, Ordering::Release);
            }
            None => std::thread::sleep(Duration::from_millis(1)),
        }
    }

    shared
        .next_timestamp_to_record
        .store(u64::MAX, Ordering::Release);
    if let Err(e) = writer.finish() {
        warn!("failed to flush recording: {e}");
    }
    info!("stop recording");
}

/// Zero-copy recording loop over the ring allocation.
///
/// The write cursor starts at the first live element whose byte offset is
/// page-aligned, then advances in `chunk_size` spans (a multiple of the page
/// size). Spans never cross the newest element, so the memory they cover is
/// stable: eviction stays behind `next_timestamp_to_record` and the producer
/// only touches slots outside the live range. At the buffer wrap the
/// remaining tail is written once with O_DIRECT cleared (its length is not
/// block-sized), after which the file offset is unaligned and direct I/O
/// stays off for the rest of the recording.
#[allow(clippy::too_many_arguments)]
pub fn run_direct_recording(
    ring: &dyn RingAccess,
    barrier: &CleanupBarrier,
    shared: &RecordingShared,
    path: &Path,
    chunk_size: usize,
    use_o_direct: bool,
    duration: Duration,
    run_marker: &AtomicBool,
) -> Result<()> {
    let region = ring.region();
    let slot_size = region.slot_size;
    let mut options = OpenOptions::new();
    options.create(true).write(true).truncate(true);
    if use_o_direct {
        options.custom_flags(libc::O_DIRECT);
    }
    let mut file = options.open(path).map_err(|source| ReadoutError::CannotOpenFile {
        path: path.to_path_buf(),
        source,
    })?;

    info!(
        "start zero-copy recording for {}s to {}",
        duration.as_secs(),
        path.display()
    );
    shared.next_timestamp_to_record.store(0, Ordering::Release);
    let deadline = Instant::now() + duration;
    let mut direct_on = use_o_direct;
    let mut cursor: Option<usize> = None;
    let mut bytes_written = 0u64;
    let mut write_failure_logged = false;

    while Instant::now() < deadline && run_marker.load(Ordering::Acquire) {
        barrier.wait_cleanup_clear();

        let (read, write) = ring.live_range();
        if read == write {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }

        let mut c = match cursor {
            Some(c) => c,
            None => {
                // Skip to the first live element sitting on a page boundary.
                let mut slot = read;
                let mut skipped = 0usize;
                while (slot * slot_size) % DIRECT_IO_ALIGNMENT != 0 && skipped <= region.slots {
                    slot = (slot + 1) % region.slots;
                    skipped += 1;
                }
                let live = if read <= write {
                    slot >= read && slot < write
                } else {
                    slot >= read || slot < write
                };
                if !live {
                    std::thread::sleep(Duration::from_millis(1));
                    continue;
                }
                if skipped > 0 {
                    debug!("skipped {skipped} elements to reach an aligned start");
                }
                shared
                    .next_timestamp_to_record
                    .store(ring.slot_timestamp(slot), Ordering::Release);
                cursor = Some(slot * slot_size);
                slot * slot_size
            }
        };

        let end_byte = write * slot_size;
        let mut spans = 0usize;
        while spans < MAX_SPANS_PER_PASS {
            let mut advanced = false;
            if c < end_byte {
                if c + chunk_size <= end_byte {
                    if write_ring_span(&mut file, &region, c, chunk_size, true, &mut direct_on) {
                        bytes_written += chunk_size as u64;
                    } else if !write_failure_logged {
                        warn!("zero-copy recording write failed, continuing");
                        write_failure_logged = true;
                    }
                    c += chunk_size;
                    advanced = true;
                }
            } else if c > end_byte {
                if c + chunk_size <= region.len() {
                    if write_ring_span(&mut file, &region, c, chunk_size, true, &mut direct_on) {
                        bytes_written += chunk_size as u64;
                    } else if !write_failure_logged {
                        warn!("zero-copy recording write failed, continuing");
                        write_failure_logged = true;
                    }
                    c += chunk_size;
                    advanced = true;
                } else {
                    let tail = region.len() - c;
                    if tail > 0 && write_ring_span(&mut file, &region, c, tail, false, &mut direct_on) {
                        bytes_written += tail as u64;
                    }
                    c = 0;
                    advanced = true;
                }
            }
            if !advanced {
                break;
            }
            spans += 1;
            // Republish the cursor element so eviction cannot cross it. A
            // cursor parked on the wrap boundary points at no live element
            // and keeps the previous limit.
            let slot = (c / slot_size) % region.slots;
            let slot_live = if read <= write {
                slot >= read && slot < write
            } else {
                slot >= read || slot < write
            };
            if c < region.len() && slot_live {
                shared
                    .next_timestamp_to_record
                    .store(ring.slot_timestamp(slot), Ordering::Release);
            }
        }
        cursor = Some(c);
        if spans == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    // Complete the element the cursor stopped inside, so the file ends on an
    // element boundary.
    if let Some(c) = cursor {
        let started = (c / slot_size) * slot_size;
        if started != c {
            let complete_to = started + slot_size;
            if write_ring_span(&mut file, &region, c, complete_to - c, false, &mut direct_on) {
                bytes_written += (complete_to - c) as u64;
            }
        }
    }

    shared
        .next_timestamp_to_record
        .store(u64::MAX, Ordering::Release);
    info!("stop zero-copy recording, wrote {bytes_written} bytes");
    Ok(())
}


/// Write one span of the ring allocation. Unaligned spans clear O_DIRECT
/// first; the flag stays off because the file offset is no longer
/// block-aligned afterwards.
fn write_ring_span(
    file: &mut std::fs::File,
    region: &crate::buffer::RingRegion,
    offset: usize,
    len: usize,
    aligned: bool,
    direct_on: &mut bool,
) -> bool {
    debug_assert!(offset + len <= region.len());
    if *direct_on && !aligned {
        if set_o_direct(file, false).is_err() {
            return false;
        }
        *direct_on = false;
        debug!("unaligned span: direct I/O disabled for the rest of the recording");
    }
    // SAFETY: the span lies inside the live range; those slots are mutated
    // neither by the producer nor by eviction while the recording cursor
    // pins them.
    let span = unsafe { std::slice::from_raw_parts(region.base.add(offset), len) };
    file.write_all(span).is_ok()
}
