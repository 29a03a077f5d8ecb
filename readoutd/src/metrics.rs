use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

use serde::Serialize;

/// Per-link counters, updated from the hot paths, so all fields are atomic.
///
/// Interval counters follow the `total` / `since last snapshot` split: the
/// snapshot exchanges the interval counter back to zero.
#[derive(Default)]
pub struct LinkMetrics {
    pub packets: AtomicU64,
    pub packets_total: AtomicU64,
    pub requests: AtomicU64,
    pub requests_total: AtomicU64,
    pub overwritten_packet_count: AtomicU64,
    pub rawq_timeout_count: AtomicU64,
    /// Drained by the stats thread for rate logging.
    pub stats_packet_count: AtomicU64,
    pub ts_error_count: AtomicU64,
    pub frame_error_count: AtomicU64,

    pub num_requests_found: AtomicU64,
    pub num_requests_bad: AtomicU64,
    pub num_requests_old_window: AtomicU64,
    pub num_requests_delayed: AtomicU64,
    pub num_requests_uncategorized: AtomicU64,
    pub num_requests_invalid_window: AtomicU64,
    pub num_requests_timed_out: AtomicU64,
    pub num_requests_waiting: AtomicUsize,
    pub handled_requests: AtomicU64,
    pub response_time_us_acc: AtomicU64,

    pub num_buffer_cleanups: AtomicU64,
    pub pops_count: AtomicU64,
    pub occupancy: AtomicUsize,

    pub fragment_sink_timeouts: AtomicU64,
    pub timesync_sink_timeouts: AtomicU64,

    pub num_hits_found: AtomicU64,
    pub payloads_written: AtomicU64,
    pub is_recording: AtomicBool,
}

/// Serializable counter snapshot returned by `get_info`.
#[derive(Debug, Serialize)]
pub struct LinkInfo {
    pub packets: u64,
    pub new_packets: u64,
    pub requests: u64,
    pub new_requests: u64,
    pub overwritten_packet_count: u64,
    pub rawq_timeout_count: u64,
    pub ts_error_count: u64,
    pub frame_error_count: u64,
    pub num_requests_found: u64,
    pub num_requests_bad: u64,
    pub num_requests_old_window: u64,
    pub num_requests_delayed: u64,
    pub num_requests_uncategorized: u64,
    pub num_requests_invalid_window: u64,
    pub num_requests_timed_out: u64,
    pub num_requests_waiting: usize,
    pub num_buffer_cleanups: u64,
    pub pops_count: u64,
    pub occupancy: usize,
    pub fragment_sink_timeouts: u64,
    pub timesync_sink_timeouts: u64,
    pub num_hits_found: u64,
    pub payloads_written: u64,
    pub is_recording: bool,
    pub avg_request_response_time_us: u64,
}

impl LinkMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_packet(&self) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.packets_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response_time_us(&self, us: u64) {
        self.handled_requests.fetch_add(1, Ordering::Relaxed);
        self.response_time_us_acc.fetch_add(us, Ordering::Relaxed);
    }

    /// Counters that must restart at zero for every run.
    pub fn reset_run_counters(&self) {
        self.packets.store(0, Ordering::Relaxed);
        self.requests.store(0, Ordering::Relaxed);
        self.rawq_timeout_count.store(0, Ordering::Relaxed);
        self.stats_packet_count.store(0, Ordering::Relaxed);
        self.num_requests_found.store(0, Ordering::Relaxed);
        self.num_requests_bad.store(0, Ordering::Relaxed);
        self.num_requests_old_window.store(0, Ordering::Relaxed);
        self.num_requests_delayed.store(0, Ordering::Relaxed);
        self.num_requests_uncategorized.store(0, Ordering::Relaxed);
        self.num_requests_invalid_window.store(0, Ordering::Relaxed);
        self.num_requests_timed_out.store(0, Ordering::Relaxed);
        self.num_buffer_cleanups.store(0, Ordering::Relaxed);
        self.pops_count.store(0, Ordering::Relaxed);
        self.handled_requests.store(0, Ordering::Relaxed);
        self.response_time_us_acc.store(0, Ordering::Relaxed);
        self.payloads_written.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LinkInfo {
        let handled = self.handled_requests.swap(0, Ordering::Relaxed);
        let response_acc = self.response_time_us_acc.swap(0, Ordering::Relaxed);
        LinkInfo {
            packets: self.packets_total.load(Ordering::Relaxed),
            new_packets: self.packets.swap(0, Ordering::Relaxed),
            requests: self.requests_total.load(Ordering::Relaxed),
            new_requests: self.requests.swap(0, Ordering::Relaxed),
            overwritten_packet_count: self.overwritten_packet_count.load(Ordering::Relaxed),
            rawq_timeout_count: self.rawq_timeout_count.load(Ordering::Relaxed),
            ts_error_count: self.ts_error_count.load(Ordering::Relaxed),
            frame_error_count: self.frame_error_count.load(Ordering::Relaxed),
            num_requests_found: self.num_requests_found.swap(0, Ordering::Relaxed),
            num_requests_bad: self.num_requests_bad.swap(0, Ordering::Relaxed),
            num_requests_old_window: self.num_requests_old_window.swap(0, Ordering::Relaxed),
            num_requests_delayed: self.num_requests_delayed.swap(0, Ordering::Relaxed),
            num_requests_uncategorized: self.num_requests_uncategorized.swap(0, Ordering::Relaxed),
            num_requests_invalid_window: self.num_requests_invalid_window.swap(0, Ordering::Relaxed),
            num_requests_timed_out: self.num_requests_timed_out.swap(0, Ordering::Relaxed),
            num_requests_waiting: self.num_requests_waiting.load(Ordering::Relaxed),
            num_buffer_cleanups: self.num_buffer_cleanups.swap(0, Ordering::Relaxed),
            pops_count: self.pops_count.swap(0, Ordering::Relaxed),
            occupancy: self.occupancy.load(Ordering::Relaxed),
            fragment_sink_timeouts: self.fragment_sink_timeouts.load(Ordering::Relaxed),
            timesync_sink_timeouts: self.timesync_sink_timeouts.load(Ordering::Relaxed),
            num_hits_found: self.num_hits_found.load(Ordering::Relaxed),
            payloads_written: self.payloads_written.swap(0, Ordering::Relaxed),
            is_recording: self.is_recording.load(Ordering::Relaxed),
            avg_request_response_time_us: if handled > 0 { response_acc / handled } else { 0 },
        }
    }
}

/// Wall-clock uptime helper for the stats thread.
pub fn uptime_seconds(start: SystemTime) -> u64 {
    start.elapsed().map(|d| d.as_secs()).unwrap_or(0)
}
