//! Trigger-driven request handling against the latency buffer.
//!
//! Requests are classified and served by a fixed pool of worker threads.
//! A request whose window extends past the newest buffered data waits on the
//! waiting list and is re-evaluated by the housekeeper; eviction is
//! coordinated with the workers through a cleanup barrier so it never runs
//! concurrently with a window extraction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};
use readout_frames::messages::{error_bits, DataRequest, Fragment, FragmentHeader};
use readout_frames::FrameChunk;

use crate::buffer::ring::RingAccess;
use crate::buffer::{LatencyBuffer, ScanStart};
use crate::config::{Config, RecordingConfig};
use crate::error::{ReadoutError, Result};
use crate::gaps::GapRegistry;
use crate::metrics::LinkMetrics;
use crate::queues::{self, PushError, Sink};
use crate::recorder::{self, RecordingShared};

/// Queue depth between the requester and the worker pool.
const TASK_QUEUE_DEPTH: usize = 1024;
const WORKER_POP_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResultCode {
    Found,
    NotFound,
    NotYet,
    Pass,
    Unknown,
}

struct RequestResult {
    code: ResultCode,
    fragment: Option<Fragment>,
}

struct RequestTask {
    request: DataRequest,
    sink: Sink<Fragment>,
}

struct WaitingRequest {
    request: DataRequest,
    sink: Sink<Fragment>,
    retry_count: usize,
}

#[derive(Default)]
struct BarrierState {
    cleanup_requested: bool,
    requests_running: usize,
}

/// Mutex-plus-condvar coordination between request workers, eviction and the
/// recorder. Workers block at the barrier while a cleanup is requested;
/// cleanup waits until no request is running.
#[derive(Default)]
pub struct CleanupBarrier {
    state: Mutex<BarrierState>,
    condvar: Condvar,
}

impl CleanupBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter_request(&self) {
        let mut state = self.state.lock();
        while state.cleanup_requested {
            self.condvar.wait(&mut state);
        }
        state.requests_running += 1;
    }

    pub fn exit_request(&self) {
        {
            let mut state = self.state.lock();
            state.requests_running -= 1;
        }
        self.condvar.notify_all();
    }

    pub fn wait_cleanup_clear(&self) {
        let mut state = self.state.lock();
        while state.cleanup_requested {
            self.condvar.wait(&mut state);
        }
    }

    /// Run `work` with every request worker held at the barrier. Returns
    /// false without running when `should` declines or another cleanup is
    /// already in flight.
    pub fn run_exclusive(&self, should: impl FnOnce() -> bool, work: impl FnOnce()) -> bool {
        let mut state = self.state.lock();
        if state.cleanup_requested || !should() {
            return false;
        }
        state.cleanup_requested = true;
        while state.requests_running > 0 {
            self.condvar.wait(&mut state);
        }
        work();
        state.cleanup_requested = false;
        drop(state);
        self.condvar.notify_all();
        true
    }
}

/// Handler configuration derived from the link configuration at `conf`.
#[derive(Debug, Clone)]
pub struct RequestHandlerConfig {
    pub pop_limit_pct: f32,
    pub pop_size_pct: f32,
    pub buffer_capacity: usize,
    pub num_threads: usize,
    pub retry_limit: usize,
    pub fragment_queue_timeout: Duration,
    pub apa_number: u32,
    pub link_number: u32,
    pub recording: RecordingConfig,
}

impl RequestHandlerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pop_limit_pct: config.link.pop_limit_pct,
            pop_size_pct: config.link.pop_size_pct,
            buffer_capacity: config.link.latency_buffer_size,
            num_threads: config.link.num_request_handling_threads,
            retry_limit: config.link.retry_count,
            fragment_queue_timeout: Duration::from_millis(config.link.fragment_queue_timeout_ms),
            apa_number: config.link.apa_number,
            link_number: config.link.link_number,
            recording: config.recording.clone(),
        }
    }
}

pub struct RequestHandler<T: FrameChunk, B: LatencyBuffer<T>> {
    buffer: Arc<B>,
    gaps: Arc<GapRegistry>,
    metrics: Arc<LinkMetrics>,
    cfg: RequestHandlerConfig,
    /// Occupancy above which eviction runs (ring variant).
    pop_limit_size: usize,
    /// Widest window accepted, in elements; zero disables the cap.
    max_requested_elements: u64,

    barrier: Arc<CleanupBarrier>,
    waiting: Mutex<Vec<WaitingRequest>>,
    run_marker: AtomicBool,
    timeout_warned: AtomicBool,

    task_tx: Mutex<Option<Sink<RequestTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,

    rec_shared: Arc<RecordingShared>,
    recording_thread: Mutex<Option<JoinHandle<()>>>,
    ring_access: Option<Arc<dyn RingAccess>>,

    _marker: std::marker::PhantomData<T>,
}

impl<T: FrameChunk, B: LatencyBuffer<T>> RequestHandler<T, B> {
    pub fn new(
        buffer: Arc<B>,
        gaps: Arc<GapRegistry>,
        metrics: Arc<LinkMetrics>,
        cfg: RequestHandlerConfig,
        ring_access: Option<Arc<dyn RingAccess>>,
    ) -> Self {
        let pop_limit_size = (cfg.pop_limit_pct * cfg.buffer_capacity as f32) as usize;
        let max_requested_elements =
            (pop_limit_size as f32 - pop_limit_size as f32 * cfg.pop_size_pct) as u64;
        debug!(
            "request handler configured: pop limit {} elements, pop size {:.0}%, max window {} elements",
            pop_limit_size,
            cfg.pop_size_pct * 100.0,
            max_requested_elements
        );
        Self {
            buffer,
            gaps,
            metrics,
            cfg,
            pop_limit_size,
            max_requested_elements,
            barrier: Arc::new(CleanupBarrier::new()),
            waiting: Mutex::new(Vec::new()),
            run_marker: AtomicBool::new(false),
            timeout_warned: AtomicBool::new(false),
            task_tx: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            rec_shared: Arc::new(RecordingShared::new()),
            recording_thread: Mutex::new(None),
            ring_access,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn barrier(&self) -> &Arc<CleanupBarrier> {
        &self.barrier
    }

    pub fn recording_shared(&self) -> &Arc<RecordingShared> {
        &self.rec_shared
    }

    /// Spawn the worker pool.
    pub fn start(self: &Arc<Self>) {
        self.run_marker.store(true, Ordering::Release);
        self.timeout_warned.store(false, Ordering::Relaxed);
        let (tx, rx) = queues::pair::<RequestTask>(TASK_QUEUE_DEPTH);
        let mut workers = self.workers.lock();
        for i in 0..self.cfg.num_threads {
            let handler = Arc::clone(self);
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("reqwork-{}-{i}", self.cfg.link_number))
                .spawn(move || {
                    loop {
                        match rx.recv_timeout(WORKER_POP_TIMEOUT) {
                            Ok(task) => handler.execute(task),
                            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                        }
                    }
                })
                .expect("spawn request worker");
            workers.push(handle);
        }
        *self.task_tx.lock() = Some(tx);
    }

    /// Stop accepting work: waiting requests from now on drain as
    /// end-of-run fragments via `scan_waiting`.
    pub fn begin_stop(&self) {
        self.run_marker.store(false, Ordering::Release);
    }

    /// Join the recording task and the worker pool. Call after the waiting
    /// list has drained.
    pub fn stop(&self) {
        self.begin_stop();
        if let Some(handle) = self.recording_thread.lock().take() {
            let _ = handle.join();
        }
        // Dropping the sender lets workers drain the queue and exit.
        *self.task_tx.lock() = None;
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        self.metrics.num_requests_waiting.store(0, Ordering::Relaxed);
    }

    pub fn has_waiting(&self) -> bool {
        !self.waiting.lock().is_empty()
    }

    /// Non-blocking: hand the request to the worker pool. A saturated pool
    /// defers the request to the waiting list instead of blocking.
    pub fn issue_request(&self, request: DataRequest, sink: Sink<Fragment>) {
        let tx = self.task_tx.lock();
        let Some(tx) = tx.as_ref() else {
            return;
        };
        if let Err(err) = tx.try_send(RequestTask { request, sink }) {
            let task = match err {
                crossbeam_channel::TrySendError::Full(task) => task,
                crossbeam_channel::TrySendError::Disconnected(_) => return,
            };
            let mut waiting = self.waiting.lock();
            waiting.push(WaitingRequest {
                request: task.request,
                sink: task.sink,
                retry_count: 0,
            });
            self.metrics
                .num_requests_waiting
                .store(waiting.len(), Ordering::Relaxed);
        }
    }

    fn execute(&self, task: RequestTask) {
        self.barrier.enter_request();
        let t0 = Instant::now();
        let result = self.data_request(&task.request);
        self.barrier.exit_request();

        match result.code {
            ResultCode::NotYet => {
                debug!(
                    "re-queue request with trigger timestamp {}",
                    task.request.trigger_timestamp
                );
                let mut waiting = self.waiting.lock();
                waiting.push(WaitingRequest {
                    request: task.request,
                    sink: task.sink,
                    retry_count: 0,
                });
                self.metrics
                    .num_requests_waiting
                    .store(waiting.len(), Ordering::Relaxed);
            }
            _ => {
                if let Some(fragment) = result.fragment {
                    self.push_fragment(fragment, &task.sink);
                }
            }
        }

        self.metrics
            .record_response_time_us(t0.elapsed().as_micros() as u64);
    }

    fn push_fragment(&self, fragment: Fragment, sink: &Sink<Fragment>) {
        debug!(
            "sending fragment for trigger {} run {} link {}",
            fragment.header.trigger_number, fragment.header.run_number, self.cfg.link_number
        );
        if let Err(PushError::Full(_) | PushError::Disconnected(_)) =
            queues::push_timeout(sink, fragment, self.cfg.fragment_queue_timeout)
        {
            warn!(
                "cannot write to fragment queue for link {}",
                self.cfg.link_number
            );
            self.metrics
                .fragment_sink_timeouts
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    fn make_header(&self, request: &DataRequest) -> FragmentHeader {
        FragmentHeader {
            trigger_number: request.trigger_number,
            trigger_timestamp: request.trigger_timestamp,
            window_begin: request.window_begin,
            window_end: request.window_end,
            run_number: request.run_number,
            sequence_number: request.sequence_number,
            detector_id: self.cfg.apa_number,
            link_id: self.cfg.link_number,
            fragment_type: T::FRAGMENT_TYPE,
            system_type: T::SYSTEM_TYPE,
            error_bits: 0,
        }
    }

    /// Classify and serve one request against the latency buffer.
    fn data_request(&self, request: &DataRequest) -> RequestResult {
        let header = self.make_header(request);
        let begin = request.window_begin;
        let end = request.window_end;

        // Malformed or oversized windows never retry.
        let span = T::element_span();
        let too_wide = span != 0
            && self.max_requested_elements != 0
            && end > begin
            && (end - begin).div_ceil(span) > self.max_requested_elements;
        if end <= begin || too_wide {
            self.metrics
                .num_requests_invalid_window
                .fetch_add(1, Ordering::Relaxed);
            self.metrics.num_requests_bad.fetch_add(1, Ordering::Relaxed);
            return RequestResult {
                code: ResultCode::Pass,
                fragment: Some(Fragment::empty(header, error_bits::INVALID_WINDOW)),
            };
        }

        if self.buffer.occupancy() == 0 {
            self.metrics.num_requests_bad.fetch_add(1, Ordering::Relaxed);
            return RequestResult {
                code: ResultCode::NotFound,
                fragment: Some(Fragment::empty(header, error_bits::DATA_NOT_FOUND)),
            };
        }

        let front_ts = self.buffer.front_timestamp().unwrap_or(u64::MAX);
        let newest_ts = self.buffer.back_timestamp().unwrap_or(0);
        debug!(
            "data request: trigger ts={} oldest={} newest={} window=[{}, {})",
            request.trigger_timestamp, front_ts, newest_ts, begin, end
        );

        let mut result = if front_ts <= begin && end <= newest_ts {
            self.extract_window(request, header)
        } else if front_ts > begin {
            // Data is gone.
            self.metrics
                .num_requests_old_window
                .fetch_add(1, Ordering::Relaxed);
            self.metrics.num_requests_bad.fetch_add(1, Ordering::Relaxed);
            RequestResult {
                code: ResultCode::NotFound,
                fragment: Some(Fragment::empty(header, error_bits::DATA_NOT_FOUND)),
            }
        } else if newest_ts < end {
            self.metrics
                .num_requests_delayed
                .fetch_add(1, Ordering::Relaxed);
            RequestResult {
                code: ResultCode::NotYet,
                fragment: None,
            }
        } else {
            debug!("request could not be categorised");
            self.metrics
                .num_requests_uncategorized
                .fetch_add(1, Ordering::Relaxed);
            self.metrics.num_requests_bad.fetch_add(1, Ordering::Relaxed);
            RequestResult {
                code: ResultCode::Unknown,
                fragment: Some(Fragment::empty(header, error_bits::DATA_NOT_FOUND)),
            }
        };

        // Once the run stopped a deferred request has no second chance.
        if result.code == ResultCode::NotYet && !self.run_marker.load(Ordering::Acquire) {
            self.metrics.num_requests_bad.fetch_add(1, Ordering::Relaxed);
            result = RequestResult {
                code: ResultCode::NotFound,
                fragment: Some(Fragment::empty(header, error_bits::DATA_NOT_FOUND)),
            };
        }

        result
    }

    /// Gather the window payload: boundary elements are expanded into their
    /// raw frames, fully-interior elements contribute one whole-chunk piece.
    fn extract_window(&self, request: &DataRequest, header: FragmentHeader) -> RequestResult {
        let begin = request.window_begin;
        let end = request.window_end;
        let with_gaps = self.gaps.has_gaps();
        let mut payload = Vec::new();

        let outcome = self.buffer.scan_from(begin, with_gaps, &mut |element: &T| {
            let element_ts = element.first_timestamp();
            if element_ts >= end {
                return false;
            }
            let last_frame_ts = element_ts + (T::FRAMES_PER_CHUNK as u64 - 1) * T::TICK_DISTANCE;
            if element_ts < begin || last_frame_ts >= end {
                for frame in element.frames() {
                    if frame.timestamp >= begin && frame.timestamp < end {
                        payload.extend_from_slice(frame.bytes);
                    }
                }
            } else {
                payload.extend_from_slice(element.as_bytes());
            }
            true
        });

        match outcome {
            ScanStart::NotResolved => {
                // Transient contention with the producer; give it another go.
                self.metrics
                    .num_requests_delayed
                    .fetch_add(1, Ordering::Relaxed);
                RequestResult {
                    code: ResultCode::NotYet,
                    fragment: None,
                }
            }
            ScanStart::Resolved => {
                self.metrics
                    .num_requests_found
                    .fetch_add(1, Ordering::Relaxed);
                RequestResult {
                    code: ResultCode::Found,
                    fragment: Some(Fragment {
                        header,
                        payload,
                    }),
                }
            }
        }
    }

    /// Housekeeper entry: re-evaluate every waiting request once.
    pub fn scan_waiting(&self) {
        let newest_ts = self.buffer.back_timestamp().unwrap_or(u64::MAX);
        let running = self.run_marker.load(Ordering::Acquire);
        let mut reissue = Vec::new();
        let mut emit = Vec::new();

        {
            let mut waiting = self.waiting.lock();
            let mut i = 0;
            while i < waiting.len() {
                if waiting[i].request.window_end < newest_ts {
                    let entry = waiting.swap_remove(i);
                    reissue.push((entry.request, entry.sink));
                } else if waiting[i].retry_count >= self.cfg.retry_limit {
                    let entry = waiting.swap_remove(i);
                    if !self.timeout_warned.swap(true, Ordering::Relaxed) {
                        warn!(
                            "request timed out after {} retries on link {}",
                            self.cfg.retry_limit, self.cfg.link_number
                        );
                    }
                    self.metrics
                        .num_requests_timed_out
                        .fetch_add(1, Ordering::Relaxed);
                    self.metrics.num_requests_bad.fetch_add(1, Ordering::Relaxed);
                    let header = self.make_header(&entry.request);
                    emit.push((Fragment::empty(header, error_bits::DATA_NOT_FOUND), entry.sink));
                } else if !running {
                    let entry = waiting.swap_remove(i);
                    debug!("draining waiting request at end of run");
                    self.metrics.num_requests_bad.fetch_add(1, Ordering::Relaxed);
                    let header = self.make_header(&entry.request);
                    emit.push((Fragment::empty(header, error_bits::END_OF_RUN), entry.sink));
                } else {
                    waiting[i].retry_count += 1;
                    i += 1;
                }
            }
            self.metrics
                .num_requests_waiting
                .store(waiting.len(), Ordering::Relaxed);
        }

        for (fragment, sink) in emit {
            self.push_fragment(fragment, &sink);
        }
        for (request, sink) in reissue {
            self.issue_request(request, sink);
        }
    }

    /// Housekeeper entry: evict the oldest elements once the buffer crosses
    /// its high-water mark, with all request workers held at the barrier.
    pub fn cleanup_check(&self) {
        self.barrier.run_exclusive(
            || self.buffer.needs_eviction(self.pop_limit_size),
            || self.cleanup(),
        );
    }

    fn cleanup(&self) {
        let to_pop = self.buffer.eviction_batch(self.cfg.pop_size_pct);
        let limit = self.rec_shared.eviction_limit();
        let mut popped = 0usize;
        for _ in 0..to_pop {
            match self.buffer.front_timestamp() {
                Some(ts) if ts < limit => {
                    self.buffer.pop(1);
                    popped += 1;
                }
                _ => break,
            }
        }
        self.metrics
            .pops_count
            .fetch_add(popped as u64, Ordering::Relaxed);
        self.metrics
            .num_buffer_cleanups
            .fetch_add(1, Ordering::Relaxed);
        self.metrics
            .occupancy
            .store(self.buffer.occupancy(), Ordering::Relaxed);
        match self.buffer.front_timestamp() {
            Some(front) => self.gaps.remove_until(front),
            None => self.gaps.clear(),
        }
    }

    /// Begin a concurrent recording for `duration`. At most one recording is
    /// active per link; a second call is rejected.
    pub fn record(self: &Arc<Self>, duration: Duration) -> Result<()> {
        if !self.cfg.recording.enable_raw_recording {
            error!("link {} is not configured for recording", self.cfg.link_number);
            return Err(ReadoutError::RecordingNotConfigured);
        }
        if self.rec_shared.recording.swap(true, Ordering::AcqRel) {
            error!("a recording is still running, no new recording was started");
            return Err(ReadoutError::RecordingActive);
        }
        // Reap a finished recording from a previous call.
        if let Some(handle) = self.recording_thread.lock().take() {
            let _ = handle.join();
        }

        let rec = self.cfg.recording.clone();
        let zero_copy = rec.use_o_direct && self.ring_access.is_some();

        // Open failures fail the record call, before any thread starts.
        let mut copy_writer = if zero_copy {
            None
        } else {
            match recorder::writer::BufferedFileWriter::open(
                &rec.output_file,
                rec.stream_buffer_size,
                rec.compression_algorithm,
                rec.use_o_direct,
            ) {
                Ok(writer) => Some(writer),
                Err(e) => {
                    self.rec_shared.recording.store(false, Ordering::Release);
                    return Err(e);
                }
            }
        };

        let handler = Arc::clone(self);
        self.metrics.is_recording.store(true, Ordering::Relaxed);
        let handle = std::thread::Builder::new()
            .name(format!("recorder-{}", self.cfg.link_number))
            .spawn(move || {
                if let Some(writer) = copy_writer.as_mut() {
                    recorder::run_copy_recording::<T, B>(
                        &handler.buffer,
                        &handler.barrier,
                        &handler.rec_shared,
                        writer,
                        duration,
                        &handler.run_marker,
                        &handler.metrics,
                    );
                } else if let Some(ring) = handler.ring_access.as_deref() {
                    if let Err(e) = recorder::run_direct_recording(
                        ring,
                        &handler.barrier,
                        &handler.rec_shared,
                        &rec.output_file,
                        rec.stream_buffer_size,
                        rec.use_o_direct,
                        duration,
                        &handler.run_marker,
                    ) {
                        error!("zero-copy recording failed: {e}");
                    }
                }
                handler
                    .rec_shared
                    .next_timestamp_to_record
                    .store(u64::MAX, Ordering::Release);
                handler.rec_shared.recording.store(false, Ordering::Release);
                handler.metrics.is_recording.store(false, Ordering::Relaxed);
            })
            .expect("spawn recorder thread");
        *self.recording_thread.lock() = Some(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::FrameRing;
    use crate::queues;
    use readout_frames::messages::{FragmentType, SystemType};
    use readout_frames::{TpcChunk, TPC_FRAME_SIZE};
    use std::mem::size_of;

    const CHUNK_SIZE: usize = size_of::<TpcChunk>();

    fn test_config(capacity: usize) -> RequestHandlerConfig {
        RequestHandlerConfig {
            pop_limit_pct: 0.8,
            pop_size_pct: 0.5,
            buffer_capacity: capacity,
            num_threads: 2,
            retry_limit: 3,
            fragment_queue_timeout: Duration::from_millis(100),
            apa_number: 1,
            link_number: 4,
            recording: RecordingConfig::default(),
        }
    }

    fn make_handler(
        capacity: usize,
        prefill: usize,
    ) -> (
        Arc<RequestHandler<TpcChunk, FrameRing<TpcChunk>>>,
        Arc<FrameRing<TpcChunk>>,
    ) {
        let ring = Arc::new(FrameRing::with_safety_margin(capacity, 0));
        for i in 0..prefill {
            assert!(ring.write(TpcChunk::at_timestamp(i as u64 * 300)));
        }
        let handler = Arc::new(RequestHandler::new(
            Arc::clone(&ring),
            Arc::new(GapRegistry::new()),
            Arc::new(LinkMetrics::new()),
            test_config(capacity),
            Some(ring.clone() as Arc<dyn RingAccess>),
        ));
        handler.start();
        (handler, ring)
    }

    fn request(begin: u64, end: u64) -> DataRequest {
        DataRequest {
            trigger_number: 1,
            trigger_timestamp: begin,
            window_begin: begin,
            window_end: end,
            run_number: 1,
            sequence_number: 0,
        }
    }

    fn frame_ts(payload: &[u8], frame_index: usize) -> u64 {
        let offset = frame_index * TPC_FRAME_SIZE + 8;
        u64::from_ne_bytes(payload[offset..offset + 8].try_into().unwrap())
    }

    #[test]
    fn happy_path_request_covers_window() {
        let (handler, _ring) = make_handler(1000, 1000);
        let (tx, rx) = queues::pair(4);
        handler.issue_request(request(1000, 2000), tx);
        let fragment = rx.recv_timeout(Duration::from_secs(5)).expect("fragment");

        assert_eq!(fragment.header.error_bits, 0);
        assert_eq!(fragment.header.window_begin, 1000);
        assert_eq!(fragment.header.fragment_type, FragmentType::TpcData);
        assert_eq!(fragment.header.system_type, SystemType::Tpc);
        assert_eq!(fragment.header.link_id, 4);

        // Head element (ts 900) expands to 8 frames in [1000, 1175], two
        // interior whole chunks (1200, 1500), tail element (1800) expands
        // to 8 frames in [1800, 1975].
        assert_eq!(fragment.payload.len(), 8 * TPC_FRAME_SIZE + 2 * CHUNK_SIZE + 8 * TPC_FRAME_SIZE);
        assert_eq!(frame_ts(&fragment.payload, 0), 1000);
        let frames_total = fragment.payload.len() / TPC_FRAME_SIZE;
        assert_eq!(frame_ts(&fragment.payload, frames_total - 1), 1975);
        handler.stop();
    }

    #[test]
    fn too_old_window_reports_data_not_found() {
        let (handler, ring) = make_handler(1000, 1000);
        ring.pop(2); // front advances past ts=500

        let (tx, rx) = queues::pair(4);
        handler.issue_request(request(100, 200), tx);
        let fragment = rx.recv_timeout(Duration::from_secs(5)).expect("fragment");
        assert_ne!(fragment.header.error_bits & error_bits::DATA_NOT_FOUND, 0);
        assert!(fragment.payload.is_empty());
        assert_eq!(
            handler
                .metrics
                .num_requests_old_window
                .load(Ordering::Relaxed),
            1
        );
        handler.stop();
    }

    #[test]
    fn invalid_window_passes_without_retry() {
        let (handler, _ring) = make_handler(100, 50);
        let (tx, rx) = queues::pair(4);
        handler.issue_request(request(2000, 1000), tx.clone());
        let fragment = rx.recv_timeout(Duration::from_secs(5)).expect("fragment");
        assert_ne!(fragment.header.error_bits & error_bits::INVALID_WINDOW, 0);
        assert!(!handler.has_waiting());

        // A window wider than the handler accepts is passed on as well.
        handler.issue_request(request(0, 40_000_000), tx);
        let fragment = rx.recv_timeout(Duration::from_secs(5)).expect("fragment");
        assert_ne!(fragment.header.error_bits & error_bits::INVALID_WINDOW, 0);
        assert_eq!(
            handler
                .metrics
                .num_requests_invalid_window
                .load(Ordering::Relaxed),
            2
        );
        handler.stop();
    }

    #[test]
    fn future_window_waits_then_finds() {
        let (handler, ring) = make_handler(1000, 17); // newest ts = 4800
        let (tx, rx) = queues::pair(4);
        handler.issue_request(request(6000, 6300), tx);

        // The request must park on the waiting list, not answer.
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        assert!(handler.has_waiting());

        // Consumer advances past the window end; the next scan re-issues.
        for i in 17..25u64 {
            ring.write(TpcChunk::at_timestamp(i * 300));
        }
        handler.scan_waiting();
        let fragment = rx.recv_timeout(Duration::from_secs(5)).expect("fragment");
        assert_eq!(fragment.header.error_bits, 0);
        assert_eq!(fragment.payload.len(), CHUNK_SIZE);
        assert!(!handler.has_waiting());
        handler.stop();
    }

    #[test]
    fn future_window_times_out_after_retries() {
        let (handler, _ring) = make_handler(1000, 17);
        let (tx, rx) = queues::pair(4);
        handler.issue_request(request(6000, 6300), tx);
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

        for _ in 0..=handler.cfg.retry_limit {
            handler.scan_waiting();
        }
        let fragment = rx.recv_timeout(Duration::from_secs(5)).expect("fragment");
        assert_ne!(fragment.header.error_bits & error_bits::DATA_NOT_FOUND, 0);
        assert!(fragment.payload.is_empty());
        assert_eq!(
            handler
                .metrics
                .num_requests_timed_out
                .load(Ordering::Relaxed),
            1
        );
        handler.stop();
    }

    #[test]
    fn stop_drains_waiting_requests_as_end_of_run() {
        let (handler, _ring) = make_handler(1000, 17);
        let (tx, rx) = queues::pair(4);
        handler.issue_request(request(6000, 6300), tx);
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

        handler.begin_stop();
        handler.scan_waiting();
        let fragment = rx.recv_timeout(Duration::from_secs(5)).expect("fragment");
        assert_ne!(fragment.header.error_bits & error_bits::END_OF_RUN, 0);
        assert!(!handler.has_waiting());
        handler.stop();
    }

    #[test]
    fn eviction_respects_recording_cursor() {
        let (handler, ring) = make_handler(1000, 900); // above the 0.8 limit
        handler
            .rec_shared
            .next_timestamp_to_record
            .store(2100, Ordering::Release);

        handler.cleanup_check();

        // Eviction stops at the element the recording cursor points at,
        // even though the batch wanted half the occupancy.
        assert_eq!(ring.front_timestamp(), Some(2100));
        assert_eq!(handler.metrics.pops_count.load(Ordering::Relaxed), 7);
        assert_eq!(ring.occupancy(), 893);
        handler.stop();
    }

    #[test]
    fn recording_copies_buffer_to_disk_and_rejects_a_second_call() {
        use crate::recorder::writer::{BufferedFileReader, CompressionAlgorithm};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recording.bin");

        let ring = Arc::new(FrameRing::with_safety_margin(1000, 0));
        for i in 0..50u64 {
            ring.write(TpcChunk::at_timestamp(i * 300));
        }
        let mut cfg = test_config(1000);
        cfg.recording = RecordingConfig {
            enable_raw_recording: true,
            output_file: path.clone(),
            stream_buffer_size: 4096,
            compression_algorithm: CompressionAlgorithm::None,
            use_o_direct: false,
        };
        let handler = Arc::new(RequestHandler::new(
            Arc::clone(&ring),
            Arc::new(GapRegistry::new()),
            Arc::new(LinkMetrics::new()),
            cfg,
            None,
        ));
        handler.start();

        handler.record(Duration::from_secs(1)).unwrap();
        assert!(matches!(
            handler.record(Duration::from_secs(1)),
            Err(ReadoutError::RecordingActive)
        ));

        // Wait until the recorder has chased the cursor past the buffer.
        let deadline = Instant::now() + Duration::from_secs(10);
        while handler.metrics.payloads_written.load(Ordering::Relaxed) < 50 {
            assert!(Instant::now() < deadline, "recording must drain the buffer");
            std::thread::sleep(Duration::from_millis(10));
        }
        handler.stop();

        let mut reader = BufferedFileReader::open(&path, CompressionAlgorithm::None).unwrap();
        let mut count = 0u64;
        let mut expected_ts = 0u64;
        while let Some(chunk) = reader.read_element::<TpcChunk>().unwrap() {
            assert_eq!(chunk.first_timestamp(), expected_ts);
            expected_ts += 300;
            count += 1;
        }
        assert_eq!(count, 50);
        assert!(
            !handler.rec_shared.recording.load(Ordering::Acquire),
            "recording flag clears once the task ends"
        );
        assert_eq!(
            handler.rec_shared.eviction_limit(),
            u64::MAX,
            "eviction limit releases after recording"
        );
    }

    #[test]
    fn record_fails_when_not_configured() {
        let (handler, _ring) = make_handler(100, 10);
        assert!(matches!(
            handler.record(Duration::from_secs(1)),
            Err(ReadoutError::RecordingNotConfigured)
        ));
        handler.stop();
    }

    #[test]
    fn eviction_pops_fraction_and_purges_stale_gaps() {
        let ring = Arc::new(FrameRing::with_safety_margin(1000, 0));
        for i in 0..900usize {
            ring.write(TpcChunk::at_timestamp(i as u64 * 300));
        }
        let gaps = Arc::new(GapRegistry::new());
        gaps.add(crate::gaps::GapRecord {
            expected_ts: 300,
            observed_ts: 600,
        });
        gaps.add(crate::gaps::GapRecord {
            expected_ts: 200_000,
            observed_ts: 200_100,
        });
        let handler = Arc::new(RequestHandler::new(
            Arc::clone(&ring),
            Arc::clone(&gaps),
            Arc::new(LinkMetrics::new()),
            test_config(1000),
            None,
        ));
        handler.start();

        handler.cleanup_check();
        // Half of 900 popped; the gap at 600 fell off the front.
        assert_eq!(ring.occupancy(), 450);
        assert_eq!(ring.front_timestamp(), Some(450 * 300));
        assert_eq!(gaps.len(), 1);
        handler.stop();
    }
}
