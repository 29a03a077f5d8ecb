//! Per-frame preprocessing, run synchronously on the consumer thread.
//!
//! A processor is an ordered list of stateful tasks. Preprocess tasks may
//! rewrite the chunk (emulator mode); postprocess tasks observe the element
//! after it has been written to the latency buffer. A task never fails past
//! the pipeline: problems are counted and registered, the frame proceeds.

pub mod fir;
pub mod tpg;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error};
use readout_frames::{FrameChunk, TpcChunk};

use crate::gaps::{GapRecord, GapRegistry};
use crate::metrics::LinkMetrics;
use crate::queues::Sink;

/// Timestamp-continuity errors tolerated before declaring the stream broken.
const TS_ERROR_REPORT_LIMIT: u64 = 1000;

pub struct FrameProcessor<T> {
    pre: Vec<Box<dyn FnMut(&mut T) + Send>>,
    post: Vec<Box<dyn FnMut(&T) + Send>>,
}

impl<T: FrameChunk> FrameProcessor<T> {
    pub fn new() -> Self {
        Self {
            pre: Vec::new(),
            post: Vec::new(),
        }
    }

    pub fn add_pre_task(&mut self, task: impl FnMut(&mut T) + Send + 'static) {
        self.pre.push(Box::new(task));
    }

    pub fn add_post_task(&mut self, task: impl FnMut(&T) + Send + 'static) {
        self.post.push(Box::new(task));
    }

    pub fn preprocess(&mut self, chunk: &mut T) {
        for task in self.pre.iter_mut() {
            task(chunk);
        }
    }

    pub fn postprocess(&mut self, chunk: &T) {
        for task in self.post.iter_mut() {
            task(chunk);
        }
    }
}

impl<T: FrameChunk> Default for FrameProcessor<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Pipeline stage 1: validate timestamp continuity.
///
/// The first chunk of a run primes the expected timestamp; after that every
/// deviation from one element span is pushed into the gap registry. In
/// emulator mode the chunk timestamps are rewritten to a perfectly
/// incrementing sequence before the check.
pub struct TimestampChecker<T> {
    previous_ts: u64,
    primed: bool,
    emulator_mode: bool,
    first_mismatch_logged: bool,
    problem_reported: bool,
    gaps: Arc<GapRegistry>,
    metrics: Arc<LinkMetrics>,
    last_daq_time: Arc<AtomicU64>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: FrameChunk> TimestampChecker<T> {
    pub fn new(
        emulator_mode: bool,
        gaps: Arc<GapRegistry>,
        metrics: Arc<LinkMetrics>,
        last_daq_time: Arc<AtomicU64>,
    ) -> Self {
        Self {
            previous_ts: 0,
            primed: false,
            emulator_mode,
            first_mismatch_logged: false,
            problem_reported: false,
            gaps,
            metrics,
            last_daq_time,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn check(&mut self, chunk: &mut T) {
        let span = T::element_span();
        if self.emulator_mode && self.primed && span != 0 {
            chunk.rewrite_timestamps(self.previous_ts + span);
        }

        let current_ts = chunk.first_timestamp();
        if self.primed && span != 0 && current_ts.wrapping_sub(self.previous_ts) != span {
            let expected = self.previous_ts + span;
            self.gaps.add(GapRecord {
                expected_ts: expected,
                observed_ts: current_ts,
            });
            let errors = self.metrics.ts_error_count.fetch_add(1, Ordering::Relaxed) + 1;
            if !self.first_mismatch_logged {
                debug!(
                    "first timestamp mismatch: previous={} current={}",
                    self.previous_ts, current_ts
                );
                self.first_mismatch_logged = true;
            }
            if errors > TS_ERROR_REPORT_LIMIT && !self.problem_reported {
                error!(
                    "timestamp continuity is completely broken ({errors} errors); \
                     check the front-end source or the configuration"
                );
                self.problem_reported = true;
            }
        }

        self.previous_ts = current_ts;
        self.primed = true;
        self.last_daq_time.store(current_ts, Ordering::Release);
    }
}

/// Pipeline stage 2: count frames whose header carries error flags.
fn tpc_error_flag_check(metrics: &LinkMetrics, chunk: &TpcChunk) {
    for frame in chunk.frames.iter() {
        if frame.header.error_flags != 0 {
            metrics.frame_error_count.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Parameters for assembling a link's pipeline at start.
pub struct PipelineParams {
    pub emulator_mode: bool,
    pub gaps: Arc<GapRegistry>,
    pub metrics: Arc<LinkMetrics>,
    pub last_daq_time: Arc<AtomicU64>,
}

/// Standard pipeline for the fixed-rate TPC link: timestamp check, frame
/// error-flag check and, when requested, the software trigger-primitive
/// finder on the just-written element.
pub fn tpc_pipeline(
    params: &PipelineParams,
    tp_sink: Option<Sink<readout_frames::messages::TriggerPrimitive>>,
    enable_tpg: bool,
) -> FrameProcessor<TpcChunk> {
    let mut processor = FrameProcessor::new();

    let mut checker = TimestampChecker::new(
        params.emulator_mode,
        Arc::clone(&params.gaps),
        Arc::clone(&params.metrics),
        Arc::clone(&params.last_daq_time),
    );
    processor.add_pre_task(move |chunk: &mut TpcChunk| checker.check(chunk));

    let metrics = Arc::clone(&params.metrics);
    processor.add_pre_task(move |chunk: &mut TpcChunk| tpc_error_flag_check(&metrics, chunk));

    if enable_tpg {
        let metrics = Arc::clone(&params.metrics);
        let mut finder = tpg::TpFinder::new(tpg::DEFAULT_THRESHOLD_SIGMAS);
        processor.add_post_task(move |chunk: &TpcChunk| {
            let nhits = finder.process_chunk(chunk);
            if nhits > 0 {
                metrics
                    .num_hits_found
                    .fetch_add(nhits as u64, Ordering::Relaxed);
                if let Some(sink) = &tp_sink {
                    for hit in finder.hits() {
                        // A full TP sink only loses primitives, never data.
                        let _ = sink.try_send(hit);
                    }
                }
            }
        });
    }

    processor
}

/// Pipeline for variable-rate links: the timestamp task only publishes the
/// DAQ time (no fixed span to check against).
pub fn pd_pipeline<T: FrameChunk>(params: &PipelineParams) -> FrameProcessor<T> {
    let mut processor = FrameProcessor::new();
    let mut checker = TimestampChecker::new(
        params.emulator_mode,
        Arc::clone(&params.gaps),
        Arc::clone(&params.metrics),
        Arc::clone(&params.last_daq_time),
    );
    processor.add_pre_task(move |chunk: &mut T| checker.check(chunk));
    processor
}
