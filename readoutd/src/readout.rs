//! Glue between the raw-input queue, the preprocessing pipeline, the latency
//! buffer and the request handler: one `ReadoutLink` per front-end link.
//!
//! Four long-lived named threads per link while a run is active: the
//! consumer (input queue, pipeline, buffer write side), the requester
//! (request queues into the worker pool), the housekeeper (waiting-list
//! scan, eviction check, time-sync heartbeat) and a stats logger.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use readout_frames::messages::{DataRequest, Fragment, TimeSync};
use readout_frames::FrameChunk;

use crate::buffer::ring::RingAccess;
use crate::buffer::{FrameRing, LatencyBuffer, OrderedBuffer};
use crate::config::Config;
use crate::error::{ReadoutError, Result};
use crate::gaps::GapRegistry;
use crate::metrics::{LinkInfo, LinkMetrics};
use crate::processor::{self, FrameProcessor, PipelineParams};
use crate::queues::{self, Sink, Source};
use crate::request::{RequestHandler, RequestHandlerConfig};

const WAITING_SCAN_INTERVAL: Duration = Duration::from_millis(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);
const STATS_INTERVAL_TICKS: u32 = 100; // x 100 ms = 10 s

/// Queue endpoints wiring one link into the wider DAQ application.
pub struct LinkQueues<T> {
    pub raw_input: Source<T>,
    /// Paired request/response queues; at least one pair is required.
    pub data_requests: Vec<Source<DataRequest>>,
    pub fragment_responses: Vec<Sink<Fragment>>,
    pub timesync: Sink<TimeSync>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum LinkState {
    Uninit,
    Initialized,
    Configured,
    Running,
}

impl LinkState {
    fn name(self) -> &'static str {
        match self {
            LinkState::Uninit => "uninit",
            LinkState::Initialized => "initialized",
            LinkState::Configured => "configured",
            LinkState::Running => "running",
        }
    }
}

type BufferBuilder<B> = Box<dyn Fn(&Config) -> (Arc<B>, Option<Arc<dyn RingAccess>>) + Send + Sync>;
type PipelineBuilder<T> = Box<dyn Fn(&PipelineParams) -> FrameProcessor<T> + Send + Sync>;

pub struct ReadoutLink<T: FrameChunk, B: LatencyBuffer<T>> {
    state: LinkState,
    run_marker: Arc<AtomicBool>,

    queues: Option<LinkQueues<T>>,
    config: Config,

    gaps: Arc<GapRegistry>,
    metrics: Arc<LinkMetrics>,
    last_daq_time: Arc<AtomicU64>,

    buffer: Option<Arc<B>>,
    handler: Option<Arc<RequestHandler<T, B>>>,

    buffer_builder: BufferBuilder<B>,
    pipeline_builder: PipelineBuilder<T>,

    threads: Vec<JoinHandle<()>>,
}

impl ReadoutLink<readout_frames::TpcChunk, FrameRing<readout_frames::TpcChunk>> {
    /// Fixed-rate TPC link on the SPSC ring, with the optional software
    /// trigger-primitive stage.
    pub fn tpc(
        enable_tpg: bool,
        tp_sink: Option<Sink<readout_frames::messages::TriggerPrimitive>>,
    ) -> Self {
        Self::with_builders(
            Box::new(|config: &Config| {
                let ring = Arc::new(FrameRing::new(config.link.latency_buffer_size));
                let access = Some(Arc::clone(&ring) as Arc<dyn RingAccess>);
                (ring, access)
            }),
            Box::new(move |params| processor::tpc_pipeline(params, tp_sink.clone(), enable_tpg)),
        )
    }
}

impl ReadoutLink<readout_frames::PdChunk, OrderedBuffer<readout_frames::PdChunk>> {
    /// Variable-rate photon-detector link on the ordered buffer. For this
    /// link flavour `latency_buffer_size` is the buffered timestamp span in
    /// ticks.
    pub fn pd() -> Self {
        Self::with_builders(
            Box::new(|config: &Config| {
                let buffer = Arc::new(OrderedBuffer::new(config.link.latency_buffer_size as u64));
                (buffer, None)
            }),
            Box::new(|params| processor::pd_pipeline(params)),
        )
    }
}

impl<T: FrameChunk, B: LatencyBuffer<T>> ReadoutLink<T, B> {
    pub fn with_builders(buffer_builder: BufferBuilder<B>, pipeline_builder: PipelineBuilder<T>) -> Self {
        Self {
            state: LinkState::Uninit,
            run_marker: Arc::new(AtomicBool::new(false)),
            queues: None,
            config: Config::default(),
            gaps: Arc::new(GapRegistry::new()),
            metrics: Arc::new(LinkMetrics::new()),
            last_daq_time: Arc::new(AtomicU64::new(0)),
            buffer: None,
            handler: None,
            buffer_builder,
            pipeline_builder,
            threads: Vec::new(),
        }
    }

    pub fn metrics(&self) -> &Arc<LinkMetrics> {
        &self.metrics
    }

    pub fn run_marker(&self) -> &Arc<AtomicBool> {
        &self.run_marker
    }

    fn expect_state(&self, command: &'static str, expected: &[LinkState]) -> Result<()> {
        if expected.contains(&self.state) {
            Ok(())
        } else {
            Err(ReadoutError::InvalidState {
                command,
                state: self.state.name(),
            })
        }
    }

    /// Attach the queue endpoints. Fails when the request/response pairs do
    /// not line up.
    pub fn init(&mut self, queues: LinkQueues<T>) -> Result<()> {
        self.expect_state("init", &[LinkState::Uninit])?;
        if queues.data_requests.is_empty() {
            return Err(ReadoutError::ResourceQueue(
                "need at least one data request queue".into(),
            ));
        }
        if queues.data_requests.len() != queues.fragment_responses.len() {
            return Err(ReadoutError::ResourceQueue(format!(
                "{} request queues but {} fragment queues",
                queues.data_requests.len(),
                queues.fragment_responses.len()
            )));
        }
        self.queues = Some(queues);
        self.state = LinkState::Initialized;
        Ok(())
    }

    /// Validate the configuration and size the latency buffer.
    pub fn conf(&mut self, config: Config) -> Result<()> {
        self.expect_state("conf", &[LinkState::Initialized, LinkState::Configured])?;
        config.validate()?;

        let (buffer, ring_access) = (self.buffer_builder)(&config);
        let handler = RequestHandler::new(
            Arc::clone(&buffer),
            Arc::clone(&self.gaps),
            Arc::clone(&self.metrics),
            RequestHandlerConfig::from_config(&config),
            ring_access,
        );
        self.buffer = Some(buffer);
        self.handler = Some(Arc::new(handler));
        self.config = config;
        self.state = LinkState::Configured;
        debug!("link {} configured", self.config.link.link_number);
        Ok(())
    }

    /// Spawn the worker pool and the four link threads.
    pub fn start(&mut self) -> Result<()> {
        self.expect_state("start", &[LinkState::Configured])?;
        let queues = self.queues.as_ref().expect("queues set at init");
        let buffer = Arc::clone(self.buffer.as_ref().expect("buffer built at conf"));
        let handler = Arc::clone(self.handler.as_ref().expect("handler built at conf"));
        let link = self.config.link.link_number;

        self.metrics.reset_run_counters();
        self.gaps.clear();
        self.run_marker.store(true, Ordering::Release);
        handler.start();

        let processor = (self.pipeline_builder)(&PipelineParams {
            emulator_mode: self.config.link.emulator_mode,
            gaps: Arc::clone(&self.gaps),
            metrics: Arc::clone(&self.metrics),
            last_daq_time: Arc::clone(&self.last_daq_time),
        });

        self.threads.push(self.spawn_consumer(
            format!("consumer-{link}"),
            queues.raw_input.clone(),
            Arc::clone(&buffer),
            processor,
        ));
        self.threads.push(self.spawn_requester(
            format!("requests-{link}"),
            queues.data_requests.clone(),
            queues.fragment_responses.clone(),
            Arc::clone(&handler),
        ));
        self.threads.push(self.spawn_housekeeper(
            format!("housekeep-{link}"),
            Arc::clone(&buffer),
            Arc::clone(&handler),
            queues.timesync.clone(),
            queues.fragment_responses[0].clone(),
        ));
        self.threads
            .push(self.spawn_stats(format!("stats-{link}")));

        self.state = LinkState::Running;
        info!("link {link} started");
        Ok(())
    }

    /// Stop the run: drain the input queue, resolve or expire every waiting
    /// request, flush the buffer, reset the preprocessor counters.
    /// Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        if self.state != LinkState::Running {
            return Ok(());
        }
        info!("link {} stopping", self.config.link.link_number);
        self.run_marker.store(false, Ordering::Release);
        let handler = Arc::clone(self.handler.as_ref().expect("running"));
        handler.begin_stop();

        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        handler.stop();

        if let Some(buffer) = &self.buffer {
            debug!("flushing latency buffer with occupancy {}", buffer.occupancy());
            buffer.clear();
        }
        self.metrics.occupancy.store(0, Ordering::Relaxed);
        self.gaps.clear();
        self.last_daq_time.store(0, Ordering::Release);
        self.metrics.ts_error_count.store(0, Ordering::Relaxed);
        self.metrics.frame_error_count.store(0, Ordering::Relaxed);
        self.state = LinkState::Configured;
        Ok(())
    }

    /// Begin a concurrent recording. Allowed only while running.
    pub fn record(&self, duration: Duration) -> Result<()> {
        self.expect_state("record", &[LinkState::Running])?;
        self.handler.as_ref().expect("running").record(duration)
    }

    /// Release the buffer and handler; back to the post-init state.
    pub fn scrap(&mut self) -> Result<()> {
        self.expect_state("scrap", &[LinkState::Configured])?;
        self.handler = None;
        self.buffer = None;
        self.state = LinkState::Initialized;
        Ok(())
    }

    pub fn get_info(&self) -> LinkInfo {
        self.metrics.snapshot()
    }

    fn spawn_consumer(
        &self,
        name: String,
        raw_input: Source<T>,
        buffer: Arc<B>,
        mut processor: FrameProcessor<T>,
    ) -> JoinHandle<()> {
        let run_marker = Arc::clone(&self.run_marker);
        let metrics = Arc::clone(&self.metrics);
        let timeout = Duration::from_millis(self.config.link.source_queue_timeout_ms);
        std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                debug!("consumer thread started");
                while run_marker.load(Ordering::Acquire) || !raw_input.is_empty() {
                    match queues::pop_timeout(&raw_input, timeout) {
                        Ok(Some(mut chunk)) => {
                            processor.preprocess(&mut chunk);
                            if buffer.write(chunk) {
                                buffer.with_back(&mut |element| processor.postprocess(element));
                            } else {
                                metrics
                                    .overwritten_packet_count
                                    .fetch_add(1, Ordering::Relaxed);
                            }
                            metrics.record_packet();
                            metrics.stats_packet_count.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(None) => {
                            metrics.rawq_timeout_count.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => break,
                    }
                }
                debug!("consumer thread joins");
            })
            .expect("spawn consumer thread")
    }

    fn spawn_requester(
        &self,
        name: String,
        request_queues: Vec<Source<DataRequest>>,
        fragment_queues: Vec<Sink<Fragment>>,
        handler: Arc<RequestHandler<T, B>>,
    ) -> JoinHandle<()> {
        let run_marker = Arc::clone(&self.run_marker);
        let metrics = Arc::clone(&self.metrics);
        let timeout = Duration::from_millis(self.config.link.source_queue_timeout_ms);
        std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                debug!("requester thread started");
                while run_marker.load(Ordering::Acquire) {
                    for (request_queue, fragment_queue) in
                        request_queues.iter().zip(fragment_queues.iter())
                    {
                        match queues::pop_timeout(request_queue, timeout) {
                            Ok(Some(request)) => {
                                debug!(
                                    "received data request for trigger {} run {}",
                                    request.trigger_number, request.run_number
                                );
                                handler.issue_request(request, fragment_queue.clone());
                                metrics.record_request();
                            }
                            Ok(None) => {}
                            Err(_) => {}
                        }
                    }
                }
                // Left-over requests are dropped at end of run.
                for request_queue in &request_queues {
                    while request_queue.try_recv().is_ok() {}
                }
                debug!("requester thread joins");
            })
            .expect("spawn requester thread")
    }

    fn spawn_housekeeper(
        &self,
        name: String,
        buffer: Arc<B>,
        handler: Arc<RequestHandler<T, B>>,
        timesync: Sink<TimeSync>,
        self_trigger_sink: Sink<Fragment>,
    ) -> JoinHandle<()> {
        let run_marker = Arc::clone(&self.run_marker);
        let metrics = Arc::clone(&self.metrics);
        let last_daq_time = Arc::clone(&self.last_daq_time);
        let fake_trigger = self.config.link.fake_trigger_flag;
        let timeout = Duration::from_millis(self.config.link.source_queue_timeout_ms);
        std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                debug!("housekeeper thread started");
                let mut last_heartbeat = Instant::now();
                let mut invalid_sync_logged = false;
                let mut sync_push_warned = false;
                let mut trigger_number = 0u64;

                while run_marker.load(Ordering::Acquire) || handler.has_waiting() {
                    handler.scan_waiting();
                    handler.cleanup_check();
                    metrics.occupancy.store(buffer.occupancy(), Ordering::Relaxed);

                    if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL
                        && run_marker.load(Ordering::Acquire)
                    {
                        last_heartbeat = Instant::now();
                        let daq_time = last_daq_time.load(Ordering::Acquire);
                        if daq_time != 0 {
                            let message = TimeSync::new(daq_time);
                            if queues::push_timeout(&timesync, message, timeout).is_err() {
                                if !sync_push_warned {
                                    warn!("cannot write to timesync queue");
                                    sync_push_warned = true;
                                }
                                metrics
                                    .timesync_sink_timeouts
                                    .fetch_add(1, Ordering::Relaxed);
                            }
                            if fake_trigger {
                                let trigger_timestamp = daq_time.saturating_sub(500_000);
                                let window_begin = trigger_timestamp.saturating_sub(100);
                                let request = DataRequest {
                                    trigger_number,
                                    trigger_timestamp,
                                    window_begin,
                                    window_end: window_begin + 10_000,
                                    run_number: 1,
                                    sequence_number: 0,
                                };
                                trigger_number += 1;
                                debug!(
                                    "issuing fake trigger from timesync: window=[{}, {})",
                                    request.window_begin, request.window_end
                                );
                                handler.issue_request(request, self_trigger_sink.clone());
                                metrics.record_request();
                            }
                        } else if !invalid_sync_logged {
                            info!("timesync with DAQ time 0 is invalid and will not be sent");
                            invalid_sync_logged = true;
                        }
                    }

                    std::thread::sleep(WAITING_SCAN_INTERVAL);
                }
                debug!("housekeeper thread joins");
            })
            .expect("spawn housekeeper thread")
    }

    fn spawn_stats(&self, name: String) -> JoinHandle<()> {
        let run_marker = Arc::clone(&self.run_marker);
        let metrics = Arc::clone(&self.metrics);
        std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                debug!("statistics thread started");
                let mut t0 = Instant::now();
                while run_marker.load(Ordering::Acquire) {
                    for _ in 0..STATS_INTERVAL_TICKS {
                        if !run_marker.load(Ordering::Acquire) {
                            break;
                        }
                        std::thread::sleep(HEARTBEAT_INTERVAL);
                    }
                    let new_packets = metrics.stats_packet_count.swap(0, Ordering::Relaxed);
                    let seconds = t0.elapsed().as_secs_f64();
                    if seconds > 0.0 {
                        debug!(
                            "consumed packet rate: {:.3} kHz",
                            new_packets as f64 / seconds / 1000.0
                        );
                    }
                    let timeouts = metrics.rawq_timeout_count.load(Ordering::Relaxed);
                    if timeouts > 0 {
                        debug!("raw input queue timed out {timeouts} times so far");
                    }
                    t0 = Instant::now();
                }
                debug!("statistics thread joins");
            })
            .expect("spawn stats thread")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use readout_frames::TpcChunk;

    fn small_config() -> Config {
        let mut config = Config::default();
        config.link.latency_buffer_size = 1000;
        config.link.num_request_handling_threads = 2;
        config.link.retry_count = 50;
        config.link.source_queue_timeout_ms = 10;
        config.link.link_number = 3;
        config
    }

    struct Harness {
        link: ReadoutLink<TpcChunk, FrameRing<TpcChunk>>,
        raw_tx: Sink<TpcChunk>,
        request_tx: Sink<DataRequest>,
        fragment_rx: Source<Fragment>,
        timesync_rx: Source<TimeSync>,
    }

    fn harness(config: Config) -> Harness {
        let (raw_tx, raw_rx) = queues::pair(4096);
        let (request_tx, request_rx) = queues::pair(64);
        let (fragment_tx, fragment_rx) = queues::pair(64);
        let (timesync_tx, timesync_rx) = queues::pair(256);
        let mut link = ReadoutLink::tpc(false, None);
        link.init(LinkQueues {
            raw_input: raw_rx,
            data_requests: vec![request_rx],
            fragment_responses: vec![fragment_tx],
            timesync: timesync_tx,
        })
        .unwrap();
        link.conf(config).unwrap();
        Harness {
            link,
            raw_tx,
            request_tx,
            fragment_rx,
            timesync_rx,
        }
    }

    #[test]
    fn lifecycle_contract_is_enforced() {
        let mut link = ReadoutLink::tpc(false, None);
        assert!(matches!(
            link.conf(Config::default()),
            Err(ReadoutError::InvalidState { .. })
        ));
        assert!(matches!(
            link.start(),
            Err(ReadoutError::InvalidState { .. })
        ));
        assert!(link.record(Duration::from_secs(1)).is_err());

        let (_raw_tx, raw_rx) = queues::pair::<TpcChunk>(16);
        let (_request_tx, request_rx) = queues::pair(16);
        let (fragment_tx, _fragment_rx) = queues::pair(16);
        let (timesync_tx, _timesync_rx) = queues::pair(16);
        link.init(LinkQueues {
            raw_input: raw_rx,
            data_requests: vec![request_rx],
            fragment_responses: vec![fragment_tx],
            timesync: timesync_tx,
        })
        .unwrap();
        assert!(matches!(
            link.start(),
            Err(ReadoutError::InvalidState { .. })
        ));
        link.conf(small_config()).unwrap();
        link.start().unwrap();
        link.stop().unwrap();
        link.stop().unwrap(); // idempotent
        link.scrap().unwrap();
        assert!(matches!(
            link.scrap(),
            Err(ReadoutError::InvalidState { .. })
        ));
    }

    #[test]
    fn init_requires_matching_queue_pairs() {
        let mut link = ReadoutLink::tpc(false, None);
        let (_raw_tx, raw_rx) = queues::pair::<TpcChunk>(16);
        let (timesync_tx, _timesync_rx) = queues::pair(16);
        let result = link.init(LinkQueues {
            raw_input: raw_rx,
            data_requests: vec![],
            fragment_responses: vec![],
            timesync: timesync_tx,
        });
        assert!(matches!(result, Err(ReadoutError::ResourceQueue(_))));
    }

    #[test]
    fn end_to_end_request_round_trip() {
        let mut h = harness(small_config());
        h.link.start().unwrap();

        for i in 0..100u64 {
            h.raw_tx.send(TpcChunk::at_timestamp(i * 300)).unwrap();
        }
        h.request_tx
            .send(DataRequest {
                trigger_number: 9,
                trigger_timestamp: 1500,
                window_begin: 1200,
                window_end: 1800,
                run_number: 2,
                sequence_number: 0,
            })
            .unwrap();

        let fragment = h
            .fragment_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("fragment");
        assert_eq!(fragment.header.trigger_number, 9);
        assert_eq!(fragment.header.error_bits, 0);
        assert_eq!(
            fragment.payload.len(),
            2 * std::mem::size_of::<TpcChunk>(),
            "two whole elements cover [1200, 1800)"
        );

        // The heartbeat carries the newest processed DAQ time.
        let sync = h
            .timesync_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("timesync");
        assert!(sync.daq_time > 0);

        h.link.stop().unwrap();
        assert_eq!(h.link.metrics().occupancy.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn waiting_request_drains_as_end_of_run_on_stop() {
        let mut h = harness(small_config());
        h.link.start().unwrap();

        for i in 0..10u64 {
            h.raw_tx.send(TpcChunk::at_timestamp(i * 300)).unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(10);
        while h.link.metrics().packets_total.load(Ordering::Relaxed) < 10 {
            assert!(Instant::now() < deadline, "consumer must ingest the chunks");
            std::thread::sleep(Duration::from_millis(10));
        }
        // A window far in the future parks on the waiting list.
        h.request_tx
            .send(DataRequest {
                trigger_number: 1,
                trigger_timestamp: 0,
                window_begin: 1_000_000,
                window_end: 1_000_300,
                run_number: 1,
                sequence_number: 0,
            })
            .unwrap();
        // Give the requester a chance to pick it up.
        std::thread::sleep(Duration::from_millis(300));

        h.link.stop().unwrap();
        let fragment = h
            .fragment_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("drained fragment");
        assert_ne!(
            fragment.header.error_bits & readout_frames::messages::error_bits::END_OF_RUN,
            0
        );
    }

    #[test]
    fn pd_link_serves_an_out_of_order_stream() {
        use readout_frames::PdChunk;

        let (raw_tx, raw_rx) = queues::pair(256);
        let (request_tx, request_rx) = queues::pair(16);
        let (fragment_tx, fragment_rx) = queues::pair(16);
        let (timesync_tx, _timesync_rx) = queues::pair(256);

        let mut link = ReadoutLink::pd();
        link.init(LinkQueues {
            raw_input: raw_rx,
            data_requests: vec![request_rx],
            fragment_responses: vec![fragment_tx],
            timesync: timesync_tx,
        })
        .unwrap();
        let mut config = small_config();
        config.link.latency_buffer_size = 1_000_000; // span in ticks
        link.conf(config).unwrap();
        link.start().unwrap();

        for ts in [500u64, 200, 800, 1400, 1100] {
            raw_tx.send(PdChunk::at_timestamp(ts)).unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(10);
        while link.metrics().packets_total.load(Ordering::Relaxed) < 5 {
            assert!(Instant::now() < deadline, "consumer must ingest the chunks");
            std::thread::sleep(Duration::from_millis(10));
        }

        request_tx
            .send(DataRequest {
                trigger_number: 2,
                trigger_timestamp: 600,
                window_begin: 200,
                window_end: 1101,
                run_number: 1,
                sequence_number: 0,
            })
            .unwrap();
        let fragment = fragment_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("fragment");
        assert_eq!(fragment.header.error_bits, 0);
        assert_eq!(
            fragment.payload.len(),
            4 * std::mem::size_of::<PdChunk>(),
            "waveforms at 200, 500, 800 and 1100 overlap the window"
        );
        link.stop().unwrap();
    }

    #[test]
    fn stop_flushes_buffer_and_resets_counters() {
        let mut h = harness(small_config());
        h.link.start().unwrap();
        // A gap to populate the error counter: 0, 300, then 900.
        for ts in [0u64, 300, 900] {
            h.raw_tx.send(TpcChunk::at_timestamp(ts)).unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(10);
        while h.link.metrics().packets_total.load(Ordering::Relaxed) < 3 {
            assert!(Instant::now() < deadline, "consumer must drain the input");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(h.link.metrics().ts_error_count.load(Ordering::Relaxed), 1);

        h.link.stop().unwrap();
        assert_eq!(h.link.metrics().ts_error_count.load(Ordering::Relaxed), 0);
    }
}
