//! Built-in source emulator: synthetic fixed-rate super-chunks for running
//! a link without front-end hardware. A configurable dropout probability
//! skips chunks, producing the real timestamp gaps the preprocessor and the
//! binary-search lookup path are built for.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, info};
use rand::Rng;
use readout_frames::{FrameChunk, TpcChunk};

use crate::config::EmulatorConfig;
use crate::queues::{self, PushError, Sink};

/// Paces a producer loop to a configured kHz rate.
pub struct RateLimiter {
    period: Duration,
    next: Instant,
}

impl RateLimiter {
    pub fn new(rate_khz: f64) -> Self {
        let period = Duration::from_secs_f64(1.0 / (rate_khz * 1000.0));
        Self {
            period,
            next: Instant::now(),
        }
    }

    /// Block until the next slot. Falls through immediately when the
    /// producer is behind schedule.
    pub fn limit(&mut self) {
        let now = Instant::now();
        if now < self.next {
            std::thread::sleep(self.next - now);
        }
        self.next += self.period;
        // After a stall, restart the schedule instead of bursting.
        if self.next < Instant::now() {
            self.next = Instant::now() + self.period;
        }
    }
}

/// Counters published by the emulator thread.
#[derive(Default)]
pub struct EmulatorStats {
    pub packets: AtomicU64,
    pub dropouts: AtomicU64,
    pub queue_timeouts: AtomicU64,
}

/// Spawn the fake TPC producer. Runs until the run marker clears.
pub fn start_tpc_emulator(
    sink: Sink<TpcChunk>,
    run_marker: Arc<AtomicBool>,
    config: EmulatorConfig,
    link_number: u32,
) -> (Arc<EmulatorStats>, JoinHandle<()>) {
    let stats = Arc::new(EmulatorStats::default());
    let thread_stats = Arc::clone(&stats);
    let handle = std::thread::Builder::new()
        .name(format!("fakeprod-{link_number}"))
        .spawn(move || {
            info!(
                "source emulator started at {} kHz, dropout rate {}",
                config.rate_khz, config.dropout_rate
            );
            let mut rng = rand::thread_rng();
            let mut limiter = RateLimiter::new(config.rate_khz);
            let span = TpcChunk::element_span();
            let mut ts = span; // DAQ time 0 is an invalid sync
            while run_marker.load(Ordering::Acquire) {
                if config.dropout_rate > 0.0 && rng.gen::<f64>() < config.dropout_rate {
                    thread_stats.dropouts.fetch_add(1, Ordering::Relaxed);
                } else {
                    let chunk = TpcChunk::at_timestamp(ts);
                    match queues::push_timeout(&sink, chunk, Duration::from_millis(100)) {
                        Ok(()) => {
                            thread_stats.packets.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(PushError::Full(_)) => {
                            thread_stats.queue_timeouts.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(PushError::Disconnected(_)) => break,
                    }
                }
                ts += span;
                limiter.limit();
            }
            debug!(
                "source emulator joins after {} packets",
                thread_stats.packets.load(Ordering::Relaxed)
            );
        })
        .expect("spawn emulator thread");
    (stats, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emulator_produces_incrementing_chunks() {
        let (tx, rx) = queues::pair(1024);
        let run_marker = Arc::new(AtomicBool::new(true));
        let config = EmulatorConfig {
            rate_khz: 100.0,
            dropout_rate: 0.0,
        };
        let (stats, handle) = start_tpc_emulator(tx, Arc::clone(&run_marker), config, 0);

        let first = rx.recv_timeout(Duration::from_secs(5)).expect("chunk");
        let second = rx.recv_timeout(Duration::from_secs(5)).expect("chunk");
        run_marker.store(false, Ordering::Release);
        handle.join().unwrap();

        assert_eq!(first.first_timestamp(), 300);
        assert_eq!(
            second.first_timestamp() - first.first_timestamp(),
            TpcChunk::element_span()
        );
        assert!(stats.packets.load(Ordering::Relaxed) >= 2);
    }

    #[test]
    fn full_dropout_produces_gaps_only() {
        let (tx, rx) = queues::pair(64);
        let run_marker = Arc::new(AtomicBool::new(true));
        let config = EmulatorConfig {
            rate_khz: 100.0,
            dropout_rate: 1.0,
        };
        let (stats, handle) = start_tpc_emulator(tx, Arc::clone(&run_marker), config, 0);
        std::thread::sleep(Duration::from_millis(100));
        run_marker.store(false, Ordering::Release);
        handle.join().unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(stats.packets.load(Ordering::Relaxed), 0);
        assert!(stats.dropouts.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn rate_limiter_paces_roughly() {
        let mut limiter = RateLimiter::new(1.0); // 1 kHz -> 1 ms period
        let t0 = Instant::now();
        for _ in 0..20 {
            limiter.limit();
        }
        let elapsed = t0.elapsed();
        assert!(elapsed >= Duration::from_millis(10), "elapsed {elapsed:?}");
    }
}
