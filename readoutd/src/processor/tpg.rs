//! Software trigger-primitive finder over the TPC collection view.
//!
//! Scalar rendition of the SIMD kernel, blocked the same way: the 128
//! channels of a link are walked as 8 registers of 16 samples, with all
//! per-channel state held in flat register-width-aligned arrays. Per sample:
//! frugal-accumulator pedestal and quantile tracking, an 8-tap integer FIR,
//! and threshold crossing detection; a falling edge emits one hit record
//! into the output buffer, which is terminated by a sentinel.

use readout_frames::messages::TriggerPrimitive;
use readout_frames::{TpcChunk, TPC_CHANNELS, TPC_FRAMES_PER_CHUNK};

pub const SAMPLES_PER_REGISTER: usize = 16;
pub const REGISTERS_PER_FRAME: usize = TPC_CHANNELS / SAMPLES_PER_REGISTER;
pub const NTAPS: usize = 8;
/// End-of-hits marker written four times after the last record.
pub const HIT_SENTINEL: u16 = u16::MAX;
/// Saturation width of the frugal accumulators.
pub const FRUGAL_LIMIT: i16 = 10;
pub const DEFAULT_THRESHOLD_SIGMAS: i32 = 5;
/// FIR tap scaling exponent; taps are integers times 2^6.
pub const TAP_EXPONENT: u8 = 6;

const HIT_WORDS: usize = 4;
const OUTPUT_CAPACITY: usize = 4096;

/// Adjust a tracked value by one whenever its signed accumulator saturates.
#[inline]
pub fn frugal_accum_update(m: &mut i16, sample: i16, accum: &mut i16, limit: i16) {
    if sample > *m {
        *accum += 1;
    }
    if sample < *m {
        *accum -= 1;
    }
    if *accum > limit {
        *m += 1;
        *accum = 0;
    }
    if *accum < -limit {
        *m -= 1;
        *accum = 0;
    }
}

/// Per-channel filter and hit state, one lane per channel, register-aligned.
#[repr(C, align(32))]
pub struct ChannelState {
    pedestals: [i16; TPC_CHANNELS],
    quantile25: [i16; TPC_CHANNELS],
    quantile75: [i16; TPC_CHANNELS],
    accum: [i16; TPC_CHANNELS],
    accum25: [i16; TPC_CHANNELS],
    accum75: [i16; TPC_CHANNELS],
    prev_samp: [i16; TPC_CHANNELS * NTAPS],
    prev_was_over: [bool; TPC_CHANNELS],
    hit_charge: [i16; TPC_CHANNELS],
    hit_tover: [i16; TPC_CHANNELS],
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            pedestals: [0; TPC_CHANNELS],
            quantile25: [0; TPC_CHANNELS],
            quantile75: [0; TPC_CHANNELS],
            accum: [0; TPC_CHANNELS],
            accum25: [0; TPC_CHANNELS],
            accum75: [0; TPC_CHANNELS],
            prev_samp: [0; TPC_CHANNELS * NTAPS],
            prev_was_over: [false; TPC_CHANNELS],
            hit_charge: [0; TPC_CHANNELS],
            hit_tover: [0; TPC_CHANNELS],
        }
    }
}

/// Output buffer for hit records, aligned like the state it is filled from.
#[repr(C, align(64))]
struct HitOutput {
    words: [u16; OUTPUT_CAPACITY],
}

pub struct TpFinder {
    taps: [i16; NTAPS],
    multiplier: i32,
    adc_max: i16,
    threshold_sigmas: i32,
    abs_time_mod_ntaps: usize,
    first_register: usize,
    last_register: usize,
    state: Box<ChannelState>,
    output: Box<HitOutput>,
    output_len: usize,
    primed: bool,
    nhits_total: u64,
}

impl TpFinder {
    pub fn new(threshold_sigmas: i32) -> Self {
        Self::with_registers(threshold_sigmas, 0, REGISTERS_PER_FRAME)
    }

    pub fn with_registers(threshold_sigmas: i32, first_register: usize, last_register: usize) -> Self {
        let multiplier = 1i32 << TAP_EXPONENT;
        let mut taps = [0i16; NTAPS];
        let designed = super::fir::firwin_int(NTAPS - 1, 0.1, multiplier);
        taps[..NTAPS - 1].copy_from_slice(&designed);

        Self {
            taps,
            multiplier,
            adc_max: (i16::MAX as i32 / multiplier) as i16,
            threshold_sigmas,
            abs_time_mod_ntaps: 0,
            first_register,
            last_register,
            state: Box::default(),
            output: Box::new(HitOutput {
                words: [0; OUTPUT_CAPACITY],
            }),
            output_len: 0,
            primed: false,
            nhits_total: 0,
        }
    }

    pub fn total_hits(&self) -> u64 {
        self.nhits_total
    }

    /// Seed pedestals from the first observed tick.
    fn prime(&mut self, chunk: &TpcChunk) {
        for ch in 0..TPC_CHANNELS {
            let pedestal = chunk.frames[0].adc[ch] as i16;
            self.state.pedestals[ch] = pedestal;
            self.state.quantile25[ch] = pedestal - 3;
            self.state.quantile75[ch] = pedestal + 3;
        }
        self.primed = true;
    }

    /// Process one super-chunk; returns the number of hits found in it.
    /// The hit records of this chunk can be read back with [`hits`].
    ///
    /// [`hits`]: TpFinder::hits
    pub fn process_chunk(&mut self, chunk: &TpcChunk) -> usize {
        if !self.primed {
            self.prime(chunk);
        }
        self.output_len = 0;
        let mut nhits = 0usize;

        for ch in 0..TPC_CHANNELS {
            let register = ch / SAMPLES_PER_REGISTER;
            if register < self.first_register || register >= self.last_register {
                continue;
            }

            let state = &mut *self.state;
            let prev = &mut state.prev_samp[ch * NTAPS..(ch + 1) * NTAPS];
            let mut abs_time = self.abs_time_mod_ntaps;

            for itime in 0..TPC_FRAMES_PER_CHUNK {
                let mut sample = chunk.frames[itime].adc[ch] as i16;

                // Pedestal and quantile tracking.
                if sample < state.pedestals[ch] {
                    frugal_accum_update(
                        &mut state.quantile25[ch],
                        sample,
                        &mut state.accum25[ch],
                        FRUGAL_LIMIT,
                    );
                }
                if sample > state.pedestals[ch] {
                    frugal_accum_update(
                        &mut state.quantile75[ch],
                        sample,
                        &mut state.accum75[ch],
                        FRUGAL_LIMIT,
                    );
                }
                frugal_accum_update(
                    &mut state.pedestals[ch],
                    sample,
                    &mut state.accum[ch],
                    FRUGAL_LIMIT,
                );
                let sigma = (state.quantile75[ch] - state.quantile25[ch]) as i32;

                sample -= state.pedestals[ch];

                // Filtering. The tap sum narrows to 16 bits at every step;
                // the input cap keeps a stationary signal inside that range,
                // transients wrap.
                sample = sample.min(self.adc_max);
                let mut filt: i16 = 0;
                for (j, tap) in self.taps.iter().enumerate() {
                    filt = (filt as i32 + *tap as i32 * prev[(j + abs_time) % NTAPS] as i32) as i16;
                }
                prev[abs_time % NTAPS] = sample;
                abs_time = (abs_time + 1) % NTAPS;

                // Hit finding.
                let is_over = (filt as i32) > self.threshold_sigmas * sigma * self.multiplier;
                if is_over {
                    let charge = (state.hit_charge[ch] as i32 + (filt >> TAP_EXPONENT) as i32)
                        .min(i16::MAX as i32);
                    state.hit_charge[ch] = charge as i16;
                    state.hit_tover[ch] += 1;
                    state.prev_was_over[ch] = true;
                }
                if state.prev_was_over[ch] && !is_over {
                    if self.output_len + 2 * HIT_WORDS <= OUTPUT_CAPACITY {
                        let out = &mut self.output.words[self.output_len..];
                        out[0] = ch as u16;
                        out[1] = itime as u16;
                        out[2] = state.hit_charge[ch] as u16;
                        out[3] = state.hit_tover[ch] as u16;
                        self.output_len += HIT_WORDS;
                        nhits += 1;
                    }
                    state.hit_charge[ch] = 0;
                    state.hit_tover[ch] = 0;
                    state.prev_was_over[ch] = false;
                }
            }
        }

        self.abs_time_mod_ntaps = (self.abs_time_mod_ntaps + TPC_FRAMES_PER_CHUNK) % NTAPS;

        for i in 0..HIT_WORDS {
            self.output.words[self.output_len + i] = HIT_SENTINEL;
        }
        self.nhits_total += nhits as u64;
        nhits
    }

    /// Hit records of the last processed chunk, up to the sentinel.
    pub fn hits(&self) -> impl Iterator<Item = TriggerPrimitive> + '_ {
        self.output.words[..self.output_len]
            .chunks_exact(HIT_WORDS)
            .take_while(|words| words[0] != HIT_SENTINEL)
            .map(|words| TriggerPrimitive {
                channel: words[0],
                end_tick: words[1],
                charge: words[2],
                time_over_threshold: words[3],
            })
    }

    /// Raw output words including the sentinel, as laid out in memory.
    pub fn output_words(&self) -> &[u16] {
        &self.output.words[..self.output_len + HIT_WORDS]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use readout_frames::FrameChunk;

    const BASELINE: u16 = 1000;

    fn flat_chunk(ts: u64) -> TpcChunk {
        let mut chunk = TpcChunk::at_timestamp(ts);
        for frame in chunk.frames.iter_mut() {
            frame.adc = [BASELINE; TPC_CHANNELS];
        }
        chunk
    }

    #[test]
    fn frugal_accumulator_moves_after_saturation() {
        let mut median = 100i16;
        let mut accum = 0i16;
        for _ in 0..FRUGAL_LIMIT as usize {
            frugal_accum_update(&mut median, 200, &mut accum, FRUGAL_LIMIT);
            assert_eq!(median, 100);
        }
        frugal_accum_update(&mut median, 200, &mut accum, FRUGAL_LIMIT);
        assert_eq!(median, 101);
        assert_eq!(accum, 0);
    }

    #[test]
    fn quiet_baseline_produces_no_hits() {
        let mut finder = TpFinder::new(DEFAULT_THRESHOLD_SIGMAS);
        for i in 0..20u64 {
            assert_eq!(finder.process_chunk(&flat_chunk(i * 300)), 0);
        }
        assert_eq!(finder.total_hits(), 0);
        assert_eq!(finder.output_words(), &[HIT_SENTINEL; 4]);
    }

    #[test]
    fn single_pulse_emits_one_hit_on_its_channel() {
        let mut finder = TpFinder::new(DEFAULT_THRESHOLD_SIGMAS);
        // Settle pedestals first.
        for i in 0..4u64 {
            finder.process_chunk(&flat_chunk(i * 300));
        }

        let channel = 37;
        let mut pulsed = flat_chunk(1200);
        for itime in 3..6 {
            pulsed.frames[itime].adc[channel] = BASELINE + 500;
        }
        let mut hits: Vec<TriggerPrimitive> = Vec::new();
        let n = finder.process_chunk(&pulsed);
        hits.extend(finder.hits());
        // The FIR delays the response; the falling edge may land in the
        // following chunk.
        let n2 = finder.process_chunk(&flat_chunk(1500));
        hits.extend(finder.hits());

        assert_eq!(n + n2, 1, "exactly one hit for one pulse");
        assert_eq!(hits.len(), 1);
        let hit = &hits[0];
        assert_eq!(hit.channel, channel as u16);
        assert!(hit.charge > 0);
        assert!(hit.time_over_threshold >= 1);
        assert_eq!(finder.total_hits(), 1);
    }

    #[test]
    fn pedestal_tracks_baseline_shift() {
        let mut finder = TpFinder::new(DEFAULT_THRESHOLD_SIGMAS);
        finder.process_chunk(&flat_chunk(0));
        assert_eq!(finder.state.pedestals[0], BASELINE as i16);

        // Shift the baseline and give the frugal accumulator time to follow:
        // one count per FRUGAL_LIMIT+1 samples.
        let mut chunk = flat_chunk(300);
        for frame in chunk.frames.iter_mut() {
            frame.adc = [BASELINE + 20; TPC_CHANNELS];
        }
        for i in 0..30u64 {
            let mut shifted = chunk;
            shifted.rewrite_timestamps(300 + i * 300);
            finder.process_chunk(&shifted);
        }
        let pedestal = finder.state.pedestals[0];
        assert!(
            (pedestal - (BASELINE + 20) as i16).abs() <= 2,
            "pedestal {pedestal} should have followed the baseline"
        );
    }

    #[test]
    fn output_is_sentinel_terminated() {
        let mut finder = TpFinder::new(DEFAULT_THRESHOLD_SIGMAS);
        for i in 0..4u64 {
            finder.process_chunk(&flat_chunk(i * 300));
        }
        let mut pulsed = flat_chunk(1200);
        for itime in 2..5 {
            pulsed.frames[itime].adc[5] = BASELINE + 800;
        }
        finder.process_chunk(&pulsed);
        finder.process_chunk(&flat_chunk(1500));
        let words = finder.output_words();
        let tail = &words[words.len() - 4..];
        assert_eq!(tail, &[HIT_SENTINEL; 4]);
    }
}
