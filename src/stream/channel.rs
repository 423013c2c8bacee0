//! Per-channel analysis/synthesis state.
//!
//! A `ChannelProcessor` owns one channel's input ring, phase-vocoder state,
//! overlap-add accumulator, and output ring. The orchestrator (or a worker
//! thread borrowing the channel slot) feeds it input and drives one analysis
//! chunk at a time; each chunk synthesizes the scheduled output hop.

use crate::core::fft::{SpectrumFft, WINDOW_SUM_EPSILON, WINDOW_SUM_FLOOR_RATIO};
use crate::core::resample::StreamResampler;
use crate::core::ring_buffer::RingBuffer;
use crate::core::types::PhaseOption;
use log::warn;
use rustfft::FftPlanner;
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::sync::Arc;

const TWO_PI: f64 = 2.0 * PI;
/// Minimum magnitude for a bin to act as a phase-locking peak.
const MIN_PEAK_MAGNITUDE: f32 = 1e-8;

/// Frequency cutoffs handed to synthesis, in Hz.
///
/// `low` bounds the rigidly-locked band, `mid` is where adaptive peak
/// locking starts, `high` caps the band affected by hard phase resets.
#[derive(Debug, Clone, Copy)]
pub struct FrequencyCutoffs {
    pub low: f32,
    pub mid: f32,
    pub high: f32,
}

impl Default for FrequencyCutoffs {
    fn default() -> Self {
        Self {
            low: 600.0,
            mid: 1200.0,
            high: 12000.0,
        }
    }
}

/// Per-channel streaming state.
pub struct ChannelProcessor {
    sample_rate: u32,
    window_size: usize,
    increment: usize,
    pitch_scale: f64,
    realtime: bool,
    phase_option: PhaseOption,
    cutoffs: FrequencyCutoffs,

    window: Arc<Vec<f32>>,
    /// Pre-planned transforms, one per provisioned window size.
    fft_bank: BTreeMap<usize, SpectrumFft>,

    inbuf: RingBuffer<f32>,
    outbuf: RingBuffer<f32>,

    /// Overlap-add target, `window_size` live samples.
    accumulator: Vec<f32>,
    /// Accumulated squared-window weights matching `accumulator`.
    window_accumulator: Vec<f32>,
    /// Windowed chunk in, synthesized chunk out.
    time_buf: Vec<f32>,
    /// Magnitude spectrum of the current chunk.
    mags: Vec<f32>,
    /// Phase spectrum of the current chunk.
    phases: Vec<f32>,
    /// Analysis phases of the previous chunk.
    prev_phase: Vec<f64>,
    /// Carried synthesis phases.
    phase_accum: Vec<f64>,
    /// True between `analyse_spectrum` and `synthesise`.
    spectrum_valid: bool,

    in_count: u64,
    out_count: u64,
    /// Total input length, set when the final chunk has been written.
    input_size: Option<u64>,
    draining: bool,
    chunk_index: usize,
    /// Fixed schedule of output hops (offline); empty in real-time mode.
    schedule: Arc<Vec<i32>>,
    /// Fallback hop when the schedule is exhausted.
    nominal_increment: i32,

    resampler: Option<StreamResampler>,
    resample_buf: Vec<f32>,
    emit_buf: Vec<f32>,
}

impl ChannelProcessor {
    /// Creates a channel sized for `window_size`, with transforms planned for
    /// every size in `window_sizes` so later switches need no allocation.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        planner: &mut FftPlanner<f32>,
        window_sizes: &[usize],
        window: Arc<Vec<f32>>,
        window_size: usize,
        increment: usize,
        outbuf_size: usize,
        sample_rate: u32,
        realtime: bool,
        phase_option: PhaseOption,
        cutoffs: FrequencyCutoffs,
    ) -> Self {
        let max_window = window_sizes
            .iter()
            .copied()
            .chain(std::iter::once(window_size))
            .max()
            .unwrap_or(window_size);
        let max_bins = max_window / 2 + 1;

        let mut fft_bank = BTreeMap::new();
        for &size in window_sizes {
            fft_bank.insert(size, SpectrumFft::new(planner, size));
        }
        fft_bank
            .entry(window_size)
            .or_insert_with(|| SpectrumFft::new(planner, window_size));

        Self {
            sample_rate,
            window_size,
            increment: increment.max(1),
            pitch_scale: 1.0,
            realtime,
            phase_option,
            cutoffs,
            window,
            fft_bank,
            inbuf: RingBuffer::with_capacity(max_window + increment.max(1) * 2),
            outbuf: RingBuffer::with_capacity(outbuf_size),
            accumulator: vec![0.0; max_window],
            window_accumulator: vec![0.0; max_window],
            time_buf: vec![0.0; max_window],
            mags: vec![0.0; max_bins],
            phases: vec![0.0; max_bins],
            prev_phase: vec![0.0; max_bins],
            phase_accum: vec![0.0; max_bins],
            spectrum_valid: false,
            in_count: 0,
            out_count: 0,
            input_size: None,
            draining: false,
            chunk_index: 0,
            schedule: Arc::new(Vec::new()),
            nominal_increment: increment.max(1) as i32,
            resampler: None,
            resample_buf: Vec::new(),
            emit_buf: Vec::new(),
        }
    }

    /// Pushes input samples, returning how many were accepted. Zero means
    /// the caller must drain output before retrying.
    pub fn write(&mut self, samples: &[f32]) -> usize {
        let n = self.inbuf.push_slice(samples);
        self.in_count += n as u64;
        n
    }

    /// Drains up to `out.len()` synthesized samples.
    pub fn read(&mut self, out: &mut [f32]) -> usize {
        let n = self.outbuf.pop_slice(out);
        self.out_count += n as u64;
        n
    }

    /// Samples ready for `read`.
    #[inline]
    pub fn output_available(&self) -> usize {
        self.outbuf.len()
    }

    /// Free space in the output ring.
    #[inline]
    pub fn output_headroom(&self) -> usize {
        self.outbuf.available()
    }

    /// Samples buffered on the input side.
    #[inline]
    pub fn input_buffered(&self) -> usize {
        self.inbuf.len()
    }

    /// Discards `n` samples from the input ring (study pass advance).
    #[inline]
    pub fn input_skip(&mut self, n: usize) {
        self.inbuf.discard(n);
    }

    #[inline]
    pub fn in_count(&self) -> u64 {
        self.in_count
    }

    #[inline]
    pub fn is_draining(&self) -> bool {
        self.draining
    }

    #[inline]
    pub fn input_closed(&self) -> bool {
        self.input_size.is_some()
    }

    /// Marks the input stream closed at the current write count.
    pub fn mark_input_final(&mut self) {
        if self.input_size.is_none() {
            self.input_size = Some(self.in_count);
        }
    }

    /// Pushes half a window of silence ahead of the input, centring the
    /// first chunk on the first real sample (used at real-time process
    /// start; the offline prefill happens in `reset`).
    pub fn prefill_silence(&mut self) {
        self.inbuf.push_zeros(self.window_size / 2);
    }

    /// Installs the fixed output-hop schedule and its fallback hop.
    pub fn set_schedule(&mut self, schedule: Arc<Vec<i32>>, nominal_increment: i32) {
        self.schedule = schedule;
        self.nominal_increment = nominal_increment.max(1);
    }

    pub fn set_phase_option(&mut self, phase_option: PhaseOption) {
        self.phase_option = phase_option;
    }

    pub fn set_frequency_cutoffs(&mut self, cutoffs: FrequencyCutoffs) {
        self.cutoffs = cutoffs;
    }

    pub fn set_pitch_scale(&mut self, pitch_scale: f64) {
        self.pitch_scale = pitch_scale;
    }

    /// Ensures a resampler exists for pitch shifting. Returns true when one
    /// had to be allocated (the real-time reconfigure path warns on this).
    pub fn ensure_resampler(&mut self, capacity_hint: usize) -> bool {
        if self.resampler.is_some() {
            return false;
        }
        self.resampler = Some(StreamResampler::new(capacity_hint));
        self.resample_buf = Vec::with_capacity(capacity_hint);
        true
    }

    /// Switches the analysis window. The new size must have been provisioned
    /// at construction in real-time mode; otherwise a transform is planned on
    /// the spot (the caller logs the allocation warning).
    pub fn set_window_size(
        &mut self,
        window_size: usize,
        window: Arc<Vec<f32>>,
        planner: &mut FftPlanner<f32>,
    ) -> bool {
        let allocated = !self.fft_bank.contains_key(&window_size);
        self.fft_bank
            .entry(window_size)
            .or_insert_with(|| SpectrumFft::new(planner, window_size));

        let bins = window_size / 2 + 1;
        if self.accumulator.len() < window_size {
            self.accumulator.resize(window_size, 0.0);
            self.window_accumulator.resize(window_size, 0.0);
            self.time_buf.resize(window_size, 0.0);
        }
        if self.mags.len() < bins {
            self.mags.resize(bins, 0.0);
            self.phases.resize(bins, 0.0);
            self.prev_phase.resize(bins, 0.0);
            self.phase_accum.resize(bins, 0.0);
        }
        if self.inbuf.capacity() < window_size + self.increment * 2 {
            self.inbuf.grow(window_size + self.increment * 2);
        }

        self.window_size = window_size;
        self.window = window;
        // Phase history is meaningless across a size change
        self.prev_phase.fill(0.0);
        self.phase_accum.fill(0.0);
        self.spectrum_valid = false;
        allocated
    }

    /// Grows the output ring to the newly calculated capacity.
    pub fn set_outbuf_size(&mut self, outbuf_size: usize) {
        self.outbuf.grow(outbuf_size);
    }

    /// Clears all streaming state. Offline mode prefills half a window of
    /// silence so the first chunk is centred on the first input sample;
    /// real-time mode skips the prefill because the caller prefers low
    /// latency over hiding the initial swoosh.
    pub fn reset(&mut self) {
        self.inbuf.clear();
        self.outbuf.clear();
        self.accumulator.fill(0.0);
        self.window_accumulator.fill(0.0);
        self.prev_phase.fill(0.0);
        self.phase_accum.fill(0.0);
        self.spectrum_valid = false;
        self.in_count = 0;
        self.out_count = 0;
        self.input_size = None;
        self.draining = false;
        self.chunk_index = 0;
        if let Some(rs) = self.resampler.as_mut() {
            rs.reset();
        }
        if !self.realtime {
            self.inbuf.push_zeros(self.window_size / 2);
        }
    }

    /// True when a full analysis chunk can be formed: a whole window, or at
    /// least half a window once the input is closed (the remainder is
    /// zero-padded).
    pub fn can_analyse(&self) -> bool {
        if self.draining {
            return false;
        }
        if self.inbuf.len() >= self.window_size {
            return true;
        }
        self.input_closed() && self.inbuf.len() >= self.window_size / 2
    }

    /// Peeks the next chunk (zero-padded past the end of a closed input)
    /// and applies the analysis window in place.
    fn window_chunk(&mut self) {
        let w = self.window_size;
        let got = self.inbuf.peek_slice(&mut self.time_buf[..w]);
        if got < w {
            self.time_buf[got..w].fill(0.0);
        }
        crate::core::window::apply_window(&mut self.time_buf[..w], &self.window);
    }

    /// Windows the next chunk and computes its magnitude/phase spectrum.
    pub fn analyse_spectrum(&mut self) {
        self.window_chunk();
        let w = self.window_size;
        let fft = self
            .fft_bank
            .get_mut(&w)
            .expect("transform provisioned for current window size");
        fft.forward_polar(&self.time_buf[..w], &mut self.mags, &mut self.phases);
        self.spectrum_valid = true;
    }

    /// Windows the next chunk and computes its magnitude spectrum only.
    ///
    /// The study pass has no use for phases, so it takes this cheaper path;
    /// the chunk is not prepared for `synthesise`.
    pub fn analyse_magnitude(&mut self) {
        self.window_chunk();
        let w = self.window_size;
        let fft = self
            .fft_bank
            .get_mut(&w)
            .expect("transform provisioned for current window size");
        fft.forward_magnitude(&self.time_buf[..w], &mut self.mags);
    }

    /// Magnitude spectrum of the chunk prepared by `analyse_spectrum`.
    pub fn magnitudes(&self) -> &[f32] {
        &self.mags[..self.window_size / 2 + 1]
    }

    /// One full analysis step using the installed schedule.
    pub fn analyse_one(&mut self) {
        self.analyse_spectrum();
        let hop = self
            .schedule
            .get(self.chunk_index)
            .copied()
            .unwrap_or(self.nominal_increment);
        self.synthesise(hop);
    }

    /// Runs analysis chunks while input allows. Returns chunks processed.
    pub fn process_available(&mut self) -> usize {
        let mut chunks = 0;
        while self.can_analyse() {
            self.analyse_one();
            chunks += 1;
        }
        chunks
    }

    /// Completes the chunk started by `analyse_spectrum`: propagates or
    /// resets phases, synthesizes, overlap-adds, emits `|hop|` samples, and
    /// advances the input ring by the analysis increment.
    pub fn synthesise(&mut self, hop: i32) {
        debug_assert!(self.spectrum_valid, "synthesise without analyse_spectrum");
        let w = self.window_size;
        let bins = w / 2 + 1;
        let out_hop = (hop.unsigned_abs() as usize).max(1);
        let phase_reset = hop < 0;
        let scale = out_hop as f64 / self.increment as f64;

        if phase_reset {
            let reset_limit = self.bin_for_frequency(self.cutoffs.high).min(bins);
            for bin in 0..reset_limit {
                self.phase_accum[bin] = self.phases[bin] as f64;
            }
            for bin in reset_limit..bins {
                self.propagate_bin(bin, scale, w);
            }
        } else {
            for bin in 0..bins {
                self.propagate_bin(bin, scale, w);
            }
        }
        for bin in 0..bins {
            self.prev_phase[bin] = self.phases[bin] as f64;
        }

        self.apply_phase_locking(bins);

        // Synthesis phases back into the time domain
        let mut synth_phases = std::mem::take(&mut self.phases);
        for (bin, p) in synth_phases.iter_mut().take(bins).enumerate() {
            *p = self.phase_accum[bin] as f32;
        }
        {
            let fft = self
                .fft_bank
                .get_mut(&w)
                .expect("transform provisioned for current window size");
            fft.inverse_polar(&self.mags, &synth_phases, &mut self.time_buf[..w]);
        }
        self.phases = synth_phases;

        // Overlap-add with the synthesis window (same Hann), tracking the
        // squared-window sum for normalization on emit
        for i in 0..w {
            let wv = self.window[i];
            self.accumulator[i] += self.time_buf[i] * wv;
            self.window_accumulator[i] += wv * wv;
        }

        self.emit(out_hop);

        self.inbuf.discard(self.increment.min(self.inbuf.len()));
        self.chunk_index += 1;
        self.spectrum_valid = false;

        if self.input_closed() && self.inbuf.len() < self.window_size / 2 {
            self.draining = true;
        }
    }

    fn propagate_bin(&mut self, bin: usize, scale: f64, w: usize) {
        let expected = TWO_PI * bin as f64 * self.increment as f64 / w as f64;
        let mut delta = self.phases[bin] as f64 - self.prev_phase[bin] - expected;
        delta -= TWO_PI * (delta / TWO_PI).round();
        self.phase_accum[bin] += (expected + delta) * scale;
    }

    /// Applies the configured phase continuity policy over `phase_accum`.
    fn apply_phase_locking(&mut self, bins: usize) {
        match self.phase_option {
            PhaseOption::Independent => {}
            PhaseOption::PeakLocked => self.lock_to_peaks(1, bins),
            PhaseOption::Adaptive => {
                let low = self.bin_for_frequency(self.cutoffs.low).min(bins);
                let mid = self.bin_for_frequency(self.cutoffs.mid).min(bins);
                // Rigid lock below the low cutoff keeps the bass coherent
                if low > 1 {
                    let anchor = (1..low)
                        .max_by(|&a, &b| {
                            self.mags[a]
                                .partial_cmp(&self.mags[b])
                                .unwrap_or(std::cmp::Ordering::Equal)
                        })
                        .unwrap_or(1);
                    if self.mags[anchor] > MIN_PEAK_MAGNITUDE {
                        for bin in 1..low {
                            if bin != anchor {
                                self.phase_accum[bin] = self.phase_accum[anchor]
                                    + (self.phases[bin] - self.phases[anchor]) as f64;
                            }
                        }
                    }
                }
                self.lock_to_peaks(mid, bins);
            }
        }
    }

    /// Identity phase locking: bins follow their nearest spectral peak,
    /// keeping its analysis-phase offset.
    fn lock_to_peaks(&mut self, start_bin: usize, bins: usize) {
        if bins < 3 || start_bin + 1 >= bins {
            return;
        }
        let mut peaks: Vec<usize> = Vec::with_capacity(bins / 4);
        for bin in start_bin.max(1)..bins - 1 {
            let m = self.mags[bin];
            if m > MIN_PEAK_MAGNITUDE && m >= self.mags[bin - 1] && m > self.mags[bin + 1] {
                peaks.push(bin);
            }
        }
        if peaks.is_empty() {
            return;
        }

        let mut peak_idx = 0usize;
        for bin in start_bin..bins {
            if self.mags[bin] <= MIN_PEAK_MAGNITUDE {
                continue;
            }
            // Advance to the nearest peak (regions split at midpoints)
            while peak_idx + 1 < peaks.len()
                && peaks[peak_idx + 1].abs_diff(bin) < peaks[peak_idx].abs_diff(bin)
            {
                peak_idx += 1;
            }
            let peak = peaks[peak_idx];
            if bin != peak {
                self.phase_accum[bin] =
                    self.phase_accum[peak] + (self.phases[bin] - self.phases[peak]) as f64;
            }
        }
    }

    /// Normalizes and emits `hop` samples from the front of the accumulator
    /// into the output ring, resampling for pitch when configured.
    fn emit(&mut self, hop: usize) {
        let w = self.window_size;
        let hop = hop.min(w);

        let win_peak = self.window_accumulator[..w]
            .iter()
            .fold(0.0f32, |a, &b| a.max(b));
        let floor = WINDOW_SUM_EPSILON.max(win_peak * WINDOW_SUM_FLOOR_RATIO);

        self.emit_buf.clear();
        for i in 0..hop {
            self.emit_buf
                .push(self.accumulator[i] / self.window_accumulator[i].max(floor));
        }

        let resampling = self.pitch_scale != 1.0 && self.resampler.is_some();
        let needed = if resampling {
            let ratio = 1.0 / self.pitch_scale;
            self.resample_buf.clear();
            if let Some(rs) = self.resampler.as_mut() {
                rs.process(&self.emit_buf, ratio, &mut self.resample_buf);
            }
            self.resample_buf.len()
        } else {
            self.emit_buf.len()
        };

        if self.outbuf.available() < needed {
            if self.realtime {
                warn!(
                    "output buffer overrun in real-time mode: dropping {} of {} samples",
                    needed - self.outbuf.available(),
                    needed
                );
            } else {
                // Offline the calculated size is a lower bound; grow rather
                // than stall the whole pass
                let new_cap = (self.outbuf.capacity() * 2).max(self.outbuf.len() + needed);
                warn!(
                    "output buffer undersized for this stretch; growing {} -> {}",
                    self.outbuf.capacity(),
                    new_cap
                );
                self.outbuf.grow(new_cap);
            }
        }
        if resampling {
            self.outbuf.push_slice(&self.resample_buf);
        } else {
            self.outbuf.push_slice(&self.emit_buf);
        }

        // Slide the overlap-add window forward
        self.accumulator.copy_within(hop..w, 0);
        self.accumulator[w - hop..w].fill(0.0);
        self.window_accumulator.copy_within(hop..w, 0);
        self.window_accumulator[w - hop..w].fill(0.0);
    }

    fn bin_for_frequency(&self, freq: f32) -> usize {
        ((freq as f64 * self.window_size as f64 / self.sample_rate as f64).round() as usize).max(1)
    }
}

impl std::fmt::Debug for ChannelProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelProcessor")
            .field("window_size", &self.window_size)
            .field("increment", &self.increment)
            .field("in_count", &self.in_count)
            .field("out_count", &self.out_count)
            .field("draining", &self.draining)
            .field("chunk_index", &self.chunk_index)
            .finish()
    }
}
