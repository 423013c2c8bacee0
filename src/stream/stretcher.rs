//! Streaming time-stretch orchestrator.
//!
//! Drives the mode state machine (created → studying → processing →
//! finished), owns the per-channel processors, curves, and stretch
//! calculator, and coordinates offline two-pass processing (optionally with
//! one worker thread per channel) against single-pass real-time processing.

use crate::analysis::artifact::StudyArtifact;
use crate::analysis::curves::AudioCurve;
use crate::core::ring_buffer::RingBuffer;
use crate::core::types::{
    PhaseOption, StretchProfile, StretcherOptions, ThreadingOption, TransientsOption,
};
use crate::core::window::hann_window;
use crate::error::StretchError;
use crate::stream::channel::{ChannelProcessor, FrequencyCutoffs};
use crate::stretch::calculator::StretchCalculator;
use crate::stretch::sizes::{
    calculate_sizes, round_up_pow2, SizeRequest, DEFAULT_INCREMENT, DEFAULT_WINDOW_SIZE,
};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use rustfft::FftPlanner;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Bound on a single wait for worker-freed space. A missed wakeup costs at
/// most this much.
const SPACE_WAIT: Duration = Duration::from_millis(500);
/// Worker poll interval: lets workers resume after output drainage without a
/// dedicated wakeup from `retrieve`.
const WORKER_POLL: Duration = Duration::from_millis(50);
/// Consecutive no-progress iterations of the feed loop before giving up.
const STALL_LIMIT: usize = 120;
/// Capacity of the real-time introspection rings.
const INTROSPECTION_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    JustCreated,
    Studying,
    Processing,
    Finished,
}

struct WorkerShared {
    shutdown: AtomicBool,
    space_mutex: Mutex<()>,
    space_available: Condvar,
}

struct WorkerHandle {
    sender: Sender<()>,
    join: Option<JoinHandle<()>>,
}

/// Phase-vocoder time stretcher and pitch shifter.
///
/// Offline use is two-pass: feed the whole input through [`study`]
/// (last call with `final_chunk = true`), then the same input through
/// [`process`], draining with [`retrieve`]. Real-time use is single-pass:
/// call [`process`] with each block and drain as you go.
///
/// [`study`]: Stretcher::study
/// [`process`]: Stretcher::process
/// [`retrieve`]: Stretcher::retrieve
pub struct Stretcher {
    sample_rate: u32,
    channels: usize,
    options: StretcherOptions,
    time_ratio: f64,
    pitch_scale: f64,
    realtime: bool,
    threaded: bool,
    rate_multiple: f64,
    base_window_size: usize,
    window_size: usize,
    increment: usize,
    outbuf_size: usize,
    max_process_size: usize,
    expected_input_duration: u64,
    mode: Mode,
    debug_level: u8,
    cutoffs: FrequencyCutoffs,

    planner: FftPlanner<f32>,
    windows: BTreeMap<usize, Arc<Vec<f32>>>,

    input_duration: u64,
    phase_reset_df: Vec<f32>,
    stretch_df: Vec<f32>,
    output_increments: Vec<i32>,

    percussive_curve: AudioCurve,
    stretch_curve: Option<AudioCurve>,
    calculator: StretchCalculator,

    channel_slots: Vec<Arc<Mutex<ChannelProcessor>>>,
    workers: Vec<WorkerHandle>,
    shared: Arc<WorkerShared>,

    /// Last few per-chunk output hops (real-time introspection).
    last_process_increments: Mutex<RingBuffer<i32>>,
    /// Last few per-chunk phase-reset values (real-time introspection).
    last_process_df: Mutex<RingBuffer<f32>>,
    /// Scratch for the summed cross-channel magnitude spectrum.
    rt_mags: Vec<f32>,
}

impl Stretcher {
    /// Creates a stretcher.
    ///
    /// Panics when `channels` is zero or a ratio is not positive; both are
    /// programming errors, not recoverable conditions.
    pub fn new(
        sample_rate: u32,
        channels: usize,
        options: StretcherOptions,
        initial_time_ratio: f64,
        initial_pitch_scale: f64,
    ) -> Self {
        assert!(channels > 0, "at least one channel required");
        assert!(
            initial_time_ratio > 0.0 && initial_pitch_scale > 0.0,
            "ratios must be positive"
        );

        let mut options = options;
        let realtime = options.is_realtime();
        if realtime && options.stretch != StretchProfile::Precise {
            debug!("real-time mode: enabling the precise stretch profile");
            options.stretch = StretchProfile::Precise;
        }

        // Window size varies with the sample rate but never drops below the
        // 48k default.
        let rate_multiple = (sample_rate as f64 / 48_000.0).max(1.0);
        let mut base_window_size =
            round_up_pow2((DEFAULT_WINDOW_SIZE as f64 * rate_multiple) as usize);
        if options.window_short && options.window_long {
            warn!("cannot request both short and long windows; using the standard size");
            options.window_short = false;
            options.window_long = false;
        } else if options.window_short {
            base_window_size /= 2;
        } else if options.window_long {
            base_window_size *= 2;
        }

        let threaded = !realtime
            && channels > 1
            && options.threading == ThreadingOption::Auto
            && std::thread::available_parallelism()
                .map(|p| p.get() > 1)
                .unwrap_or(false);
        if threaded {
            debug!("using one worker thread per channel");
        }

        let use_hard_peaks = options.transients != TransientsOption::Smooth;

        let mut stretcher = Self {
            sample_rate,
            channels,
            options,
            time_ratio: initial_time_ratio,
            pitch_scale: initial_pitch_scale,
            realtime,
            threaded,
            rate_multiple,
            base_window_size,
            window_size: base_window_size,
            increment: DEFAULT_INCREMENT,
            outbuf_size: base_window_size * 2,
            max_process_size: base_window_size,
            expected_input_duration: 0,
            mode: Mode::JustCreated,
            debug_level: 0,
            cutoffs: FrequencyCutoffs::default(),
            planner: FftPlanner::new(),
            windows: BTreeMap::new(),
            input_duration: 0,
            phase_reset_df: Vec::new(),
            stretch_df: Vec::new(),
            output_increments: Vec::new(),
            percussive_curve: AudioCurve::percussive(base_window_size),
            stretch_curve: None,
            calculator: StretchCalculator::new(sample_rate, DEFAULT_INCREMENT, use_hard_peaks),
            channel_slots: Vec::new(),
            workers: Vec::new(),
            shared: Arc::new(WorkerShared {
                shutdown: AtomicBool::new(false),
                space_mutex: Mutex::new(()),
                space_available: Condvar::new(),
            }),
            last_process_increments: Mutex::new(RingBuffer::with_capacity(INTROSPECTION_CAPACITY)),
            last_process_df: Mutex::new(RingBuffer::with_capacity(INTROSPECTION_CAPACITY)),
            rt_mags: Vec::new(),
        };
        stretcher.configure();
        stretcher
    }

    /// `timeRatio * pitchScale`: the ratio the stretcher realizes
    /// internally before resampling undoes the pitch-induced time change.
    #[inline]
    fn effective_ratio(&self) -> f64 {
        self.time_ratio * self.pitch_scale
    }

    fn size_request(&self) -> SizeRequest {
        SizeRequest {
            effective_ratio: self.effective_ratio(),
            realtime: self.realtime,
            threaded: self.threaded,
            base_window_size: self.base_window_size,
            rate_multiple: self.rate_multiple,
            expected_input_duration: self.expected_input_duration,
            pitch_scale: self.pitch_scale,
            time_ratio: self.time_ratio,
            max_process_size: self.max_process_size,
        }
    }

    /// Full (re)build of windows, channels, curves, and calculator. Offline
    /// this may run whenever a parameter changes before processing begins;
    /// real-time it runs once at construction and `reconfigure` takes over.
    fn configure(&mut self) {
        let first = self.windows.is_empty();
        let prev_window = if first { 0 } else { self.window_size };
        let prev_outbuf = if first { 0 } else { self.outbuf_size };

        let sizes = calculate_sizes(&self.size_request());
        self.window_size = sizes.window_size;
        self.increment = sizes.input_increment;
        self.outbuf_size = sizes.outbuf_size;
        self.max_process_size = sizes.max_process_size;

        if self.debug_level > 0 {
            debug!(
                "configure: effective ratio {:.4}, window {}, increment {}, outbuf {}",
                self.effective_ratio(),
                self.window_size,
                self.increment,
                self.outbuf_size
            );
        }

        let window_changed = prev_window != self.window_size;
        let outbuf_changed = prev_outbuf != self.outbuf_size;

        let mut provisioned: BTreeSet<usize> = BTreeSet::new();
        if self.realtime {
            // Pre-provision the sizes a ratio change could select, so the
            // reconfigure path normally allocates nothing.
            provisioned.insert(self.base_window_size);
            provisioned.insert(self.base_window_size * 2);
            provisioned.insert(self.base_window_size * 4);
        }
        provisioned.insert(self.window_size);

        if window_changed {
            for &size in &provisioned {
                self.windows
                    .entry(size)
                    .or_insert_with(|| Arc::new(hann_window(size)));
            }
        }

        if window_changed || outbuf_changed {
            let window = self.windows[&self.window_size].clone();
            let sizes_list: Vec<usize> = provisioned.iter().copied().collect();
            self.channel_slots.clear();
            for _ in 0..self.channels {
                let ch = ChannelProcessor::new(
                    &mut self.planner,
                    &sizes_list,
                    window.clone(),
                    self.window_size,
                    self.increment,
                    self.outbuf_size,
                    self.sample_rate,
                    self.realtime,
                    self.options.phase,
                    self.cutoffs,
                );
                self.channel_slots.push(Arc::new(Mutex::new(ch)));
            }
        }

        if self.pitch_scale != 1.0 || self.realtime {
            let hint = self.resample_capacity_hint();
            for slot in &self.channel_slots {
                let mut ch = slot.lock();
                ch.ensure_resampler(hint);
                ch.set_pitch_scale(self.pitch_scale);
            }
        } else {
            for slot in &self.channel_slots {
                slot.lock().set_pitch_scale(1.0);
            }
        }

        self.percussive_curve = AudioCurve::percussive(self.window_size);
        self.stretch_curve = if self.realtime {
            // The stretch-weight curve only feeds the offline global pass
            None
        } else {
            Some(match self.options.stretch {
                StretchProfile::Elastic => AudioCurve::high_frequency(self.window_size),
                StretchProfile::Precise => AudioCurve::constant(),
            })
        };
        self.calculator = StretchCalculator::new(
            self.sample_rate,
            self.increment,
            self.options.transients != TransientsOption::Smooth,
        );
        self.input_duration = 0;

        if !self.realtime {
            // Channel reset prefills half a window so the first chunk is
            // centred on sample zero
            for slot in &self.channel_slots {
                slot.lock().reset();
            }
        }
    }

    /// Allocation-avoiding reconfigure for ratio changes mid-stream.
    ///
    /// Anything this has to allocate should have been provisioned by
    /// `configure`; when it wasn't, a warning is logged and the allocation
    /// happens anyway, so the contract is effectively real-time safe rather
    /// than hard real-time.
    fn reconfigure(&mut self) {
        if !self.realtime {
            if self.mode == Mode::Studying {
                // Bank the curves studied so far at the old ratio, then
                // start fresh curves for the remainder
                self.calculate_stretch();
                self.phase_reset_df.clear();
                self.stretch_df.clear();
                self.input_duration = 0;
            }
            self.configure();
            return;
        }

        let prev_window = self.window_size;
        let prev_outbuf = self.outbuf_size;
        let prev_increment = self.increment;

        let sizes = calculate_sizes(&self.size_request());
        self.window_size = sizes.window_size;
        self.increment = sizes.input_increment;
        self.outbuf_size = sizes.outbuf_size;
        self.max_process_size = sizes.max_process_size;

        if self.window_size != prev_window {
            let window = match self.windows.get(&self.window_size) {
                Some(w) => w.clone(),
                None => {
                    warn!(
                        "reconfigure: window allocation (size {}) required in real-time mode",
                        self.window_size
                    );
                    let w = Arc::new(hann_window(self.window_size));
                    self.windows.insert(self.window_size, w.clone());
                    w
                }
            };
            for slot in &self.channel_slots {
                let allocated =
                    slot.lock()
                        .set_window_size(self.window_size, window.clone(), &mut self.planner);
                if allocated {
                    warn!(
                        "reconfigure: transform allocation (size {}) required in real-time mode",
                        self.window_size
                    );
                }
            }
            self.percussive_curve.set_window_size(self.window_size);
        }

        if self.outbuf_size != prev_outbuf {
            for slot in &self.channel_slots {
                slot.lock().set_outbuf_size(self.outbuf_size);
            }
        }

        if self.pitch_scale != 1.0 {
            let hint = self.resample_capacity_hint();
            for slot in &self.channel_slots {
                let mut ch = slot.lock();
                if ch.ensure_resampler(hint) {
                    warn!("reconfigure: resampler construction required in real-time mode");
                }
                ch.set_pitch_scale(self.pitch_scale);
            }
        } else {
            for slot in &self.channel_slots {
                slot.lock().set_pitch_scale(1.0);
            }
        }

        if self.increment != prev_increment {
            self.calculator = StretchCalculator::new(
                self.sample_rate,
                self.increment,
                self.options.transients != TransientsOption::Smooth,
            );
        }
    }

    /// Resampler scratch sized for the current hop, with headroom so a later
    /// pitch change fits without reallocation.
    fn resample_capacity_hint(&self) -> usize {
        let rbs = ((self.increment as f64 * self.time_ratio * 2.0) / self.pitch_scale).ceil()
            as usize;
        rbs.max(self.increment * 16)
    }

    /// Destroys and rebuilds per-channel state, clears the study curves, and
    /// returns the mode to just-created. Workers are stopped and joined
    /// first; they restart on the next processing pass.
    pub fn reset(&mut self) {
        self.stop_workers();
        for slot in &self.channel_slots {
            slot.lock().reset();
        }
        self.mode = Mode::JustCreated;
        self.percussive_curve.reset();
        if let Some(curve) = self.stretch_curve.as_mut() {
            curve.reset();
        }
        self.calculator.reset();
        self.input_duration = 0;
        self.phase_reset_df.clear();
        self.stretch_df.clear();
        self.output_increments.clear();
        self.last_process_increments.lock().clear();
        self.last_process_df.lock().clear();
    }

    /// Sets the output/input duration ratio. Offline this is rejected while
    /// studying or processing; real-time it applies immediately.
    pub fn set_time_ratio(&mut self, ratio: f64) {
        if !self.realtime && matches!(self.mode, Mode::Studying | Mode::Processing) {
            warn!("cannot set the time ratio while studying or processing in offline mode");
            return;
        }
        if ratio == self.time_ratio || ratio <= 0.0 {
            return;
        }
        self.time_ratio = ratio;
        self.reconfigure();
    }

    /// Sets the output/input frequency ratio. Offline this is rejected while
    /// studying or processing; real-time it applies immediately.
    pub fn set_pitch_scale(&mut self, scale: f64) {
        if !self.realtime && matches!(self.mode, Mode::Studying | Mode::Processing) {
            warn!("cannot set the pitch scale while studying or processing in offline mode");
            return;
        }
        if scale == self.pitch_scale || scale <= 0.0 {
            return;
        }
        self.pitch_scale = scale;
        self.reconfigure();
    }

    #[inline]
    pub fn time_ratio(&self) -> f64 {
        self.time_ratio
    }

    #[inline]
    pub fn pitch_scale(&self) -> f64 {
        self.pitch_scale
    }

    /// Tells the sizer the total input length, letting it shrink the hop for
    /// very short material.
    pub fn set_expected_input_duration(&mut self, samples: u64) {
        if samples == self.expected_input_duration {
            return;
        }
        self.expected_input_duration = samples;
        self.reconfigure();
    }

    /// Raises the per-call input size bound (never shrinks it).
    pub fn set_max_process_size(&mut self, samples: usize) {
        if samples <= self.max_process_size {
            return;
        }
        self.max_process_size = samples;
        self.reconfigure();
    }

    /// Output latency in samples: zero offline, half a (pitch-compensated)
    /// window plus one in real-time mode.
    pub fn latency(&self) -> usize {
        if !self.realtime {
            return 0;
        }
        ((self.window_size / 2) as f64 / self.pitch_scale) as usize + 1
    }

    /// Replaces the transient handling policy. Real-time only.
    pub fn set_transients_option(&mut self, transients: TransientsOption) {
        if !self.realtime {
            warn!("the transients option can only be changed in real-time mode");
            return;
        }
        self.options.transients = transients;
        self.calculator
            .set_use_hard_peaks(transients != TransientsOption::Smooth);
    }

    /// Replaces the phase continuity policy.
    pub fn set_phase_option(&mut self, phase: PhaseOption) {
        self.options.phase = phase;
        for slot in &self.channel_slots {
            slot.lock().set_phase_option(phase);
        }
    }

    /// Frequency cutoff `n` (0, 1, or 2) in Hz, consumed by synthesis.
    pub fn frequency_cutoff(&self, n: usize) -> f32 {
        match n {
            0 => self.cutoffs.low,
            1 => self.cutoffs.mid,
            2 => self.cutoffs.high,
            _ => 0.0,
        }
    }

    /// Sets frequency cutoff `n` (0, 1, or 2) in Hz.
    pub fn set_frequency_cutoff(&mut self, n: usize, freq: f32) {
        match n {
            0 => self.cutoffs.low = freq,
            1 => self.cutoffs.mid = freq,
            2 => self.cutoffs.high = freq,
            _ => return,
        }
        for slot in &self.channel_slots {
            slot.lock().set_frequency_cutoffs(self.cutoffs);
        }
    }

    /// Sets the per-instance diagnostic verbosity (0 = quiet).
    pub fn set_debug_level(&mut self, level: u8) {
        self.debug_level = level;
    }

    #[inline]
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    #[inline]
    pub fn input_increment(&self) -> usize {
        self.increment
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Runs the study pass over a block of input. Offline only; the last
    /// block must pass `final_chunk = true`.
    ///
    /// Mixes the channels down to mono, appends one value per analysis chunk
    /// to the phase-reset and stretch curves, and accounts the exact input
    /// duration (the half-window prefill is deducted on the final block).
    pub fn study(&mut self, input: &[&[f32]], final_chunk: bool) {
        if self.realtime {
            if self.debug_level > 1 {
                debug!("study is not meaningful in real-time mode");
            }
            return;
        }
        if matches!(self.mode, Mode::Processing | Mode::Finished) {
            warn!("cannot study after processing has begun");
            return;
        }
        if input.len() < self.channels {
            warn!(
                "study: expected {} channels, got {}",
                self.channels,
                input.len()
            );
            return;
        }
        self.mode = Mode::Studying;

        let samples = input
            .iter()
            .take(self.channels)
            .map(|c| c.len())
            .min()
            .unwrap_or(0);

        // Mix down to a single channel for analysis: sum, then divide by the
        // channel count
        let mixdown_storage: Vec<f32>;
        let mixdown: &[f32] = if self.channels == 1 {
            &input[0][..samples]
        } else {
            let mut mix = input[0][..samples].to_vec();
            for channel in input.iter().take(self.channels).skip(1) {
                for (m, &s) in mix.iter_mut().zip(channel.iter()) {
                    *m += s;
                }
            }
            let scale = 1.0 / self.channels as f32;
            for m in mix.iter_mut() {
                *m *= scale;
            }
            mixdown_storage = mix;
            &mixdown_storage
        };

        let window_size = self.window_size;
        let increment = self.increment;
        let slot = self.channel_slots[0].clone();
        let mut ch = slot.lock();

        let mut consumed = 0usize;
        loop {
            // The half-window rule only applies once every sample of the
            // final block is in the ring; otherwise a chunk would be
            // zero-padded with data still to come
            let tail = final_chunk && consumed >= samples;
            while ch.input_buffered() >= window_size
                || (tail && ch.input_buffered() >= window_size / 2)
            {
                ch.analyse_magnitude();
                let df = self.percussive_curve.process(ch.magnitudes(), increment);
                self.phase_reset_df.push(df);
                let sdf = match self.stretch_curve.as_mut() {
                    Some(curve) => curve.process(ch.magnitudes(), increment),
                    None => 1.0,
                };
                self.stretch_df.push(sdf);

                // The ring was prefilled with half a window so the first
                // chunk is centred on sample zero; the totals are corrected
                // for that on the final block
                self.input_duration += increment as u64;
                ch.input_skip(increment);
            }

            if consumed >= samples {
                if tail || !final_chunk {
                    break;
                }
                continue;
            }
            let written = ch.write(&mixdown[consumed..samples]);
            if written == 0 {
                warn!("study: no space in the analysis ring; dropping remaining input");
                break;
            }
            consumed += written;
        }

        if final_chunk {
            self.input_duration += ch.input_buffered() as u64;
            let prefill = (window_size / 2) as u64;
            self.input_duration = self.input_duration.saturating_sub(prefill);
        }
    }

    /// Converts the curves studied so far into output increments, appending
    /// to the running schedule.
    fn calculate_stretch(&mut self) {
        let increments = self.calculator.calculate(
            self.effective_ratio(),
            self.input_duration,
            &self.phase_reset_df,
            &self.stretch_df,
        );
        self.output_increments.extend(increments);
    }

    /// The minimum further input, per channel, that would let at least one
    /// blocked channel form another analysis chunk.
    pub fn samples_required(&self) -> usize {
        let mut required = 0usize;
        for slot in &self.channel_slots {
            let ch = slot.lock();
            let buffered = ch.input_buffered();
            if buffered < self.window_size && !ch.is_draining() {
                if !ch.input_closed() {
                    required = required.max(self.window_size - buffered);
                } else if buffered == 0 {
                    required = required.max(self.window_size);
                }
            }
        }
        required
    }

    /// Feeds a block of input (all channels) through processing. The last
    /// block must pass `final_chunk = true`; afterwards further calls are
    /// rejected.
    pub fn process(&mut self, input: &[&[f32]], final_chunk: bool) {
        if self.mode == Mode::Finished {
            warn!("cannot process again after the final block");
            return;
        }
        if input.len() < self.channels {
            warn!(
                "process: expected {} channels, got {}",
                self.channels,
                input.len()
            );
            return;
        }

        if matches!(self.mode, Mode::JustCreated | Mode::Studying) {
            self.begin_processing();
        }

        let samples = input
            .iter()
            .take(self.channels)
            .map(|c| c.len())
            .min()
            .unwrap_or(0);

        let mut consumed = vec![0usize; self.channels];
        let mut final_marked = vec![false; self.channels];
        let mut stalled = 0usize;

        loop {
            let mut all_consumed = true;
            let mut progress = false;

            for c in 0..self.channels {
                let slot = self.channel_slots[c].clone();
                let mut ch = slot.lock();
                let written = ch.write(&input[c][consumed[c]..samples]);
                if written > 0 {
                    progress = true;
                }
                consumed[c] += written;
                if consumed[c] < samples {
                    all_consumed = false;
                } else if final_chunk && !final_marked[c] {
                    ch.mark_input_final();
                    final_marked[c] = true;
                }

                if !self.threaded && !self.realtime && ch.process_available() > 0 {
                    progress = true;
                }
            }

            if self.realtime {
                while self.process_one_chunk() {
                    progress = true;
                }
            }

            if self.threaded {
                self.signal_data_available();
                if !all_consumed {
                    let mut guard = self.shared.space_mutex.lock();
                    self.shared
                        .space_available
                        .wait_for(&mut guard, SPACE_WAIT);
                }
            }

            if all_consumed {
                break;
            }
            stalled = if progress { 0 } else { stalled + 1 };
            if !self.threaded && stalled >= 2 {
                // Backpressure: observable as lack of forward progress; the
                // caller should retrieve and retry
                warn!(
                    "process: no forward progress; drain output with retrieve() and resubmit \
                     the unconsumed input"
                );
                break;
            }
            if self.threaded && stalled >= STALL_LIMIT {
                warn!("process: workers made no progress for too long; giving up on this block");
                break;
            }
        }

        if final_chunk {
            if self.threaded {
                self.wait_for_workers_to_drain();
                self.stop_workers();
            }
            self.mode = Mode::Finished;
        }
    }

    /// Transition into processing: resolve the schedule, reset channels
    /// (with the half-window prefill), and start workers when threaded.
    fn begin_processing(&mut self) {
        // From the studying state this resolves the studied curves; from
        // just-created it appends an empty schedule and processing falls
        // back to the nominal hop
        if !self.realtime {
            self.calculate_stretch();
        }

        let schedule = Arc::new(self.output_increments.clone());
        let nominal = ((self.increment as f64 * self.effective_ratio()).round() as i32).max(1);
        for slot in &self.channel_slots {
            let mut ch = slot.lock();
            ch.reset();
            if self.realtime {
                // The offline prefill happens inside reset; real-time needs
                // it too so the first output is centred like the schedule
                // assumes
                ch.prefill_silence();
            }
            ch.set_schedule(schedule.clone(), nominal);
            ch.set_pitch_scale(self.pitch_scale);
        }

        if self.threaded {
            self.start_workers();
        }
        self.mode = Mode::Processing;
    }

    /// One cross-channel chunk in real-time mode: sum the channel spectra,
    /// derive one phase-reset value, get the next hop from the calculator,
    /// and synthesize every channel with that shared hop.
    fn process_one_chunk(&mut self) -> bool {
        for slot in &self.channel_slots {
            if !slot.lock().can_analyse() {
                return false;
            }
        }
        // Backpressure: every channel must be able to take a worst-case hop
        let worst_hop = (2.0 * self.increment as f64 * self.effective_ratio().max(1.0)
            / self.pitch_scale)
            .ceil() as usize
            + 8;
        for slot in &self.channel_slots {
            if slot.lock().output_headroom() < worst_hop {
                return false;
            }
        }

        let bins = self.window_size / 2 + 1;
        self.rt_mags.clear();
        self.rt_mags.resize(bins, 0.0);
        for slot in &self.channel_slots {
            let mut ch = slot.lock();
            ch.analyse_spectrum();
            for (sum, &m) in self.rt_mags.iter_mut().zip(ch.magnitudes().iter()) {
                *sum += m;
            }
        }

        let df = self.percussive_curve.process(&self.rt_mags, self.increment);
        let hop = self.calculator.calculate_single(self.effective_ratio(), df);

        for slot in &self.channel_slots {
            slot.lock().synthesise(hop);
        }

        push_bounded(&mut self.last_process_df.lock(), df);
        push_bounded(&mut self.last_process_increments.lock(), hop);
        true
    }

    /// Samples ready for `retrieve` on every channel.
    pub fn available(&self) -> usize {
        self.channel_slots
            .iter()
            .map(|slot| slot.lock().output_available())
            .min()
            .unwrap_or(0)
    }

    /// Drains up to `output[c].len()` samples per channel (the same count
    /// for every channel). Returns the number of samples written per
    /// channel.
    pub fn retrieve(&mut self, output: &mut [&mut [f32]]) -> usize {
        if output.len() < self.channels {
            warn!(
                "retrieve: expected {} channels, got {}",
                self.channels,
                output.len()
            );
            return 0;
        }
        let n = output
            .iter()
            .take(self.channels)
            .map(|c| c.len())
            .min()
            .unwrap_or(0)
            .min(self.available());
        if n == 0 {
            return 0;
        }
        for (c, out) in output.iter_mut().enumerate().take(self.channels) {
            let got = self.channel_slots[c].lock().read(&mut out[..n]);
            debug_assert_eq!(got, n);
        }
        n
    }

    /// The resolved output-hop schedule (offline), or the last few hops
    /// decided on the fly (real-time; draining).
    pub fn output_increments(&self) -> Vec<i32> {
        if !self.realtime {
            return self.output_increments.clone();
        }
        let mut ring = self.last_process_increments.lock();
        let mut out = Vec::with_capacity(ring.len());
        while let Some(v) = ring.pop() {
            out.push(v);
        }
        out
    }

    /// The studied phase-reset curve (offline), or the last few per-chunk
    /// values (real-time; draining).
    pub fn phase_reset_curve(&self) -> Vec<f32> {
        if !self.realtime {
            return self.phase_reset_df.clone();
        }
        let mut ring = self.last_process_df.lock();
        let mut out = Vec::with_capacity(ring.len());
        while let Some(v) = ring.pop() {
            out.push(v);
        }
        out
    }

    /// Chunk indices of the peaks resolved by the last stretch calculation.
    pub fn exact_time_points(&self) -> Vec<usize> {
        if self.realtime {
            return Vec::new();
        }
        self.calculator
            .last_calculated_peaks()
            .iter()
            .map(|p| p.chunk)
            .collect()
    }

    /// Captures the completed study pass for later reuse.
    ///
    /// Meaningful after `study(..., true)`; the artifact records the sizing
    /// so a mismatched reuse is rejected.
    pub fn study_artifact(&self) -> StudyArtifact {
        StudyArtifact {
            sample_rate: self.sample_rate,
            channels: self.channels,
            window_size: self.window_size,
            input_increment: self.increment,
            input_duration: self.input_duration,
            phase_reset_df: self.phase_reset_df.clone(),
            stretch_df: self.stretch_df.clone(),
        }
    }

    /// Installs a previously captured study pass instead of re-studying.
    ///
    /// Offline only, and only before processing begins. The artifact must
    /// have been captured at the same sample rate, channel count, and sizing.
    pub fn apply_study_artifact(&mut self, artifact: &StudyArtifact) -> Result<(), StretchError> {
        if self.realtime {
            return Err(StretchError::InvalidArtifact(
                "study artifacts only apply in offline mode".to_string(),
            ));
        }
        if matches!(self.mode, Mode::Processing | Mode::Finished) {
            return Err(StretchError::InvalidArtifact(
                "cannot apply a study artifact after processing has begun".to_string(),
            ));
        }
        if artifact.sample_rate != self.sample_rate
            || artifact.channels != self.channels
            || artifact.window_size != self.window_size
            || artifact.input_increment != self.increment
        {
            return Err(StretchError::InvalidArtifact(format!(
                "artifact captured at rate {}, {} ch, window {}, increment {}; this stretcher \
                 uses rate {}, {} ch, window {}, increment {}",
                artifact.sample_rate,
                artifact.channels,
                artifact.window_size,
                artifact.input_increment,
                self.sample_rate,
                self.channels,
                self.window_size,
                self.increment
            )));
        }
        if artifact.phase_reset_df.len() != artifact.stretch_df.len() {
            return Err(StretchError::InvalidArtifact(
                "artifact curves have mismatched lengths".to_string(),
            ));
        }
        self.phase_reset_df = artifact.phase_reset_df.clone();
        self.stretch_df = artifact.stretch_df.clone();
        self.input_duration = artifact.input_duration;
        self.mode = Mode::Studying;
        Ok(())
    }

    fn start_workers(&mut self) {
        self.shared.shutdown.store(false, Ordering::SeqCst);
        for slot in &self.channel_slots {
            let (sender, receiver) = bounded::<()>(4);
            let slot = slot.clone();
            let shared = self.shared.clone();
            let join = std::thread::spawn(move || worker_loop(slot, shared, receiver));
            self.workers.push(WorkerHandle {
                sender,
                join: Some(join),
            });
        }
    }

    fn signal_data_available(&self) {
        for worker in &self.workers {
            let _ = worker.sender.try_send(());
        }
    }

    /// Blocks (with the bounded wait) until every channel has consumed all
    /// the chunks it can form.
    fn wait_for_workers_to_drain(&self) {
        loop {
            self.signal_data_available();
            let done = self
                .channel_slots
                .iter()
                .all(|slot| !slot.lock().can_analyse());
            if done {
                return;
            }
            let mut guard = self.shared.space_mutex.lock();
            self.shared
                .space_available
                .wait_for(&mut guard, SPACE_WAIT);
        }
    }

    /// Deterministic worker shutdown: raise the stop flag, close the token
    /// channels, join every thread.
    fn stop_workers(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let workers = std::mem::take(&mut self.workers);
        for mut worker in workers {
            drop(worker.sender);
            if let Some(join) = worker.join.take() {
                let _ = join.join();
            }
        }
        self.shared.shutdown.store(false, Ordering::SeqCst);
    }
}

impl Drop for Stretcher {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

impl std::fmt::Debug for Stretcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stretcher")
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("time_ratio", &self.time_ratio)
            .field("pitch_scale", &self.pitch_scale)
            .field("realtime", &self.realtime)
            .field("threaded", &self.threaded)
            .field("window_size", &self.window_size)
            .field("increment", &self.increment)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Keeps the newest values, discarding the oldest once full.
fn push_bounded<T: Copy + Default>(ring: &mut RingBuffer<T>, value: T) {
    if ring.available() == 0 {
        ring.pop();
    }
    ring.push(value);
}

fn worker_loop(
    slot: Arc<Mutex<ChannelProcessor>>,
    shared: Arc<WorkerShared>,
    receiver: Receiver<()>,
) {
    loop {
        match receiver.recv_timeout(WORKER_POLL) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        if slot.lock().process_available() > 0 {
            shared.space_available.notify_all();
        }
    }
    // Senders dropped without the stop flag: finish outstanding work so a
    // final block is fully processed before the thread exits
    if !shared.shutdown.load(Ordering::SeqCst) {
        slot.lock().process_available();
        shared.space_available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn sine(freq: f32, sample_rate: u32, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (2.0 * PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn test_offline_latency_is_zero() {
        let s = Stretcher::new(44100, 1, StretcherOptions::offline(), 1.0, 1.0);
        assert_eq!(s.latency(), 0);
    }

    #[test]
    fn test_realtime_latency_formula() {
        for &pitch in &[1.0f64, 2.0, 0.5] {
            let s = Stretcher::new(44100, 1, StretcherOptions::realtime(), 1.0, pitch);
            let expected = ((s.window_size() / 2) as f64 / pitch) as usize + 1;
            assert_eq!(s.latency(), expected, "pitch {}", pitch);
        }
    }

    #[test]
    fn test_conflicting_window_flags_fall_back_to_standard() {
        let standard = Stretcher::new(44100, 1, StretcherOptions::offline(), 1.0, 1.0);
        let conflicted = Stretcher::new(
            44100,
            1,
            StretcherOptions::offline().with_window_short().with_window_long(),
            1.0,
            1.0,
        );
        assert_eq!(conflicted.window_size(), standard.window_size());
    }

    #[test]
    fn test_window_flags_halve_and_double() {
        let standard = Stretcher::new(44100, 1, StretcherOptions::offline(), 1.0, 1.0);
        let short = Stretcher::new(
            44100,
            1,
            StretcherOptions::offline().with_window_short(),
            1.0,
            1.0,
        );
        let long = Stretcher::new(
            44100,
            1,
            StretcherOptions::offline().with_window_long(),
            1.0,
            1.0,
        );
        assert_eq!(short.window_size() * 2, standard.window_size());
        assert_eq!(long.window_size(), standard.window_size() * 2);
    }

    #[test]
    fn test_study_rejected_after_processing() {
        let mut s = Stretcher::new(44100, 1, StretcherOptions::offline(), 1.0, 1.0);
        let input = sine(440.0, 44100, 4096);
        s.study(&[&input], true);
        s.process(&[&input], true);
        let curve_len = s.phase_reset_curve().len();
        // A study call after processing is a logged no-op
        s.study(&[&input], true);
        assert_eq!(s.phase_reset_curve().len(), curve_len);
    }

    #[test]
    fn test_process_rejected_after_final() {
        let mut s = Stretcher::new(44100, 1, StretcherOptions::offline(), 1.0, 1.0);
        let input = sine(440.0, 44100, 4096);
        s.study(&[&input], true);
        s.process(&[&input], true);
        let mut drained = Vec::new();
        let mut buf = vec![0.0f32; 16384];
        loop {
            let got = s.retrieve(&mut [&mut buf[..]]);
            if got == 0 {
                break;
            }
            drained.extend_from_slice(&buf[..got]);
        }
        // Further process calls are logged no-ops
        s.process(&[&input], true);
        assert_eq!(s.available(), 0);
    }

    #[test]
    fn test_ratio_change_rejected_while_studying_offline() {
        let mut s = Stretcher::new(44100, 1, StretcherOptions::offline(), 1.0, 1.0);
        let input = sine(440.0, 44100, 8192);
        s.study(&[&input], false);
        s.set_time_ratio(2.0);
        // Rejected: the ratio is unchanged
        assert_eq!(s.time_ratio(), 1.0);
    }

    #[test]
    fn test_transients_option_rejected_offline() {
        let mut s = Stretcher::new(44100, 1, StretcherOptions::offline(), 1.0, 1.0);
        s.set_transients_option(TransientsOption::Smooth);
        // No way to observe the calculator directly; the call must simply
        // not panic and not change offline behaviour. Smoke check only.
        let _ = s;
    }

    #[test]
    fn test_samples_required_before_input() {
        let s = Stretcher::new(44100, 1, StretcherOptions::realtime(), 1.0, 1.0);
        assert_eq!(s.samples_required(), s.window_size());
    }

    #[test]
    fn test_curve_lengths_match_after_study() {
        let mut s = Stretcher::new(44100, 1, StretcherOptions::offline(), 2.0, 1.0);
        let input = sine(440.0, 44100, 44100);
        s.study(&[&input], true);
        s.process(&[&input], true);
        let increments = s.output_increments();
        let curve = s.phase_reset_curve();
        assert_eq!(increments.len(), curve.len());
        assert!(!increments.is_empty());
    }

    #[test]
    fn test_realtime_introspection_rings_fill() {
        let mut s = Stretcher::new(44100, 1, StretcherOptions::realtime(), 1.0, 1.0);
        let input = sine(440.0, 44100, 8192);
        for block in input.chunks(512) {
            s.process(&[block], false);
            let mut buf = vec![0.0f32; 4096];
            let _ = s.retrieve(&mut [&mut buf[..]]);
        }
        let hops = s.output_increments();
        assert!(!hops.is_empty());
        assert!(hops.len() <= INTROSPECTION_CAPACITY);
        assert!(hops.iter().all(|&h| h != 0));
    }

    #[test]
    fn test_reset_returns_to_initial_state() {
        let mut s = Stretcher::new(44100, 1, StretcherOptions::offline(), 1.5, 1.0);
        let input = sine(440.0, 44100, 16384);
        s.study(&[&input], true);
        s.process(&[&input], true);
        s.reset();
        assert_eq!(s.available(), 0);
        assert!(s.output_increments().is_empty());
        assert!(s.phase_reset_curve().is_empty());
        // The stretcher is usable again
        s.study(&[&input], true);
        s.process(&[&input], true);
        assert!(s.available() > 0);
    }
}
