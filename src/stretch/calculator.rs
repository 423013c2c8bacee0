//! Converts onset curves and a target ratio into a schedule of output hops.
//!
//! Offline, [`StretchCalculator::calculate`] turns the two study curves into
//! one output increment per chunk: hard peaks become phase-reset chunks that
//! copy through at rate 1, and the output between peaks is distributed in
//! proportion to the stretch-weight curve so the realized duration matches
//! `round(input_duration * ratio)` and transients land at their scaled
//! positions. In real-time mode [`StretchCalculator::calculate_single`]
//! makes the same decision one chunk at a time from running statistics.

/// Minimum spacing between detected transients, in seconds.
const MIN_PEAK_SPACING_SECS: f64 = 0.03;
/// Scale applied to the mean absolute deviation when thresholding peaks.
const PEAK_THRESHOLD_DEVIATIONS: f32 = 1.25;
/// Peaks must also clear this fraction of the curve maximum, which keeps
/// numeric jitter in near-silent material from reading as transients.
const PEAK_FLOOR_RATIO: f32 = 0.1;
/// EMA coefficient for the real-time flux statistics.
const SINGLE_EMA_ALPHA: f64 = 0.2;
/// Sigma multiplier for the real-time transient threshold.
const SINGLE_THRESHOLD_SIGMA: f64 = 2.5;
/// Absolute floor below which real-time df values never trigger.
const SINGLE_ABS_MIN: f64 = 0.01;
/// Chunks observed before the real-time detector may trigger.
const SINGLE_WARMUP_CHUNKS: usize = 3;

/// A resolved peak in the phase-reset curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peak {
    /// Chunk index the peak resolved to.
    pub chunk: usize,
    /// Hard peaks force a phase reset; soft peaks only bias weighting.
    pub hard: bool,
}

/// Stretch schedule calculator.
#[derive(Debug, Clone)]
pub struct StretchCalculator {
    sample_rate: u32,
    increment: usize,
    use_hard_peaks: bool,
    last_peaks: Vec<Peak>,
    // Running state for the single-chunk (real-time) path.
    df_mean: f64,
    df_dev: f64,
    df_chunks: usize,
    cooldown: usize,
    ideal_output: f64,
    emitted_output: i64,
}

impl StretchCalculator {
    pub fn new(sample_rate: u32, increment: usize, use_hard_peaks: bool) -> Self {
        Self {
            sample_rate,
            increment: increment.max(1),
            use_hard_peaks,
            last_peaks: Vec::new(),
            df_mean: 0.0,
            df_dev: 0.0,
            df_chunks: 0,
            cooldown: 0,
            ideal_output: 0.0,
            emitted_output: 0,
        }
    }

    /// Enables or disables hard phase-reset peaks (the transients-smooth
    /// option disables them).
    pub fn set_use_hard_peaks(&mut self, use_hard_peaks: bool) {
        self.use_hard_peaks = use_hard_peaks;
    }

    /// Peaks resolved by the most recent `calculate` call.
    pub fn last_calculated_peaks(&self) -> &[Peak] {
        &self.last_peaks
    }

    /// Clears peaks and all running real-time state.
    pub fn reset(&mut self) {
        self.last_peaks.clear();
        self.df_mean = 0.0;
        self.df_dev = 0.0;
        self.df_chunks = 0;
        self.cooldown = 0;
        self.ideal_output = 0.0;
        self.emitted_output = 0;
    }

    /// Minimum transient spacing in chunks at the current increment.
    fn min_peak_spacing_chunks(&self) -> usize {
        ((self.sample_rate as f64 * MIN_PEAK_SPACING_SECS / self.increment as f64) as usize).max(1)
    }

    /// Nominal (unweighted) output hop for the given ratio.
    fn nominal_increment(&self, ratio: f64) -> i64 {
        ((self.increment as f64 * ratio).round() as i64).max(1)
    }

    /// Produces one output increment per chunk.
    ///
    /// Negative values mark phase-reset chunks; their magnitude is the
    /// synthesis hop. The sum of absolute values is `round(input_duration *
    /// ratio)` except when the per-chunk clamp makes that total unreachable.
    /// Deterministic for identical inputs.
    pub fn calculate(
        &mut self,
        ratio: f64,
        input_duration: u64,
        phase_reset_df: &[f32],
        stretch_df: &[f32],
    ) -> Vec<i32> {
        let n = phase_reset_df.len().min(stretch_df.len());
        self.last_peaks.clear();
        if n == 0 {
            return Vec::new();
        }

        let total_target = (input_duration as f64 * ratio).round() as i64;
        let nominal = self.nominal_increment(ratio);

        let peak_chunks = self.find_peaks(phase_reset_df);
        let hard = self.use_hard_peaks;
        self.last_peaks = peak_chunks
            .iter()
            .map(|&chunk| Peak { chunk, hard })
            .collect();

        let mut increments = vec![0i32; n];
        let mut emitted: i64 = 0;
        let mut region_start = 0usize;

        let hard_peaks: &[usize] = if self.use_hard_peaks {
            &peak_chunks
        } else {
            &[]
        };

        for (i, &peak) in hard_peaks.iter().chain(std::iter::once(&n)).enumerate() {
            let at_end = i == hard_peaks.len();
            let peak = peak.min(n);

            // Output budget up to (not including) this boundary chunk: the
            // peak must land at its scaled input position.
            let region_target = if at_end {
                total_target
            } else {
                ((peak as u64 * self.increment as u64) as f64 * ratio).round() as i64
            };
            let budget = region_target - emitted;
            emitted += distribute(
                &mut increments[region_start..peak],
                &stretch_df[region_start..peak],
                budget,
                nominal,
            );

            if !at_end {
                // Copy through at rate 1 around the transient, with a reset.
                increments[peak] = -(self.increment as i32);
                emitted += self.increment as i64;
                region_start = peak + 1;
            }
        }

        // Copy-through peaks and per-chunk clamps can leave the grand total
        // off target (a trailing peak has no region after it to absorb the
        // difference); settle the residue on soft chunks with slack.
        let mut residue = total_target - emitted;
        while residue != 0 {
            let before = residue;
            for inc in increments.iter_mut() {
                if *inc < 0 {
                    continue;
                }
                if residue > 0 && (*inc as i64) < 2 * nominal {
                    *inc += 1;
                    residue -= 1;
                } else if residue < 0 && *inc > 1 {
                    *inc -= 1;
                    residue += 1;
                }
                if residue == 0 {
                    break;
                }
            }
            if residue == before {
                break;
            }
        }

        increments
    }

    /// Real-time single-chunk decision.
    ///
    /// Returns the output hop for the chunk whose phase-reset curve value is
    /// `df`; negative means "reset phases and copy through". Off-transient
    /// hops track the accumulated ideal output so the realized ratio
    /// converges back to `ratio` after each transient.
    pub fn calculate_single(&mut self, ratio: f64, df: f32) -> i32 {
        let df = df as f64;
        let nominal = self.nominal_increment(ratio);
        self.ideal_output += self.increment as f64 * ratio;

        let warmed = self.df_chunks >= SINGLE_WARMUP_CHUNKS;
        let threshold = self.df_mean + SINGLE_THRESHOLD_SIGMA * self.df_dev;
        let transient = warmed && self.cooldown == 0 && df > SINGLE_ABS_MIN && df > threshold;

        self.df_chunks += 1;
        self.df_mean += SINGLE_EMA_ALPHA * (df - self.df_mean);
        self.df_dev += SINGLE_EMA_ALPHA * ((df - self.df_mean).abs() - self.df_dev);

        if transient {
            self.cooldown = self.min_peak_spacing_chunks();
            self.emitted_output += self.increment as i64;
            return -(self.increment as i32);
        }
        if self.cooldown > 0 {
            self.cooldown -= 1;
        }

        let desired = self.ideal_output.round() as i64 - self.emitted_output;
        let hop = desired.clamp(1, 2 * nominal);
        self.emitted_output += hop;
        hop as i32
    }

    /// Finds transient chunks: values above an adaptive threshold that end a
    /// non-decreasing run (so a plateau resolves to its last chunk, which is
    /// where the transient reaches the window centre).
    fn find_peaks(&self, df: &[f32]) -> Vec<usize> {
        let n = df.len();
        if n < 2 {
            return Vec::new();
        }

        let mut sorted: Vec<f32> = df.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = sorted[n / 2];
        let mean_abs_dev = df.iter().map(|&x| (x - median).abs()).sum::<f32>() / n as f32;
        let max_df = sorted[n - 1];

        let threshold = (median + mean_abs_dev * PEAK_THRESHOLD_DEVIATIONS)
            .max(max_df * PEAK_FLOOR_RATIO);

        let min_gap = self.min_peak_spacing_chunks();
        let mut peaks = Vec::new();
        let mut last_peak: Option<usize> = None;

        for i in 0..n {
            if df[i] <= threshold {
                continue;
            }
            let rising = i == 0 || df[i] >= df[i - 1];
            let falling_next = i == n - 1 || df[i] > df[i + 1];
            if !(rising && falling_next) {
                continue;
            }
            if let Some(last) = last_peak {
                if i - last < min_gap {
                    continue;
                }
            }
            peaks.push(i);
            last_peak = Some(i);
        }

        peaks
    }
}

/// Distributes `budget` output samples across `increments` proportionally to
/// `weights`, each chunk clamped to `[1, 2 * nominal]`. Returns the total
/// actually assigned (equal to the clamped budget).
fn distribute(increments: &mut [i32], weights: &[f32], budget: i64, nominal: i64) -> i64 {
    let len = increments.len();
    if len == 0 {
        return 0;
    }
    let upper = 2 * nominal;
    let budget = budget.clamp(len as i64, len as i64 * upper);

    let w: Vec<f64> = weights
        .iter()
        .map(|&x| (x.max(0.0) as f64) + 1e-6)
        .collect();
    let total_w: f64 = w.iter().sum();

    // Cumulative rounding keeps per-chunk error under one sample.
    let mut cum_w = 0.0f64;
    let mut assigned: i64 = 0;
    for (i, inc) in increments.iter_mut().enumerate() {
        cum_w += w[i];
        let target_cum = (budget as f64 * cum_w / total_w).round() as i64;
        let hop = (target_cum - assigned).clamp(1, upper);
        *inc = hop as i32;
        assigned += hop;
    }

    // The clamps can leave a residue; settle it on chunks with slack.
    let mut residue = budget - assigned;
    while residue != 0 {
        let before = residue;
        for inc in increments.iter_mut() {
            if residue > 0 && (*inc as i64) < upper {
                *inc += 1;
                residue -= 1;
            } else if residue < 0 && *inc > 1 {
                *inc -= 1;
                residue += 1;
            }
            if residue == 0 {
                break;
            }
        }
        if residue == before {
            break;
        }
    }

    budget - residue
}
