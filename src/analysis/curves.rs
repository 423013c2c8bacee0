//! Onset/difference curves computed over magnitude spectra during analysis.
//!
//! Two curves drive the stretch schedule: a percussive curve whose peaks
//! mark phase-reset (transient) chunks, and a stretch-weight curve that says
//! how much stretching a chunk can absorb. All variants share the same
//! capability set: `process`, `reset`, `set_window_size`.

/// Magnitude rise treated as significant by the percussive detector (+3 dB).
const PERCUSSIVE_RISE_RATIO: f32 = 1.413_5;
/// Magnitudes at or below this are treated as silence.
const SILENCE_THRESHOLD: f32 = 1e-6;

/// Tagged sum over the three curve variants.
#[derive(Debug, Clone)]
pub enum AudioCurve {
    Percussive(PercussiveCurve),
    HighFrequency(HighFrequencyCurve),
    Constant(ConstantCurve),
}

impl AudioCurve {
    /// Percussive onset detector for the given window size.
    pub fn percussive(window_size: usize) -> Self {
        AudioCurve::Percussive(PercussiveCurve::new(window_size))
    }

    /// High-frequency-weighted stretch curve.
    pub fn high_frequency(window_size: usize) -> Self {
        AudioCurve::HighFrequency(HighFrequencyCurve::new(window_size))
    }

    /// Constant stretch curve (uniform distribution).
    pub fn constant() -> Self {
        AudioCurve::Constant(ConstantCurve)
    }

    /// Computes the curve value for one chunk's magnitude spectrum.
    pub fn process(&mut self, mags: &[f32], increment: usize) -> f32 {
        match self {
            AudioCurve::Percussive(c) => c.process(mags, increment),
            AudioCurve::HighFrequency(c) => c.process(mags, increment),
            AudioCurve::Constant(c) => c.process(mags, increment),
        }
    }

    /// Clears internal history.
    pub fn reset(&mut self) {
        match self {
            AudioCurve::Percussive(c) => c.reset(),
            AudioCurve::HighFrequency(_) | AudioCurve::Constant(_) => {}
        }
    }

    /// Adapts the curve to a new analysis window size, invalidating history.
    pub fn set_window_size(&mut self, window_size: usize) {
        match self {
            AudioCurve::Percussive(c) => c.set_window_size(window_size),
            AudioCurve::HighFrequency(c) => c.set_window_size(window_size),
            AudioCurve::Constant(_) => {}
        }
    }
}

/// Detects sudden broadband energy increase.
///
/// The value is the fraction of bins whose magnitude rose by 3 dB or more
/// since the previous chunk: near 1.0 when a transient enters the window,
/// near 0.0 during steady or tonal passages.
#[derive(Debug, Clone)]
pub struct PercussiveCurve {
    prev_mags: Vec<f32>,
}

impl PercussiveCurve {
    pub fn new(window_size: usize) -> Self {
        Self {
            prev_mags: vec![0.0; window_size / 2 + 1],
        }
    }

    pub fn process(&mut self, mags: &[f32], _increment: usize) -> f32 {
        let bins = mags.len().min(self.prev_mags.len());
        if bins < 2 {
            return 0.0;
        }
        let mut count = 0usize;
        for bin in 1..bins {
            let prev = self.prev_mags[bin];
            let cur = mags[bin];
            let rising = if prev <= SILENCE_THRESHOLD {
                cur > SILENCE_THRESHOLD
            } else {
                cur / prev >= PERCUSSIVE_RISE_RATIO
            };
            if rising {
                count += 1;
            }
            self.prev_mags[bin] = cur;
        }
        count as f32 / (bins - 1) as f32
    }

    pub fn reset(&mut self) {
        self.prev_mags.fill(0.0);
    }

    pub fn set_window_size(&mut self, window_size: usize) {
        self.prev_mags = vec![0.0; window_size / 2 + 1];
    }
}

/// Emphasizes upper-spectrum energy.
///
/// Tonal, steady material concentrated in the low bins scores low and
/// therefore accumulates more stretch; bright, busy material scores high.
#[derive(Debug, Clone)]
pub struct HighFrequencyCurve {
    num_bins: usize,
}

impl HighFrequencyCurve {
    pub fn new(window_size: usize) -> Self {
        Self {
            num_bins: window_size / 2 + 1,
        }
    }

    pub fn process(&mut self, mags: &[f32], _increment: usize) -> f32 {
        let bins = mags.len().min(self.num_bins);
        if bins == 0 {
            return 0.0;
        }
        let mut sum = 0.0f64;
        for (bin, &m) in mags.iter().take(bins).enumerate() {
            sum += m as f64 * bin as f64;
        }
        (sum / bins as f64) as f32
    }

    pub fn set_window_size(&mut self, window_size: usize) {
        self.num_bins = window_size / 2 + 1;
    }
}

/// Returns 1.0 for every chunk so stretch is distributed uniformly.
#[derive(Debug, Clone)]
pub struct ConstantCurve;

impl ConstantCurve {
    pub fn process(&mut self, _mags: &[f32], _increment: usize) -> f32 {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percussive_rises_on_transient() {
        let mut curve = AudioCurve::percussive(64);
        let quiet = vec![0.001; 33];
        let loud = vec![1.0; 33];

        let df_silence = curve.process(&vec![0.0; 33], 16);
        assert_eq!(df_silence, 0.0);

        curve.process(&quiet, 16);
        let df_onset = curve.process(&loud, 16);
        assert!(df_onset > 0.9, "broadband jump should peg the curve: {}", df_onset);

        let df_steady = curve.process(&loud, 16);
        assert!(df_steady < 0.1, "steady state should be quiet: {}", df_steady);
    }

    #[test]
    fn test_percussive_reset_clears_history() {
        let mut curve = AudioCurve::percussive(64);
        let loud = vec![1.0; 33];
        curve.process(&loud, 16);
        curve.reset();
        // After reset the same spectrum reads as an onset again
        let df = curve.process(&loud, 16);
        assert!(df > 0.9);
    }

    #[test]
    fn test_high_frequency_prefers_bright_spectra() {
        let mut curve = AudioCurve::high_frequency(64);
        let mut low = vec![0.0; 33];
        low[2] = 1.0;
        let mut high = vec![0.0; 33];
        high[30] = 1.0;

        let df_low = curve.process(&low, 16);
        let df_high = curve.process(&high, 16);
        assert!(df_high > df_low);
    }

    #[test]
    fn test_constant_is_constant() {
        let mut curve = AudioCurve::constant();
        assert_eq!(curve.process(&[0.0; 33], 16), 1.0);
        assert_eq!(curve.process(&[5.0; 33], 512), 1.0);
    }

    #[test]
    fn test_set_window_size_invalidates_history() {
        let mut curve = AudioCurve::percussive(64);
        curve.process(&vec![1.0; 33], 16);
        curve.set_window_size(128);
        let df = curve.process(&vec![1.0; 65], 16);
        assert!(df > 0.9);
    }
}
