//! Sample-rate conversion used to realize pitch shifts.
//!
//! The time stretcher runs at `timeRatio * pitchScale`; resampling by
//! `1 / pitchScale` afterwards undoes the extra time factor and leaves the
//! pitch change. The resampler keeps fractional phase and a short history
//! across blocks so per-chunk conversion is seamless.

/// 4-point Hermite interpolation at fractional position `frac` in [0, 1).
#[inline]
fn hermite(s0: f32, s1: f32, s2: f32, s3: f32, frac: f32) -> f32 {
    let c0 = s1;
    let c1 = 0.5 * (s2 - s0);
    let c2 = s0 - 2.5 * s1 + 2.0 * s2 - 0.5 * s3;
    let c3 = 0.5 * (s3 - s0) + 1.5 * (s1 - s2);
    ((c3 * frac + c2) * frac + c1) * frac + c0
}

/// Streaming Hermite resampler with continuous phase across blocks.
///
/// Feeding consecutive blocks produces the same stream as resampling the
/// concatenated input (minus a 2-sample lookahead held back at block edges).
#[derive(Debug, Clone)]
pub struct StreamResampler {
    buf: Vec<f32>,
    /// Read position within `buf`, in input samples.
    pos: f64,
}

impl StreamResampler {
    /// Creates a resampler. `capacity_hint` sizes the internal carry buffer.
    pub fn new(capacity_hint: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity_hint.max(16)),
            pos: 1.0,
        }
    }

    /// Clears carried history and phase.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.pos = 1.0;
    }

    /// Converts `input` at the given output/input rate ratio, appending to
    /// `output`. Returns the number of samples produced.
    ///
    /// `ratio` is output rate over input rate: a pitch scale of 2.0 is undone
    /// with `ratio = 0.5`.
    pub fn process(&mut self, input: &[f32], ratio: f64, output: &mut Vec<f32>) -> usize {
        if ratio <= 0.0 {
            return 0;
        }
        self.buf.extend_from_slice(input);
        let step = 1.0 / ratio;
        let produced_start = output.len();

        // Need idx-1 .. idx+2 around each read position.
        while self.buf.len() >= 4 && self.pos + 2.0 < self.buf.len() as f64 {
            let idx = self.pos as usize;
            let frac = (self.pos - idx as f64) as f32;
            let s0 = self.buf[idx - 1];
            let s1 = self.buf[idx];
            let s2 = self.buf[idx + 1];
            let s3 = self.buf[idx + 2];
            output.push(hermite(s0, s1, s2, s3, frac));
            self.pos += step;
        }

        // Drop consumed history, keeping one sample before the read position.
        let keep_from = (self.pos as usize).saturating_sub(1);
        if keep_from > 0 {
            self.buf.drain(..keep_from);
            self.pos -= keep_from as f64;
        }

        output.len() - produced_start
    }
}
