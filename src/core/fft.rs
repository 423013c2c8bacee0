//! FFT plumbing shared by the study pass and per-channel synthesis.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// Zero-valued complex number, used for FFT buffer initialization.
pub const COMPLEX_ZERO: Complex<f32> = Complex::new(0.0, 0.0);

/// Minimum window sum (as a fraction of max) to prevent amplification
/// in low-overlap regions during overlap-add normalization.
pub const WINDOW_SUM_FLOOR_RATIO: f32 = 0.1;

/// Absolute floor for window sum normalization to prevent division by zero.
pub const WINDOW_SUM_EPSILON: f32 = 1e-6;

/// Forward/inverse FFT pair with reusable buffers for one transform size.
///
/// Works on real signals: the forward direction produces the magnitude (and
/// optionally phase) of the `size/2 + 1` non-negative-frequency bins, and the
/// inverse direction reconstructs a real signal from a half spectrum by
/// mirroring the conjugate upper half.
pub struct SpectrumFft {
    size: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    buf: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl SpectrumFft {
    /// Plans transforms for the given size. Panics if the planner fails,
    /// which is treated as fatal.
    pub fn new(planner: &mut FftPlanner<f32>, size: usize) -> Self {
        let forward = planner.plan_fft_forward(size);
        let inverse = planner.plan_fft_inverse(size);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());
        Self {
            size,
            forward,
            inverse,
            buf: vec![COMPLEX_ZERO; size],
            scratch: vec![COMPLEX_ZERO; scratch_len],
        }
    }

    /// Returns the transform size.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the number of non-negative-frequency bins (`size/2 + 1`).
    #[inline]
    pub fn num_bins(&self) -> usize {
        self.size / 2 + 1
    }

    /// Forward transform of a real signal, writing bin magnitudes.
    ///
    /// `time` may be shorter than the transform size; the remainder is
    /// zero-padded.
    pub fn forward_magnitude(&mut self, time: &[f32], mags: &mut [f32]) {
        self.load_real(time);
        self.forward
            .process_with_scratch(&mut self.buf, &mut self.scratch);
        let bins = self.num_bins().min(mags.len());
        for (bin, m) in mags.iter_mut().take(bins).enumerate() {
            *m = self.buf[bin].norm();
        }
    }

    /// Forward transform of a real signal, writing bin magnitudes and phases.
    pub fn forward_polar(&mut self, time: &[f32], mags: &mut [f32], phases: &mut [f32]) {
        self.load_real(time);
        self.forward
            .process_with_scratch(&mut self.buf, &mut self.scratch);
        let bins = self.num_bins().min(mags.len()).min(phases.len());
        for bin in 0..bins {
            let c = self.buf[bin];
            mags[bin] = c.norm();
            phases[bin] = c.arg();
        }
    }

    /// Inverse transform from a half spectrum in polar form.
    ///
    /// Reconstructs the conjugate-symmetric full spectrum, then writes the
    /// real part of the inverse transform (scaled by `1/size`) into `time`.
    pub fn inverse_polar(&mut self, mags: &[f32], phases: &[f32], time: &mut [f32]) {
        let bins = self.num_bins();
        for bin in 0..bins {
            let (sin, cos) = phases[bin].sin_cos();
            self.buf[bin] = Complex::new(mags[bin] * cos, mags[bin] * sin);
        }
        for bin in bins..self.size {
            self.buf[bin] = self.buf[self.size - bin].conj();
        }
        self.inverse
            .process_with_scratch(&mut self.buf, &mut self.scratch);
        let scale = 1.0 / self.size as f32;
        for (i, t) in time.iter_mut().take(self.size).enumerate() {
            *t = self.buf[i].re * scale;
        }
    }

    fn load_real(&mut self, time: &[f32]) {
        let n = time.len().min(self.size);
        for (i, &s) in time.iter().take(n).enumerate() {
            self.buf[i] = Complex::new(s, 0.0);
        }
        for c in self.buf.iter_mut().skip(n) {
            *c = COMPLEX_ZERO;
        }
    }
}

impl std::fmt::Debug for SpectrumFft {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectrumFft")
            .field("size", &self.size)
            .finish()
    }
}
