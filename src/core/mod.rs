//! Core DSP support: FFT plumbing, windows, ring buffers, resampling, types.

pub mod fft;
pub mod resample;
pub mod ring_buffer;
pub mod types;
pub mod window;
