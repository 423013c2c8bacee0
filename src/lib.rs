#![forbid(unsafe_code)]
//! Phase-vocoder audio time stretching and pitch shifting.
//!
//! `timepitch` changes the duration and/or pitch of multichannel PCM audio
//! while preserving transients and avoiding phasiness. Offline use is
//! two-pass: a study pass scans the whole input and extracts onset curves,
//! then a stretch calculator plans variable output hops so transients stay
//! crisp and stretch accumulates in the regions that tolerate it. Real-time
//! use is single-pass, deciding each chunk on the fly.
//!
//! # Quick Start
//!
//! ```
//! use timepitch::{stretch_offline, StretcherOptions};
//!
//! // 1 second of 440 Hz sine at 44.1 kHz
//! let input: Vec<f32> = (0..44100)
//!     .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 44100.0).sin())
//!     .collect();
//!
//! let output = stretch_offline(
//!     &[input],
//!     44100,
//!     1.5, // 50% longer
//!     1.0, // same pitch
//!     StretcherOptions::offline(),
//! )
//! .unwrap();
//! assert!(output[0].len() > 44100);
//! ```
//!
//! # Streaming
//!
//! For block-by-block use, drive a [`Stretcher`] directly:
//!
//! ```
//! use timepitch::{Stretcher, StretcherOptions};
//!
//! let mut stretcher = Stretcher::new(44100, 1, StretcherOptions::realtime(), 1.2, 1.0);
//! let block = vec![0.0f32; 512];
//! stretcher.process(&[&block], false);
//! let mut out = vec![0.0f32; 2048];
//! let got = stretcher.retrieve(&mut [&mut out[..]]);
//! assert!(got <= 2048);
//! ```

pub mod analysis;
pub mod core;
pub mod error;
pub mod stream;
pub mod stretch;

pub use crate::core::types::{
    PhaseOption, ProcessMode, Sample, StretchProfile, StretcherOptions, ThreadingOption,
    TransientsOption,
};
pub use analysis::artifact::StudyArtifact;
pub use error::StretchError;
pub use stream::Stretcher;

/// Block size used by the one-shot helpers when feeding a stretcher.
const ONE_SHOT_BLOCK: usize = 8192;

/// Stretches planar audio offline in one call.
///
/// Runs the full two-pass cycle: study, process, drain. `input` holds one
/// `Vec<f32>` per channel; all channels are truncated to the shortest.
/// `time_ratio` scales duration, `pitch_scale` scales frequency, and both
/// must lie in `0.01..=100.0`.
///
/// # Errors
///
/// Returns [`StretchError::InvalidRatio`] when either ratio is out of range.
///
/// # Example
///
/// ```
/// use timepitch::{stretch_offline, StretcherOptions};
///
/// let input: Vec<f32> = (0..22050)
///     .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 44100.0).sin())
///     .collect();
/// let output = stretch_offline(&[input], 44100, 2.0, 1.0, StretcherOptions::offline()).unwrap();
/// assert!(!output[0].is_empty());
/// ```
pub fn stretch_offline(
    input: &[Vec<f32>],
    sample_rate: u32,
    time_ratio: f64,
    pitch_scale: f64,
    options: StretcherOptions,
) -> Result<Vec<Vec<f32>>, StretchError> {
    if !(0.01..=100.0).contains(&time_ratio) {
        return Err(StretchError::InvalidRatio(format!(
            "time ratio must be between 0.01 and 100.0, got {}",
            time_ratio
        )));
    }
    if !(0.01..=100.0).contains(&pitch_scale) {
        return Err(StretchError::InvalidRatio(format!(
            "pitch scale must be between 0.01 and 100.0, got {}",
            pitch_scale
        )));
    }

    let channels = input.len();
    if channels == 0 {
        return Ok(Vec::new());
    }
    let samples = input.iter().map(|c| c.len()).min().unwrap_or(0);

    let mut stretcher = Stretcher::new(sample_rate, channels, options, time_ratio, pitch_scale);
    stretcher.set_expected_input_duration(samples as u64);
    stretcher.set_max_process_size(ONE_SHOT_BLOCK);

    let mut output: Vec<Vec<f32>> = vec![Vec::new(); channels];
    if samples == 0 {
        return Ok(output);
    }

    // Study pass
    let mut pos = 0usize;
    while pos < samples {
        let end = (pos + ONE_SHOT_BLOCK).min(samples);
        let refs: Vec<&[f32]> = input.iter().map(|c| &c[pos..end]).collect();
        stretcher.study(&refs, end == samples);
        pos = end;
    }

    // Process pass, draining as we go
    pos = 0;
    while pos < samples {
        let end = (pos + ONE_SHOT_BLOCK).min(samples);
        let refs: Vec<&[f32]> = input.iter().map(|c| &c[pos..end]).collect();
        stretcher.process(&refs, end == samples);
        drain_available(&mut stretcher, &mut output);
        pos = end;
    }
    drain_available(&mut stretcher, &mut output);

    Ok(output)
}

/// Shifts pitch without changing duration: a convenience over
/// [`stretch_offline`] with a unity time ratio.
///
/// `pitch_factor` > 1.0 raises the pitch (2.0 is one octave up).
///
/// # Errors
///
/// Returns [`StretchError::InvalidRatio`] when the factor is out of range.
pub fn pitch_shift_offline(
    input: &[Vec<f32>],
    sample_rate: u32,
    pitch_factor: f64,
    options: StretcherOptions,
) -> Result<Vec<Vec<f32>>, StretchError> {
    stretch_offline(input, sample_rate, 1.0, pitch_factor, options)
}

fn drain_available(stretcher: &mut Stretcher, output: &mut [Vec<f32>]) {
    loop {
        let available = stretcher.available();
        if available == 0 {
            return;
        }
        let channels = output.len();
        let mut bufs: Vec<Vec<f32>> = vec![vec![0.0; available]; channels];
        let mut refs: Vec<&mut [f32]> = bufs.iter_mut().map(|b| b.as_mut_slice()).collect();
        let got = stretcher.retrieve(&mut refs);
        if got == 0 {
            return;
        }
        for (out, buf) in output.iter_mut().zip(bufs.iter()) {
            out.extend_from_slice(&buf[..got]);
        }
    }
}
