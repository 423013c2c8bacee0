// Shared helpers; not every test binary uses every generator.
#![allow(dead_code)]

use std::f32::consts::PI;

use timepitch::{Stretcher, StretcherOptions};

pub fn gen_sine(freq_hz: f32, sample_rate: u32, n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| (2.0 * PI * freq_hz * i as f32 / sample_rate as f32).sin())
        .collect()
}

/// Deterministic white noise in [-amp, amp] (xorshift, no external RNG).
pub fn gen_noise(n: usize, amp: f32, seed: u64) -> Vec<f32> {
    let mut state = seed.max(1);
    (0..n)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let unit = (state >> 11) as f32 / (1u64 << 53) as f32;
            (unit * 2.0 - 1.0) * amp
        })
        .collect()
}

/// Silence with short broadband clicks at the given sample positions.
pub fn gen_click_train(n: usize, click_positions: &[usize]) -> Vec<f32> {
    let mut out = vec![0.0f32; n];
    for &p in click_positions {
        if p < n {
            out[p] += 0.9;
        }
        if p + 1 < n {
            out[p + 1] -= 0.6;
        }
        if p + 2 < n {
            out[p + 2] += 0.3;
        }
    }
    out
}

/// Single-frequency energy probe (Goertzel-style correlation).
pub fn energy_at_freq(signal: &[f32], sample_rate: u32, freq: f32) -> f64 {
    let n = signal.len();
    if n == 0 {
        return 0.0;
    }
    let two_pi = 2.0 * std::f64::consts::PI;
    let mut real = 0.0f64;
    let mut imag = 0.0f64;
    for (i, &s) in signal.iter().enumerate() {
        let angle = two_pi * freq as f64 * i as f64 / sample_rate as f64;
        real += s as f64 * angle.cos();
        imag += s as f64 * angle.sin();
    }
    (real * real + imag * imag) / n as f64
}

/// Scans a frequency grid and returns the strongest frequency in Hz.
pub fn dominant_frequency(signal: &[f32], sample_rate: u32, lo: f32, hi: f32, step: f32) -> f32 {
    let mut best_freq = lo;
    let mut best_energy = f64::MIN;
    let mut f = lo;
    while f <= hi {
        let e = energy_at_freq(signal, sample_rate, f);
        if e > best_energy {
            best_energy = e;
            best_freq = f;
        }
        f += step;
    }
    best_freq
}

/// Counts distinct click peaks: samples above `threshold_ratio * max`,
/// clustered with a minimum gap.
pub fn count_clicks(signal: &[f32], threshold_ratio: f32, min_gap: usize) -> Vec<usize> {
    let max = signal.iter().fold(0.0f32, |a, &b| a.max(b.abs()));
    if max <= 0.0 {
        return Vec::new();
    }
    let threshold = max * threshold_ratio;
    let mut positions = Vec::new();
    let mut i = 0usize;
    while i < signal.len() {
        if signal[i].abs() > threshold {
            // Find the strongest sample within the cluster window
            let end = (i + min_gap).min(signal.len());
            let mut peak = i;
            for j in i..end {
                if signal[j].abs() > signal[peak].abs() {
                    peak = j;
                }
            }
            positions.push(peak);
            i = end;
        } else {
            i += 1;
        }
    }
    positions
}

/// Drives the full offline cycle and returns the planar output, leaving the
/// stretcher available for introspection.
pub fn run_offline(
    stretcher: &mut Stretcher,
    input: &[Vec<f32>],
    block: usize,
) -> Vec<Vec<f32>> {
    let channels = input.len();
    let samples = input.iter().map(|c| c.len()).min().unwrap_or(0);
    let mut output: Vec<Vec<f32>> = vec![Vec::new(); channels];

    let mut pos = 0usize;
    while pos < samples {
        let end = (pos + block).min(samples);
        let refs: Vec<&[f32]> = input.iter().map(|c| &c[pos..end]).collect();
        stretcher.study(&refs, end == samples);
        pos = end;
    }

    pos = 0;
    while pos < samples {
        let end = (pos + block).min(samples);
        let refs: Vec<&[f32]> = input.iter().map(|c| &c[pos..end]).collect();
        stretcher.process(&refs, end == samples);
        drain(stretcher, &mut output);
        pos = end;
    }
    drain(stretcher, &mut output);
    output
}

pub fn drain(stretcher: &mut Stretcher, output: &mut [Vec<f32>]) {
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

/// Convenience: build, run, and return output for a mono input.
pub fn stretch_mono(
    input: &[f32],
    sample_rate: u32,
    time_ratio: f64,
    pitch_scale: f64,
    options: StretcherOptions,
) -> Vec<f32> {
    let mut stretcher = Stretcher::new(sample_rate, 1, options, time_ratio, pitch_scale);
    stretcher.set_expected_input_duration(input.len() as u64);
    let out = run_offline(&mut stretcher, &[input.to_vec()], 8192);
    out.into_iter().next().unwrap_or_default()
}
