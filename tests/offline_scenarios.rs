//! End-to-end offline scenarios: identity, stretch, pitch shift, and
//! transient preservation.

mod common;

use common::*;
use timepitch::{Stretcher, StretcherOptions};

#[test]
fn identity_ratio_preserves_length_and_pitch() {
    // 10 ms of 1 kHz sine at 44.1 kHz, ratio 1.0
    let sample_rate = 44100;
    let input = gen_sine(1000.0, sample_rate, 441);

    let mut stretcher = Stretcher::new(sample_rate, 1, StretcherOptions::offline(), 1.0, 1.0);
    stretcher.set_expected_input_duration(441);
    let output = run_offline(&mut stretcher, &[input], 8192)
        .into_iter()
        .next()
        .unwrap();

    let drift = output.len() as i64 - 441;
    assert!(
        drift.abs() <= 256,
        "output length {} too far from input 441",
        output.len()
    );

    // Spectral content stays at 1 kHz
    let at_peak = energy_at_freq(&output, sample_rate, 1000.0);
    assert!(at_peak > energy_at_freq(&output, sample_rate, 500.0) * 2.0);
    assert!(at_peak > energy_at_freq(&output, sample_rate, 2000.0) * 2.0);
}

#[test]
fn double_stretch_noise_length_exact() {
    let sample_rate = 44100;
    let input = gen_noise(sample_rate as usize, 0.5, 0x5EED);

    let output = stretch_mono(&input, sample_rate, 2.0, 1.0, StretcherOptions::offline());

    assert!(
        (88100..=88300).contains(&output.len()),
        "output length {} outside [88100, 88300]",
        output.len()
    );

    // No silent gap longer than 1 ms away from the edges
    let one_ms = sample_rate as usize / 1000;
    let body = &output[2048..output.len() - 2048];
    for (i, window) in body.windows(one_ms).step_by(one_ms / 2).enumerate() {
        let peak = window.iter().fold(0.0f32, |a, &b| a.max(b.abs()));
        assert!(
            peak > 1e-4,
            "silent gap near sample {} of the output body",
            2048 + i * (one_ms / 2)
        );
    }
}

#[test]
fn pitch_scale_doubles_frequency_keeps_duration() {
    let sample_rate = 44100;
    let input = gen_sine(440.0, sample_rate, sample_rate as usize);

    let output = stretch_mono(&input, sample_rate, 1.0, 2.0, StretcherOptions::offline());

    let drift = output.len() as i64 - sample_rate as i64;
    assert!(
        drift.abs() <= 256,
        "duration drifted by {} samples",
        drift
    );

    // Probe the steady middle of the output
    let mid = &output[8192..output.len() - 8192];
    let dominant = dominant_frequency(mid, sample_rate, 600.0, 1200.0, 5.0);
    assert!(
        (870.0..=890.0).contains(&dominant),
        "dominant frequency {} Hz not near 880",
        dominant
    );
}

#[test]
fn half_ratio_click_train_preserves_transients() {
    let sample_rate = 44100u32;
    let n = 2 * sample_rate as usize;
    // Ten clicks, 0.2 s apart, away from the edges
    let click_positions: Vec<usize> =
        (0..10).map(|k| 4410 + k * 8820).collect();
    let input = gen_click_train(n, &click_positions);

    let mut stretcher = Stretcher::new(sample_rate, 1, StretcherOptions::offline(), 0.5, 1.0);
    stretcher.set_expected_input_duration(n as u64);
    let output = run_offline(&mut stretcher, &[input], 8192)
        .into_iter()
        .next()
        .unwrap();

    // Output duration ~1 s
    let drift = output.len() as i64 - sample_rate as i64;
    assert!(
        drift.abs() <= 2048,
        "output length {} too far from 1 s",
        output.len()
    );

    // Each input click survives as one output click at half its position
    let found = count_clicks(&output, 0.25, 3000);
    assert_eq!(
        found.len(),
        10,
        "expected 10 clicks in the output, found {:?}",
        found
    );
    // Clicks sit at their scaled positions plus the constant half-window
    // overlap-add delay; spacing between clicks is the tight check.
    for (click, &out_pos) in click_positions.iter().zip(found.iter()) {
        let expected = (*click as f64 * 0.5) as i64;
        let err = (out_pos as i64 - expected).abs();
        assert!(
            err <= 1600,
            "click at {} mapped to {}, expected near {}",
            click,
            out_pos,
            expected
        );
    }
    for pair in found.windows(2) {
        let spacing = pair[1] as i64 - pair[0] as i64;
        assert!(
            (spacing - 4410).abs() <= 600,
            "output click spacing {} too far from 4410",
            spacing
        );
    }

    // The calculator's resolved peaks line up with the click chunks
    let increment = stretcher.input_increment();
    let points = stretcher.exact_time_points();
    assert_eq!(
        points.len(),
        10,
        "expected 10 hard peaks, got {:?}",
        points
    );
    for (click, &chunk) in click_positions.iter().zip(points.iter()) {
        let expected_chunk = click / increment;
        let err = (chunk as i64 - expected_chunk as i64).abs();
        assert!(
            err <= 2,
            "peak chunk {} not within 2 of expected {}",
            chunk,
            expected_chunk
        );
    }

    // And the scheduled increments mark those chunks as phase resets
    let increments = stretcher.output_increments();
    for &chunk in &points {
        assert!(
            increments[chunk] < 0,
            "chunk {} should be a phase reset, got {}",
            chunk,
            increments[chunk]
        );
    }
}

#[test]
fn smooth_transients_disable_hard_resets() {
    use timepitch::TransientsOption;

    let sample_rate = 44100u32;
    let n = sample_rate as usize;
    let click_positions: Vec<usize> = (0..5).map(|k| 4410 + k * 8820).collect();
    let input = gen_click_train(n, &click_positions);

    let options = StretcherOptions::offline().with_transients(TransientsOption::Smooth);
    let mut stretcher = Stretcher::new(sample_rate, 1, options, 2.0, 1.0);
    stretcher.set_expected_input_duration(n as u64);
    let _ = run_offline(&mut stretcher, &[input], 8192);

    let increments = stretcher.output_increments();
    assert!(!increments.is_empty());
    assert!(
        increments.iter().all(|&x| x > 0),
        "smooth mode must not emit phase resets"
    );
}

#[test]
fn elastic_and_precise_profiles_hit_the_same_length() {
    use timepitch::StretchProfile;

    let sample_rate = 44100;
    let input = gen_noise(sample_rate as usize / 2, 0.4, 0xBEEF);

    let elastic = stretch_mono(
        &input,
        sample_rate,
        1.5,
        1.0,
        StretcherOptions::offline().with_stretch(StretchProfile::Elastic),
    );
    let precise = stretch_mono(
        &input,
        sample_rate,
        1.5,
        1.0,
        StretcherOptions::offline().with_stretch(StretchProfile::Precise),
    );

    let target = (input.len() as f64 * 1.5).round() as i64;
    assert!((elastic.len() as i64 - target).abs() <= 2048);
    assert!((precise.len() as i64 - target).abs() <= 2048);
}
