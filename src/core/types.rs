//! Core types shared across the crate: samples and stretcher options.

/// A single audio sample (32-bit float, range -1.0 to 1.0).
pub type Sample = f32;

/// Offline (two-pass) versus real-time (single-pass) operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMode {
    /// Two-pass: `study` the whole input, then `process` it.
    Offline,
    /// Single-pass: `process` only, chunk decisions made on the fly.
    RealTime,
}

/// How output is distributed between stretchable regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StretchProfile {
    /// Concentrate stretch in tonal/steady regions (high-frequency weighted
    /// stretch curve). Offline only.
    Elastic,
    /// Distribute stretch uniformly. Implied by real-time mode.
    Precise,
}

/// Transient handling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientsOption {
    /// Hard phase resets at detected transients.
    Crisp,
    /// Hard phase resets, softer detection.
    Mixed,
    /// No hard resets; transients are smoothed over.
    Smooth,
}

/// Per-channel phase continuity policy used by synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOption {
    /// Peak locking above the mid cutoff, rigid locking below the low
    /// cutoff, free phases in between.
    Adaptive,
    /// Identity phase locking across the whole spectrum.
    PeakLocked,
    /// Every bin propagates its own phase.
    Independent,
}

/// Whether the offline processing pass may use one worker thread per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadingOption {
    /// Use workers when offline, multichannel, and multiprocessor.
    Auto,
    /// Always process on the calling thread.
    Never,
}

/// Configuration for a [`Stretcher`](crate::Stretcher).
///
/// `window_short` and `window_long` halve or double the base analysis window.
/// Specifying both is rejected at construction with a logged warning and the
/// standard window size is used.
#[derive(Debug, Clone)]
pub struct StretcherOptions {
    pub mode: ProcessMode,
    pub stretch: StretchProfile,
    pub transients: TransientsOption,
    pub phase: PhaseOption,
    pub threading: ThreadingOption,
    pub window_short: bool,
    pub window_long: bool,
}

impl Default for StretcherOptions {
    fn default() -> Self {
        Self {
            mode: ProcessMode::Offline,
            stretch: StretchProfile::Elastic,
            transients: TransientsOption::Crisp,
            phase: PhaseOption::Adaptive,
            threading: ThreadingOption::Auto,
            window_short: false,
            window_long: false,
        }
    }
}

impl StretcherOptions {
    /// Offline (two-pass) defaults.
    pub fn offline() -> Self {
        Self::default()
    }

    /// Real-time (single-pass) defaults.
    pub fn realtime() -> Self {
        Self {
            mode: ProcessMode::RealTime,
            ..Self::default()
        }
    }

    /// Sets the stretch profile.
    pub fn with_stretch(mut self, stretch: StretchProfile) -> Self {
        self.stretch = stretch;
        self
    }

    /// Sets the transient handling policy.
    pub fn with_transients(mut self, transients: TransientsOption) -> Self {
        self.transients = transients;
        self
    }

    /// Sets the phase continuity policy.
    pub fn with_phase(mut self, phase: PhaseOption) -> Self {
        self.phase = phase;
        self
    }

    /// Sets the threading policy.
    pub fn with_threading(mut self, threading: ThreadingOption) -> Self {
        self.threading = threading;
        self
    }

    /// Requests half the standard analysis window.
    pub fn with_window_short(mut self) -> Self {
        self.window_short = true;
        self
    }

    /// Requests twice the standard analysis window.
    pub fn with_window_long(mut self) -> Self {
        self.window_long = true;
        self
    }

    /// True when operating single-pass.
    #[inline]
    pub fn is_realtime(&self) -> bool {
        self.mode == ProcessMode::RealTime
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = StretcherOptions::default();
        assert_eq!(opts.mode, ProcessMode::Offline);
        assert_eq!(opts.stretch, StretchProfile::Elastic);
        assert_eq!(opts.transients, TransientsOption::Crisp);
        assert!(!opts.window_short);
        assert!(!opts.window_long);
    }

    #[test]
    fn test_builder_chain() {
        let opts = StretcherOptions::realtime()
            .with_transients(TransientsOption::Smooth)
            .with_phase(PhaseOption::Independent)
            .with_threading(ThreadingOption::Never)
            .with_window_short();
        assert!(opts.is_realtime());
        assert_eq!(opts.transients, TransientsOption::Smooth);
        assert_eq!(opts.phase, PhaseOption::Independent);
        assert_eq!(opts.threading, ThreadingOption::Never);
        assert!(opts.window_short);
    }
}
