//! Window/hop/buffer sizing for a given ratio and operating mode.

/// Default analysis hop before rate scaling.
pub const DEFAULT_INCREMENT: usize = 256;

/// Default analysis window before rate scaling.
pub const DEFAULT_WINDOW_SIZE: usize = 2048;

/// Rounds up to the next power of two; a power of two is returned unchanged.
pub fn round_up_pow2(value: usize) -> usize {
    if value <= 1 {
        return 1;
    }
    if value & (value - 1) == 0 {
        return value;
    }
    let mut v = value;
    let mut bits = 0;
    while v > 0 {
        bits += 1;
        v >>= 1;
    }
    1 << bits
}

/// Inputs to the sizing calculation.
#[derive(Debug, Clone)]
pub struct SizeRequest {
    /// `timeRatio * pitchScale`: the ratio the stretcher realizes internally.
    pub effective_ratio: f64,
    pub realtime: bool,
    /// Worker-per-channel offline processing (affects outbuf headroom).
    pub threaded: bool,
    pub base_window_size: usize,
    /// `max(1, sampleRate / 48000)`.
    pub rate_multiple: f64,
    /// 0 when the total input length is unknown.
    pub expected_input_duration: u64,
    pub pitch_scale: f64,
    pub time_ratio: f64,
    pub max_process_size: usize,
}

/// Outputs of the sizing calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sizes {
    pub window_size: usize,
    pub input_increment: usize,
    pub outbuf_size: usize,
    /// May be raised so a full window always fits in one process call.
    pub max_process_size: usize,
}

/// Picks analysis window, input hop, and output-buffer capacity.
///
/// Real-time mode keeps a fixed input hop so the caller sees a steady
/// cadence; offline mode varies the hop with the ratio. In both modes the
/// window is sized to roughly six output hops so overlap stays dense enough
/// for stretching without phasiness.
pub fn calculate_sizes(req: &SizeRequest) -> Sizes {
    let r = req.effective_ratio;
    let w0 = req.base_window_size;
    let mut window_size = w0;
    let mut input_increment;

    if req.realtime {
        input_increment = round_up_pow2((DEFAULT_INCREMENT as f64 * req.rate_multiple) as usize);

        if r < 1.0 {
            let output_increment = (input_increment as f64 * r).floor() as usize;
            if output_increment < 1 {
                input_increment = round_up_pow2((1.0 / r).ceil() as usize);
                window_size = input_increment * 4;
            }
        } else {
            let mut output_increment = (input_increment as f64 * r).ceil() as usize;
            while output_increment > 1024 && input_increment > 1 {
                input_increment /= 2;
                output_increment = (input_increment as f64 * r).ceil() as usize;
            }
            window_size = window_size.max(round_up_pow2(output_increment * 6));
            if r > 5.0 {
                while window_size < 8192 {
                    window_size *= 2;
                }
            }
        }
    } else if r < 1.0 {
        input_increment = w0 / 4;
        while input_increment >= 512 {
            input_increment /= 2;
        }
        let output_increment = (input_increment as f64 * r).floor() as usize;
        if output_increment < 1 {
            input_increment = round_up_pow2((1.0 / r).ceil() as usize);
            window_size = input_increment * 4;
        }
    } else {
        let mut output_increment = w0 / 6;
        input_increment = (output_increment as f64 / r) as usize;
        while output_increment > 1024 && input_increment > 1 {
            output_increment /= 2;
            input_increment = (output_increment as f64 / r) as usize;
        }
        input_increment = input_increment.max(1);
        window_size = window_size.max(round_up_pow2(output_increment * 6));
        if r > 5.0 {
            while window_size < 8192 {
                window_size *= 2;
            }
        }
    }

    if req.expected_input_duration > 0 {
        while input_increment as u64 * 4 > req.expected_input_duration && input_increment > 1 {
            input_increment /= 2;
        }
    }

    // The window can grow with extreme ratios, but never past 4x the base
    // size unless the squash is below 1/1024.
    if r >= 1.0 / 1024.0 {
        window_size = window_size.min(4 * w0);
    }

    let max_process_size = req.max_process_size.max(window_size);

    let mut outbuf_size = (max_process_size as f64 / req.pitch_scale)
        .max(window_size as f64 * 2.0 * req.time_ratio.max(1.0))
        .ceil() as usize;

    // Headroom: in real-time mode against pitch changes mid-stream, in
    // threaded offline mode so workers can run ahead of output drainage.
    if req.realtime || req.threaded {
        outbuf_size *= 16;
    }

    Sizes {
        window_size,
        input_increment,
        outbuf_size,
        max_process_size,
    }
}
