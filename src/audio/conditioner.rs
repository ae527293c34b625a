//! Per-chunk denoising and int16 quantization of captured audio.

/// Low-pass smoothing factor.
pub const SMOOTHING_ALPHA: f32 = 0.12;
/// Smoothed magnitudes below this are forced to zero.
pub const NOISE_GATE_THRESHOLD: f32 = 0.015;

/// One-pole low-pass followed by a hard noise gate and PCM16 quantization.
///
/// Each call starts from a zero filter state, so the same input always
/// produces the same output.
#[derive(Debug, Clone, Copy)]
pub struct SignalConditioner {
    alpha: f32,
    gate: f32,
}

impl Default for SignalConditioner {
    fn default() -> Self {
        Self {
            alpha: SMOOTHING_ALPHA,
            gate: NOISE_GATE_THRESHOLD,
        }
    }
}

impl SignalConditioner {
    pub fn process(&self, samples: &[f32]) -> Vec<i16> {
        let mut smooth = 0.0_f32;
        samples
            .iter()
            .map(|&raw| {
                smooth += self.alpha * (raw - smooth);
                let gated = if smooth.abs() < self.gate { 0.0 } else { smooth };
                quantize(gated)
            })
            .collect()
    }
}

/// `clamp(round(x * 32768), -32768, 32767)`; NaN maps to silence.
pub fn quantize(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    (sample * 32768.0).round().clamp(-32768.0, 32767.0) as i16
}
