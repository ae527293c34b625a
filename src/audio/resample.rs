//! Rate and channel conversion between the wire formats and whatever the
//! hardware actually negotiated.

/// Average interleaved frames down to mono.
pub fn downmix(interleaved: &[f32], channels: u32) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => interleaved.to_vec(),
        n => {
            let n = n as usize;
            interleaved
                .chunks_exact(n)
                .map(|frame| frame.iter().sum::<f32>() / n as f32)
                .collect()
        }
    }
}

/// Linear-interpolation resampler. Same rate is a plain copy.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }
    if samples.is_empty() {
        return Vec::new();
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let output_len = (samples.len() as f64 * ratio).round() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_pos = i as f64 / ratio;
        let idx = src_pos as usize;
        let frac = (src_pos - idx as f64) as f32;

        let sample = match (samples.get(idx), samples.get(idx + 1)) {
            (Some(&a), Some(&b)) => a * (1.0 - frac) + b * frac,
            (Some(&a), None) => a,
            _ => 0.0,
        };
        output.push(sample);
    }

    output
}

/// Turns start times on the output clock into device frame positions.
///
/// Start and end frames are both rounded from the same timeline, so a
/// segment that starts where the previous one ended lands on exactly the
/// previous end frame even when the rate ratio is not an integer.
#[derive(Debug, Clone)]
pub struct FramePlacer {
    device_rate: u32,
    /// (seconds, frame) where the last placed segment ends.
    last_end: Option<(f64, u64)>,
}

impl FramePlacer {
    pub fn new(device_rate: u32) -> Self {
        Self {
            device_rate,
            last_end: None,
        }
    }

    /// Returns `(start_frame, frame_count)` for `source_len` samples at
    /// `source_rate` starting at `start_at` seconds.
    pub fn place(&mut self, start_at: f64, source_len: usize, source_rate: u32) -> (u64, usize) {
        let rate = self.device_rate as f64;
        let to_frame = |secs: f64| (secs.max(0.0) * rate).round() as u64;

        let start_frame = match self.last_end {
            Some((end_at, end_frame)) if (start_at - end_at).abs() * rate < 0.5 => end_frame,
            _ => to_frame(start_at),
        };
        let duration = if source_rate == 0 {
            0.0
        } else {
            source_len as f64 / source_rate as f64
        };
        let end_at = start_at + duration;
        let end_frame = to_frame(end_at).max(start_frame);
        self.last_end = Some((end_at, end_frame));
        (start_frame, (end_frame - start_frame) as usize)
    }
}

/// Pad with the last sample or truncate to exactly `len` samples.
pub fn fit_length(mut samples: Vec<f32>, len: usize) -> Vec<f32> {
    let pad = samples.last().copied().unwrap_or(0.0);
    samples.resize(len, pad);
    samples
}
