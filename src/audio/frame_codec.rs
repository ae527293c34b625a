//! PCM16 <-> transport payload.
//!
//! The wire carries little-endian int16 samples wrapped in standard base64 so
//! they fit inside a JSON text frame.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("audio payload is not valid base64: {0}")]
    InvalidBase64(String),

    #[error("audio payload has {0} bytes, expected a multiple of 2")]
    OddByteLength(usize),

    #[error("audio declared a sample rate of {0} Hz")]
    InvalidSampleRate(u32),
}

/// Normalized samples plus the rate they were declared at.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedFrame {
    /// Length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

pub fn encode(pcm: &[i16]) -> String {
    let mut bytes = Vec::with_capacity(pcm.len() * 2);
    for sample in pcm {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    STANDARD.encode(bytes)
}

pub fn decode(payload: &str, sample_rate: u32) -> Result<DecodedFrame, CodecError> {
    // 零采样率的帧没有时长，会和下一帧重叠
    if sample_rate == 0 {
        return Err(CodecError::InvalidSampleRate(sample_rate));
    }
    let pcm = decode_pcm(payload)?;
    Ok(DecodedFrame {
        samples: pcm.iter().map(|&s| s as f32 / 32768.0).collect(),
        sample_rate,
    })
}

/// Base64 payload to raw int16 samples.
pub fn decode_pcm(payload: &str) -> Result<Vec<i16>, CodecError> {
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| CodecError::InvalidBase64(e.to_string()))?;
    pcm_bytes_to_i16(&bytes)
}

pub fn pcm_bytes_to_i16(bytes: &[u8]) -> Result<Vec<i16>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddByteLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Raw captured PCM16LE bytes to samples in [-1, 1).
pub fn pcm_bytes_to_f32(bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
    Ok(pcm_bytes_to_i16(bytes)?
        .into_iter()
        .map(|s| s as f32 / 32768.0)
        .collect())
}
