//! JSON envelopes exchanged with the voice endpoint.
//!
//! Every message is a text frame holding an object with a `type` tag.
//! Outbound we only ever send `audio`; inbound the tag decides dispatch.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 上行音频固定参数
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
pub const CAPTURE_CHANNELS: u8 = 1;

/// 服务端未声明采样率时的默认值
pub const DEFAULT_SERVER_SAMPLE_RATE: u32 = 24_000;

/// Close code used for closes this client asks for.
pub const INTENTIONAL_CLOSE_CODE: u16 = 1000;
/// Close code recorded when the socket drops without a close frame.
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// Outgoing audio frame, immutable once built.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct AudioFrame {
    #[serde(rename = "type")]
    msg_type: &'static str,
    data: String,
    sample_rate: u32,
    channels: u8,
}

impl AudioFrame {
    /// Wrap an already base64-encoded PCM16LE payload.
    pub fn new(data: String) -> Self {
        Self {
            msg_type: "audio",
            data,
            sample_rate: CAPTURE_SAMPLE_RATE,
            channels: CAPTURE_CHANNELS,
        }
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Audio pushed by the server. `sample_rate` falls back to 24 kHz.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct IncomingAudio {
    pub data: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default)]
    pub channels: Option<u8>,
}

fn default_sample_rate() -> u32 {
    DEFAULT_SERVER_SAMPLE_RATE
}

#[derive(Deserialize)]
struct StatePayload {
    value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    State(String),
    Audio(IncomingAudio),
    /// Any other tag, kept verbatim for the generic observer.
    Other(Value),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message has no string `type` field")]
    MissingType,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let msg_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(ProtocolError::MissingType)?;

        match msg_type {
            "state" => {
                let payload: StatePayload = serde_json::from_value(value)?;
                Ok(ServerMessage::State(payload.value))
            }
            "audio" => Ok(ServerMessage::Audio(serde_json::from_value(value)?)),
            _ => Ok(ServerMessage::Other(value)),
        }
    }
}
