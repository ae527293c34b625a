//! Gapless scheduling of server audio.
//!
//! Frames arrive whenever the network delivers them. The scheduler keeps a
//! cursor on the output clock and places every frame right where the previous
//! one ends; when the cursor falls behind real time it is pushed forward to
//! rebuild a small lookahead buffer instead of piling frames up at "now".

use thiserror::Error;

use super::device::{OutputDevice, OutputFactory};
use super::frame_codec::{self, CodecError, DecodedFrame};
use crate::protocol::IncomingAudio;

/// A cursor closer than this to "now" counts as an underrun.
pub const UNDERRUN_THRESHOLD_SECS: f64 = 0.05;
/// Lookahead rebuilt after an underrun.
pub const SAFETY_BUFFER_SECS: f64 = 0.1;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error(transparent)]
    Decode(#[from] CodecError),

    #[error("output device unavailable: {0:#}")]
    Device(anyhow::Error),
}

pub struct PlaybackScheduler {
    factory: Box<dyn OutputFactory>,
    output: Option<Box<dyn OutputDevice>>,
    /// Next free start time on the output clock, in seconds.
    clock: f64,
}

impl PlaybackScheduler {
    pub fn new(factory: Box<dyn OutputFactory>) -> Self {
        Self {
            factory,
            output: None,
            clock: 0.0,
        }
    }

    /// Decode a server frame and schedule it. Returns the start time.
    pub fn play(&mut self, audio: &IncomingAudio) -> Result<f64, PlaybackError> {
        let frame = frame_codec::decode(&audio.data, audio.sample_rate)?;
        self.schedule(frame)
    }

    pub fn schedule(&mut self, frame: DecodedFrame) -> Result<f64, PlaybackError> {
        let output = match self.output.take() {
            Some(output) => output,
            None => self.create_output()?,
        };
        let output = self.output.insert(output);

        let now = output.current_time();
        if self.clock < now + UNDERRUN_THRESHOLD_SECS {
            if self.clock > 0.0 {
                log::debug!(
                    "Playback underrun: cursor {:.3}s, device {:.3}s, rebuilding buffer",
                    self.clock,
                    now
                );
            }
            self.clock = now + SAFETY_BUFFER_SECS;
        }

        let start_at = self.clock;
        output
            .schedule(&frame.samples, frame.sample_rate, start_at)
            .map_err(PlaybackError::Device)?;
        self.clock += frame.duration();
        Ok(start_at)
    }

    /// Close the output device and rewind the cursor. No-op without a device.
    pub fn teardown(&mut self) {
        if let Some(mut output) = self.output.take() {
            output.close();
            log::info!("Playback output released");
        }
        self.clock = 0.0;
    }

    pub fn clock(&self) -> f64 {
        self.clock
    }

    pub fn is_active(&self) -> bool {
        self.output.is_some()
    }

    fn create_output(&mut self) -> Result<Box<dyn OutputDevice>, PlaybackError> {
        let output = self.factory.create().map_err(PlaybackError::Device)?;
        self.clock = output.current_time();
        log::info!("Playback output created, clock at {:.3}s", self.clock);
        Ok(output)
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.teardown();
    }
}
