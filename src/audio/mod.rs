//! audio - capture, conditioning, codec and scheduled playback
//!
//! ```text
//! Microphone ─chunk─▶ frame_codec::pcm_bytes_to_f32 ─▶ conditioner ─▶ frame_codec::encode ─▶ NetLink
//! NetLink ─audio─▶ frame_codec::decode ─▶ PlaybackScheduler ─▶ OutputDevice
//! ```
//!
//! Device I/O lives behind the traits in [`device`]; the ALSA implementation
//! is only compiled with the `alsa` feature.

#[cfg(feature = "alsa")]
mod alsa_device;
pub mod capture;
pub mod conditioner;
pub mod device;
pub mod frame_codec;
pub mod playback;
pub mod resample;

#[cfg(feature = "alsa")]
pub use alsa_device::{AlsaMicrophone, AlsaOutputFactory};
pub use capture::{CaptureError, CapturePipeline};
pub use conditioner::SignalConditioner;
pub use device::{
    CaptureConstraints, CapturedChunk, ChunkSender, InputStream, Microphone, OutputDevice,
    OutputFactory, PlaybackParams,
};
pub use frame_codec::{CodecError, DecodedFrame};
pub use playback::{PlaybackError, PlaybackScheduler};
