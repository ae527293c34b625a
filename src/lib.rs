//! voicelink - real-time voice streaming client.
//!
//! Microphone audio is conditioned, encoded and streamed over a WebSocket;
//! synthesized audio coming back is scheduled for gapless playback. The
//! connection survives transient loss through bounded reconnection while
//! outbound frames wait in a bounded queue.

pub mod audio;
pub mod config;
pub mod net_link;
pub mod outbound;
pub mod protocol;
