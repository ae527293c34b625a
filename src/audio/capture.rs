//! Microphone → conditioner → codec → network link.
//!
//! Recording and transmitting are separate switches: the microphone can stay
//! open while transmission is muted, and chunks captured while muted are
//! dropped on the floor. Whether a chunk counts as muted is decided when the
//! microphone delivers it, not when the consumer gets to it.
//!
//! All chunks of one recording go through a single consumer task, so the
//! order frames reach the link is the order they were captured.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::conditioner::SignalConditioner;
use super::device::{CaptureConstraints, CapturedChunk, ChunkSender, InputStream, Microphone};
use super::frame_codec::{self, CodecError};
use crate::net_link::{ConnectionState, NetHandle};
use crate::protocol::AudioFrame;

/// 每个录音会话的分片缓冲，满了以后采集线程会阻塞
const CHUNK_CHANNEL_DEPTH: usize = 32;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("cannot start transmission while the connection is {0}")]
    NotConnected(ConnectionState),

    #[error("microphone unavailable: {0}")]
    Device(String),
}

struct Recording {
    stream: Box<dyn InputStream>,
    worker: JoinHandle<()>,
}

pub struct CapturePipeline {
    microphone: Arc<dyn Microphone>,
    constraints: CaptureConstraints,
    link: NetHandle,
    conditioner: SignalConditioner,
    transmitting: Arc<AtomicBool>,
    recording: Option<Recording>,
}

impl CapturePipeline {
    pub fn new(
        microphone: Arc<dyn Microphone>,
        constraints: CaptureConstraints,
        link: NetHandle,
    ) -> Self {
        Self {
            microphone,
            constraints,
            link,
            conditioner: SignalConditioner::default(),
            transmitting: Arc::new(AtomicBool::new(false)),
            recording: None,
        }
    }

    /// Open the microphone and start chunk processing. No-op when already
    /// recording. Must be called from within a tokio runtime.
    pub fn start_recording(&mut self) -> Result<(), CaptureError> {
        if self.recording.is_some() {
            return Ok(());
        }

        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CHANNEL_DEPTH);
        let sender = ChunkSender::new(chunk_tx, self.transmitting.clone());
        let stream = self
            .microphone
            .open(&self.constraints, sender)
            .map_err(|e| {
                log::error!("Failed to open microphone: {:#}", e);
                CaptureError::Device(format!("{:#}", e))
            })?;

        let worker = tokio::spawn(process_chunks(chunk_rx, self.link.clone(), self.conditioner));
        self.recording = Some(Recording { stream, worker });

        log::info!(
            "Recording started: {}Hz, {}ms chunks, aec={}, ns={}, agc={}",
            self.constraints.sample_rate,
            self.constraints.chunk_ms,
            self.constraints.echo_cancellation,
            self.constraints.noise_suppression,
            self.constraints.auto_gain,
        );
        Ok(())
    }

    /// Release the microphone and stop chunk processing. Safe to repeat.
    pub fn stop_recording(&mut self) {
        if let Some(mut recording) = self.recording.take() {
            // 先停消费者，采集线程的 blocking_send 会立刻返回
            recording.worker.abort();
            recording.stream.stop();
            log::info!("Recording stopped");
        }
    }

    /// Only allowed on a connected link. Starts recording if needed.
    pub fn start_transmission(&mut self) -> Result<(), CaptureError> {
        let state = self.link.state();
        if state != ConnectionState::Connected {
            log::warn!("Refusing to transmit: connection is {}", state);
            return Err(CaptureError::NotConnected(state));
        }
        self.start_recording()?;
        self.transmitting.store(true, Ordering::Release);
        log::info!("Transmission started");
        Ok(())
    }

    /// Mute. The microphone stays open.
    pub fn stop_transmission(&self) {
        if self.transmitting.swap(false, Ordering::AcqRel) {
            log::info!("Transmission stopped");
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    pub fn is_transmitting(&self) -> bool {
        self.transmitting.load(Ordering::Acquire)
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop_transmission();
        self.stop_recording();
    }
}

/// Turn one raw PCM16LE chunk into a wire frame.
pub fn encode_chunk(conditioner: &SignalConditioner, chunk: &[u8]) -> Result<AudioFrame, CodecError> {
    let samples = frame_codec::pcm_bytes_to_f32(chunk)?;
    let pcm = conditioner.process(&samples);
    Ok(AudioFrame::new(frame_codec::encode(&pcm)))
}

async fn process_chunks(
    mut chunks: mpsc::Receiver<CapturedChunk>,
    link: NetHandle,
    conditioner: SignalConditioner,
) {
    while let Some(chunk) = chunks.recv().await {
        if !chunk.transmit {
            continue;
        }
        match encode_chunk(&conditioner, &chunk.pcm) {
            Ok(frame) => {
                if let Err(e) = link.send(frame) {
                    log::warn!("Failed to hand audio to the network link: {}", e);
                }
            }
            Err(e) => log::warn!("Dropping capture chunk: {}", e),
        }
    }
    log::debug!("Capture chunk stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::PlaybackScheduler;
    use crate::audio::device::fakes::{FakeMicrophone, FakeOutputFactory};
    use crate::net_link::NetLink;
    use crate::net_link::fakes::{Outcome, Peer, ScriptedConnector};
    use crate::net_link::ReconnectPolicy;
    use crate::outbound::QueuePolicy;
    use std::time::Duration;

    fn spawn_link(script: Vec<Outcome>) -> (NetHandle, mpsc::UnboundedReceiver<Peer>) {
        let (connector, peers) = ScriptedConnector::with(script);
        let playback = PlaybackScheduler::new(Box::new(FakeOutputFactory::default()));
        let (link, handle, _events) = NetLink::new(
            connector,
            playback,
            ReconnectPolicy::default(),
            QueuePolicy::default(),
        );
        tokio::spawn(link.run());
        (handle, peers)
    }

    fn pipeline(mic: &FakeMicrophone, handle: NetHandle) -> CapturePipeline {
        CapturePipeline::new(Arc::new(mic.clone()), CaptureConstraints::default(), handle)
    }

    /// 50ms of a constant loud level, PCM16LE.
    fn chunk(level: i16) -> Vec<u8> {
        std::iter::repeat(level)
            .take(800)
            .flat_map(|s| s.to_le_bytes())
            .collect()
    }

    fn expected(level: i16) -> String {
        encode_chunk(&SignalConditioner::default(), &chunk(level))
            .unwrap()
            .data()
            .to_string()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn transmission_refused_when_disconnected() {
        let (handle, _peers) = spawn_link(vec![Outcome::Refuse]);
        assert!(handle.connect().await.is_err());
        assert_eq!(handle.state(), ConnectionState::Disconnected);

        let mic = FakeMicrophone::default();
        let mut capture = pipeline(&mic, handle);
        let err = capture.start_transmission().unwrap_err();
        assert!(matches!(err, CaptureError::NotConnected(ConnectionState::Disconnected)));
        assert!(!capture.is_recording());
        assert!(!capture.is_transmitting());
        assert_eq!(mic.log.lock().unwrap().opened, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_recording_is_idempotent_and_forwards_constraints() {
        let (handle, _peers) = spawn_link(vec![]);
        let mic = FakeMicrophone::default();
        let mut capture = pipeline(&mic, handle);

        capture.start_recording().unwrap();
        capture.start_recording().unwrap();
        let log = mic.log.lock().unwrap();
        assert_eq!(log.opened, 1);
        let constraints = log.last_constraints.unwrap();
        assert_eq!(constraints.sample_rate, 16_000);
        assert_eq!(constraints.channels, 1);
        assert!(constraints.echo_cancellation && constraints.noise_suppression && constraints.auto_gain);
    }

    #[tokio::test(start_paused = true)]
    async fn microphone_failure_leaves_nothing_running() {
        let (handle, _peers) = spawn_link(vec![]);
        let mic = FakeMicrophone::default();
        mic.log.lock().unwrap().fail_open = true;
        let mut capture = pipeline(&mic, handle);

        match capture.start_recording() {
            Err(CaptureError::Device(msg)) => assert!(msg.contains("permission denied")),
            other => panic!("expected device error, got {:?}", other.err()),
        }
        assert!(!capture.is_recording());
    }

    #[tokio::test(start_paused = true)]
    async fn only_transmitted_chunks_reach_the_wire_in_order() {
        let (handle, mut peers) = spawn_link(vec![Outcome::Accept]);
        handle.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        let mic = FakeMicrophone::default();
        let mut capture = pipeline(&mic, handle);
        capture.start_recording().unwrap();
        let chunks = mic.sender();

        // 录音但未发送：丢弃
        chunks.send(chunk(9_000)).await.unwrap();
        settle().await;

        capture.start_transmission().unwrap();
        let levels: Vec<i16> = (0..20).map(|i| 2_000 + i * 300).collect();
        for &level in &levels {
            chunks.send(chunk(level)).await.unwrap();
        }

        for &level in &levels {
            assert_eq!(peer.next_audio().await, expected(level));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn muting_applies_to_chunks_by_capture_time() {
        let (handle, mut peers) = spawn_link(vec![Outcome::Accept]);
        handle.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        let mic = FakeMicrophone::default();
        let mut capture = pipeline(&mic, handle);
        capture.start_recording().unwrap();
        let chunks = mic.sender();

        // 消费者还没跑：静音时采到的分片在开启发送后也不能发出
        chunks.send(chunk(9_000)).await.unwrap();
        capture.start_transmission().unwrap();
        chunks.send(chunk(3_000)).await.unwrap();
        // 发送中采到的分片在静音后仍要发出
        capture.stop_transmission();
        chunks.send(chunk(6_000)).await.unwrap();
        settle().await;

        assert_eq!(peer.next_audio().await, expected(3_000));
        assert!(peer.received.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_chunk_is_dropped_and_pipeline_continues() {
        let (handle, mut peers) = spawn_link(vec![Outcome::Accept]);
        handle.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        let mic = FakeMicrophone::default();
        let mut capture = pipeline(&mic, handle);
        capture.start_transmission().unwrap();
        assert!(capture.is_recording());

        let chunks = mic.sender();
        chunks.send(vec![1, 2, 3]).await.unwrap();
        chunks.send(chunk(4_000)).await.unwrap();
        assert_eq!(peer.next_audio().await, expected(4_000));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_transmission_keeps_microphone_open() {
        let (handle, mut peers) = spawn_link(vec![Outcome::Accept]);
        handle.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        let mic = FakeMicrophone::default();
        let mut capture = pipeline(&mic, handle);
        capture.start_transmission().unwrap();
        capture.stop_transmission();
        assert!(capture.is_recording());
        assert!(!capture.is_transmitting());
        assert_eq!(mic.log.lock().unwrap().stopped, 0);

        mic.sender().send(chunk(5_000)).await.unwrap();
        settle().await;
        assert!(peer.received.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_recording_releases_device_and_is_safe_to_repeat() {
        let (handle, _peers) = spawn_link(vec![]);
        let mic = FakeMicrophone::default();
        let mut capture = pipeline(&mic, handle);

        capture.stop_recording();
        capture.start_recording().unwrap();
        capture.stop_recording();
        capture.stop_recording();
        assert!(!capture.is_recording());
        assert_eq!(mic.log.lock().unwrap().stopped, 1);

        capture.start_recording().unwrap();
        drop(capture);
        assert_eq!(mic.log.lock().unwrap().stopped, 2);
    }

    #[test]
    fn encode_chunk_rejects_odd_length() {
        let err = encode_chunk(&SignalConditioner::default(), &[0, 1, 2]).unwrap_err();
        assert_eq!(err, CodecError::OddByteLength(3));
    }
}
