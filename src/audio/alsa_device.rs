//! ALSA implementations of [`Microphone`] and [`OutputFactory`].
//!
//! Each open device owns one std thread doing blocking PCM I/O. The PCM handle
//! never leaves its thread; open errors are reported back through a
//! rendezvous channel so callers still get a synchronous `Result`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc as std_mpsc};
use std::thread::{self, JoinHandle};

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result, anyhow};

use super::device::{
    CaptureConstraints, ChunkSender, InputStream, Microphone, OutputDevice, OutputFactory,
    PlaybackParams, stop_device_thread,
};
use super::resample::{FramePlacer, downmix, fit_length, resample_linear};

/// XRUN 连续恢复失败的上限
const MAX_RECOVERY_RETRIES: u32 = 3;

/// What the hardware actually agreed to.
#[derive(Debug, Clone, Copy)]
struct Negotiated {
    sample_rate: u32,
    channels: u32,
    period_size: usize,
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, Negotiated)> {
    let dir_name = match direction {
        Direction::Capture => "capture",
        Direction::Playback => "playback",
    };
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    {
        let hwp = HwParams::any(&pcm).context("Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(channels)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)?;
    }

    let negotiated = {
        let hwp = pcm.hw_params_current()?;
        Negotiated {
            sample_rate: hwp.get_rate()?,
            channels: hwp.get_channels()?,
            period_size: hwp.get_period_size()? as usize,
        }
    };

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}",
        dir_name,
        device,
        negotiated.sample_rate,
        negotiated.channels,
        negotiated.period_size,
    );

    Ok((pcm, negotiated))
}

/// Spawn a device thread and wait until it reports whether the PCM opened.
fn spawn_device_thread<F>(name: &str, body: F) -> Result<(JoinHandle<()>, Negotiated)>
where
    F: FnOnce(std_mpsc::SyncSender<Result<Negotiated>>) + Send + 'static,
{
    let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || body(ready_tx))
        .with_context(|| format!("Failed to spawn {} thread", name))?;

    match ready_rx.recv() {
        Ok(Ok(negotiated)) => Ok((handle, negotiated)),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(e)
        }
        Err(_) => {
            let _ = handle.join();
            Err(anyhow!("{} thread exited before opening the device", name))
        }
    }
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

pub struct AlsaMicrophone {
    device: String,
}

impl AlsaMicrophone {
    pub fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
        }
    }
}

struct AlsaInputStream {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl InputStream for AlsaInputStream {
    fn stop(&mut self) {
        stop_device_thread(&self.running, &mut self.handle);
    }
}

impl Drop for AlsaInputStream {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Microphone for AlsaMicrophone {
    fn open(
        &self,
        constraints: &CaptureConstraints,
        chunks: ChunkSender,
    ) -> Result<Box<dyn InputStream>> {
        // ALSA 本身不提供 AEC/NS/AGC，这里只记录请求，由信号调理负责电平
        log::debug!(
            "Capture constraints: aec={}, ns={}, agc={} (not applied by ALSA)",
            constraints.echo_cancellation,
            constraints.noise_suppression,
            constraints.auto_gain,
        );

        let running = Arc::new(AtomicBool::new(true));
        let device = self.device.clone();
        let constraints = *constraints;
        let flag = running.clone();

        let (handle, _) = spawn_device_thread("audio-record", move |ready| {
            let (pcm, negotiated) = match open_pcm(
                &device,
                Direction::Capture,
                constraints.sample_rate,
                constraints.channels,
                None,
            ) {
                Ok(opened) => opened,
                Err(e) => {
                    let _ = ready.send(Err(e));
                    return;
                }
            };
            let _ = ready.send(Ok(negotiated));
            if let Err(e) = record_loop(&pcm, negotiated, &constraints, &chunks, &flag) {
                log::error!("Recording thread failed: {:#}", e);
            }
        })?;

        Ok(Box::new(AlsaInputStream {
            running,
            handle: Some(handle),
        }))
    }
}

fn record_loop(
    pcm: &PCM,
    hw: Negotiated,
    constraints: &CaptureConstraints,
    chunks: &ChunkSender,
    running: &AtomicBool,
) -> Result<()> {
    let io = pcm.io_i16()?;
    let chunk_frames = constraints.chunk_frames().max(1);
    let mut read_buf = vec![0i16; hw.period_size.max(1) * hw.channels as usize];
    let mut accum: Vec<f32> = Vec::with_capacity(chunk_frames * 2);
    let mut retry_count = 0u32;

    log::info!(
        "Recording thread running: hw {}Hz/{}ch, {} frames per chunk",
        hw.sample_rate,
        hw.channels,
        chunk_frames
    );

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                retry_count = 0;
                let interleaved: Vec<f32> = read_buf[..frames * hw.channels as usize]
                    .iter()
                    .map(|&s| s as f32 / 32768.0)
                    .collect();
                let mono = downmix(&interleaved, hw.channels);
                accum.extend(resample_linear(&mono, hw.sample_rate, constraints.sample_rate));

                while accum.len() >= chunk_frames {
                    let bytes: Vec<u8> = accum
                        .drain(..chunk_frames)
                        .flat_map(|s| super::conditioner::quantize(s).to_le_bytes())
                        .collect();
                    if chunks.blocking_send(bytes).is_err() {
                        log::debug!("Chunk receiver dropped, leaving recording loop");
                        return Ok(());
                    }
                }
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                retry_count += 1;
                pcm.prepare().context("Failed to recover PCM capture")?;
                if retry_count >= MAX_RECOVERY_RETRIES {
                    anyhow::bail!("capture keeps failing after {} recoveries", retry_count);
                }
            }
        }
    }

    log::info!("Recording thread stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

/// One scheduled buffer, already at the device rate.
struct Segment {
    start_frame: u64,
    samples: Vec<f32>,
}

impl Segment {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Shared between the scheduler side and the playback thread.
#[derive(Default)]
struct Timeline {
    /// Frames handed to ALSA so far; this is the device clock.
    written_frames: u64,
    segments: VecDeque<Segment>,
}

impl Timeline {
    /// Mix everything overlapping `[written_frames, written_frames + out.len())`.
    fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let from = self.written_frames;
        let to = from + out.len() as u64;
        for seg in self.segments.iter() {
            if seg.start_frame >= to || seg.end_frame() <= from {
                continue;
            }
            let begin = seg.start_frame.max(from);
            let end = seg.end_frame().min(to);
            for frame in begin..end {
                out[(frame - from) as usize] += seg.samples[(frame - seg.start_frame) as usize];
            }
        }
    }

    fn advance(&mut self, frames: u64) {
        self.written_frames += frames;
        let now = self.written_frames;
        self.segments.retain(|seg| seg.end_frame() > now);
    }
}

pub struct AlsaOutputFactory {
    device: String,
    params: PlaybackParams,
}

impl AlsaOutputFactory {
    pub fn new(device: &str, params: PlaybackParams) -> Self {
        Self {
            device: device.to_string(),
            params,
        }
    }
}

struct AlsaOutput {
    sample_rate: u32,
    placer: FramePlacer,
    timeline: Arc<Mutex<Timeline>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl OutputFactory for AlsaOutputFactory {
    fn create(&self) -> Result<Box<dyn OutputDevice>> {
        let running = Arc::new(AtomicBool::new(true));
        let timeline = Arc::new(Mutex::new(Timeline::default()));
        let device = self.device.clone();
        let params = self.params;
        let (flag, shared) = (running.clone(), timeline.clone());

        let (handle, negotiated) = spawn_device_thread("audio-play", move |ready| {
            let period = (params.period_size > 0).then_some(params.period_size);
            let (pcm, negotiated) = match open_pcm(
                &device,
                Direction::Playback,
                params.sample_rate,
                params.channels,
                period,
            ) {
                Ok(opened) => opened,
                Err(e) => {
                    let _ = ready.send(Err(e));
                    return;
                }
            };
            let _ = ready.send(Ok(negotiated));
            if let Err(e) = play_loop(&pcm, negotiated, &shared, &flag) {
                log::error!("Playback thread failed: {:#}", e);
            }
        })?;

        Ok(Box::new(AlsaOutput {
            sample_rate: negotiated.sample_rate,
            placer: FramePlacer::new(negotiated.sample_rate),
            timeline,
            running,
            handle: Some(handle),
        }))
    }
}

impl OutputDevice for AlsaOutput {
    fn current_time(&self) -> f64 {
        match self.timeline.lock() {
            Ok(timeline) => timeline.written_frames as f64 / self.sample_rate as f64,
            Err(_) => 0.0,
        }
    }

    fn schedule(&mut self, samples: &[f32], sample_rate: u32, start_at: f64) -> Result<()> {
        if self.handle.is_none() {
            anyhow::bail!("playback device is closed");
        }
        let (start_frame, len) = self.placer.place(start_at, samples.len(), sample_rate);
        let samples = fit_length(resample_linear(samples, sample_rate, self.sample_rate), len);
        let mut timeline = self
            .timeline
            .lock()
            .map_err(|_| anyhow!("playback timeline poisoned"))?;
        timeline.segments.push_back(Segment {
            start_frame,
            samples,
        });
        Ok(())
    }

    fn close(&mut self) {
        stop_device_thread(&self.running, &mut self.handle);
    }
}

impl Drop for AlsaOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn play_loop(
    pcm: &PCM,
    hw: Negotiated,
    timeline: &Mutex<Timeline>,
    running: &AtomicBool,
) -> Result<()> {
    let io = pcm.io_i16()?;
    let period = hw.period_size.max(1);
    let channels = hw.channels as usize;
    let mut mix = vec![0.0f32; period];
    let mut out = vec![0i16; period * channels];

    log::info!("Playback thread running: {}Hz/{}ch, period={}", hw.sample_rate, hw.channels, period);

    while running.load(Ordering::Relaxed) {
        {
            let mut timeline = timeline
                .lock()
                .map_err(|_| anyhow!("playback timeline poisoned"))?;
            timeline.render(&mut mix);
        }
        for (frame, &sample) in mix.iter().enumerate() {
            let s = super::conditioner::quantize(sample);
            out[frame * channels..(frame + 1) * channels].fill(s);
        }

        // 短写和 XRUN 都在这里处理，不丢已调度的帧
        let mut frames_written = 0;
        let mut retry_count = 0u32;
        while frames_written < period {
            match io.writei(&out[frames_written * channels..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    pcm.prepare().context("Failed to recover PCM playback")?;
                    if retry_count >= MAX_RECOVERY_RETRIES {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            period - frames_written
                        );
                        break;
                    }
                }
            }
        }

        // 丢弃的帧也推进时钟，保持与真实时间一致
        let mut timeline = timeline
            .lock()
            .map_err(|_| anyhow!("playback timeline poisoned"))?;
        timeline.advance(period as u64);
    }

    let _ = pcm.drain();
    log::info!("Playback thread stopped");
    Ok(())
}
