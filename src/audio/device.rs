//! Contracts the engine expects from audio hardware.
//!
//! Both directions hand out guards: an [`InputStream`] keeps the microphone
//! open until it is stopped or dropped, an [`OutputDevice`] keeps the speaker
//! open until it is closed or dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;

/// What the capture side asks the microphone for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub sample_rate: u32,
    pub channels: u32,
    /// Length of each delivered chunk.
    pub chunk_ms: u32,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            chunk_ms: 50,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain: true,
        }
    }
}

impl CaptureConstraints {
    /// Samples per channel in one chunk.
    pub fn chunk_frames(&self) -> usize {
        (self.sample_rate as usize * self.chunk_ms as usize) / 1000
    }
}

/// Hardware parameters for the output side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackParams {
    pub sample_rate: u32,
    pub channels: u32,
    /// Frames per hardware write (0 = let the driver decide)
    pub period_size: usize,
}

impl Default for PlaybackParams {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 1,
            period_size: 1024,
        }
    }
}

/// One raw PCM16LE chunk, tagged with whether it was captured while
/// transmission was on.
#[derive(Debug)]
pub struct CapturedChunk {
    pub pcm: Vec<u8>,
    pub transmit: bool,
}

/// Where a microphone delivers its chunks.
///
/// The transmit flag is read at delivery, so muting or unmuting only affects
/// audio captured after the switch, however far behind the consumer is.
#[derive(Debug, Clone)]
pub struct ChunkSender {
    tx: mpsc::Sender<CapturedChunk>,
    transmitting: Arc<AtomicBool>,
}

impl ChunkSender {
    pub fn new(tx: mpsc::Sender<CapturedChunk>, transmitting: Arc<AtomicBool>) -> Self {
        Self { tx, transmitting }
    }

    fn stamp(&self, pcm: Vec<u8>) -> CapturedChunk {
        CapturedChunk {
            pcm,
            transmit: self.transmitting.load(Ordering::Acquire),
        }
    }

    pub async fn send(&self, pcm: Vec<u8>) -> Result<(), SendError<CapturedChunk>> {
        self.tx.send(self.stamp(pcm)).await
    }

    /// For device threads outside the runtime.
    pub fn blocking_send(&self, pcm: Vec<u8>) -> Result<(), SendError<CapturedChunk>> {
        self.tx.blocking_send(self.stamp(pcm))
    }
}

/// A live microphone stream. Dropping it must release the hardware too.
pub trait InputStream: Send {
    fn stop(&mut self);
}

pub trait Microphone: Send + Sync {
    /// Open the device and start sending PCM16LE mono chunks to `chunks`.
    ///
    /// Must either return a running stream or fail with nothing left open.
    fn open(
        &self,
        constraints: &CaptureConstraints,
        chunks: ChunkSender,
    ) -> Result<Box<dyn InputStream>>;
}

/// A time-addressable output context.
pub trait OutputDevice: Send {
    /// Device clock in seconds.
    fn current_time(&self) -> f64;

    /// Queue `samples` to start exactly at `start_at` on the device clock.
    fn schedule(&mut self, samples: &[f32], sample_rate: u32, start_at: f64) -> Result<()>;

    fn close(&mut self);
}

pub trait OutputFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn OutputDevice>>;
}

/// Ask a device thread to exit. Inside the runtime the join happens on the
/// blocking pool; the thread may still be draining the PCM.
#[cfg_attr(not(feature = "alsa"), allow(dead_code))]
pub(crate) fn stop_device_thread(running: &AtomicBool, handle: &mut Option<JoinHandle<()>>) {
    running.store(false, Ordering::Relaxed);
    let Some(handle) = handle.take() else {
        return;
    };
    let join = move || {
        if handle.join().is_err() {
            log::error!("Audio thread panicked");
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(join);
        }
        Err(_) => join(),
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub struct OutputLog {
        pub now: f64,
        /// (start_at, sample count, sample rate)
        pub scheduled: Vec<(f64, usize, u32)>,
        pub created: usize,
        pub closed: usize,
        pub fail_create: bool,
    }

    /// Output device whose clock only moves when the test says so.
    #[derive(Clone, Default)]
    pub struct FakeOutputFactory {
        pub log: Arc<Mutex<OutputLog>>,
    }

    impl FakeOutputFactory {
        pub fn set_now(&self, now: f64) {
            self.log.lock().unwrap().now = now;
        }

        pub fn starts(&self) -> Vec<f64> {
            self.log.lock().unwrap().scheduled.iter().map(|s| s.0).collect()
        }
    }

    struct FakeOutput {
        log: Arc<Mutex<OutputLog>>,
    }

    impl OutputFactory for FakeOutputFactory {
        fn create(&self) -> Result<Box<dyn OutputDevice>> {
            let mut log = self.log.lock().unwrap();
            if log.fail_create {
                anyhow::bail!("no playback device");
            }
            log.created += 1;
            Ok(Box::new(FakeOutput {
                log: self.log.clone(),
            }))
        }
    }

    impl OutputDevice for FakeOutput {
        fn current_time(&self) -> f64 {
            self.log.lock().unwrap().now
        }

        fn schedule(&mut self, samples: &[f32], sample_rate: u32, start_at: f64) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .scheduled
                .push((start_at, samples.len(), sample_rate));
            Ok(())
        }

        fn close(&mut self) {
            self.log.lock().unwrap().closed += 1;
        }
    }

    #[derive(Debug, Default)]
    pub struct MicLog {
        pub opened: usize,
        pub stopped: usize,
        pub fail_open: bool,
        pub last_constraints: Option<CaptureConstraints>,
    }

    /// Microphone that hands its chunk sender to the test instead of hardware.
    #[derive(Clone, Default)]
    pub struct FakeMicrophone {
        pub log: Arc<Mutex<MicLog>>,
        pub sender: Arc<Mutex<Option<ChunkSender>>>,
    }

    impl FakeMicrophone {
        pub fn sender(&self) -> ChunkSender {
            self.sender.lock().unwrap().clone().expect("microphone not open")
        }
    }

    struct FakeStream {
        log: Arc<Mutex<MicLog>>,
        sender: Arc<Mutex<Option<ChunkSender>>>,
        stopped: bool,
    }

    impl InputStream for FakeStream {
        fn stop(&mut self) {
            if !self.stopped {
                self.stopped = true;
                self.sender.lock().unwrap().take();
                self.log.lock().unwrap().stopped += 1;
            }
        }
    }

    impl Drop for FakeStream {
        fn drop(&mut self) {
            self.stop();
        }
    }

    impl Microphone for FakeMicrophone {
        fn open(
            &self,
            constraints: &CaptureConstraints,
            chunks: ChunkSender,
        ) -> Result<Box<dyn InputStream>> {
            let mut log = self.log.lock().unwrap();
            if log.fail_open {
                anyhow::bail!("permission denied");
            }
            log.opened += 1;
            log.last_constraints = Some(*constraints);
            *self.sender.lock().unwrap() = Some(chunks);
            Ok(Box::new(FakeStream {
                log: self.log.clone(),
                sender: self.sender.clone(),
                stopped: false,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifty_ms_at_16k_is_800_frames() {
        assert_eq!(CaptureConstraints::default().chunk_frames(), 800);
    }

    /// A thread stuck in a blocking write must not stall the caller.
    #[tokio::test]
    async fn stopping_a_busy_thread_does_not_block_the_runtime() {
        use std::sync::mpsc as std_mpsc;
        use std::time::Duration;

        let running = Arc::new(AtomicBool::new(true));
        let finished = Arc::new(AtomicBool::new(false));
        let (release_tx, release_rx) = std_mpsc::channel::<()>();
        let thread_finished = finished.clone();
        let mut handle = Some(std::thread::spawn(move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
            thread_finished.store(true, Ordering::SeqCst);
        }));

        stop_device_thread(&running, &mut handle);

        assert!(!running.load(Ordering::Relaxed));
        assert!(handle.is_none());
        assert!(!finished.load(Ordering::SeqCst));
        release_tx.send(()).unwrap();
    }

    #[test]
    fn stopping_outside_a_runtime_joins_inline() {
        let running = AtomicBool::new(true);
        let finished = Arc::new(AtomicBool::new(false));
        let thread_finished = finished.clone();
        let mut handle = Some(std::thread::spawn(move || {
            thread_finished.store(true, Ordering::SeqCst);
        }));

        stop_device_thread(&running, &mut handle);

        assert!(finished.load(Ordering::SeqCst));
        // second stop is a no-op
        stop_device_thread(&running, &mut handle);
    }
}
