//! Test utilities and fixtures for ringplay tests.
//!
//! Synthetic frame sources, a WAV fixture writer, and an output sink that
//! pulls from the render callback on a plain thread instead of a device.
//!
//! # Example
//!
//! ```ignore
//! use crate::test_utils::{PullSink, VecSource};
//!
//! let player = Player::new(Config::default(), Box::new(PullSink::new(256)), None);
//! player.load_source("ramp", Box::new(VecSource::ramp(48_000, 48_000)))?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::player::{
    Frame, FrameSource, LengthNotifier, OutputSink, PlayerError, RenderFn, ResizePolicy,
    RingBuffer, RingSettings, SharedSource, SinkConfig, StreamStatus,
};

/// The frame a synthetic source produces at index `i`.
///
/// Distinct per index (modulo a million) so ordering bugs show up.
pub fn ramp_frame(i: u64) -> Frame {
    let v = (i % 1_000_000) as f32 / 1_000_000.0;
    Frame::new(v, -v)
}

/// Wrap a source for sharing with a fill loop.
pub fn shared(source: impl FrameSource + 'static) -> SharedSource {
    Arc::new(Mutex::new(Box::new(source)))
}

/// A small ring: `default` frames active, half that minimum, four times that maximum.
pub fn test_ring(default: usize) -> RingBuffer {
    let policy = ResizePolicy {
        min_capacity: default / 2,
        default_capacity: default,
        max_capacity: default * 4,
        grow_increment: default / 2,
        shrink_decrement: default / 4,
        underrun_window: Duration::from_secs(2),
        grow_cooldown: Duration::ZERO,
        stable_period: Duration::from_secs(60),
        warmup: Duration::from_secs(10),
        high_fullness: 0.9,
    };
    let settings = RingSettings {
        initial_fill_ratio: 0.0,
        initial_fill_timeout: Duration::from_millis(200),
        min_resize_step: 4,
    };
    RingBuffer::new(policy, settings)
}

/// Poll `condition` every couple of milliseconds until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

// ============================================================================
// Frame sources
// ============================================================================

/// In-memory source producing [`ramp_frame`]s.
pub struct VecSource {
    /// Frames that actually exist
    available: u64,
    /// Length reported to callers, correctable
    reported: u64,
    position: u64,
    sample_rate: u32,
    stream_calls: Arc<AtomicUsize>,
}

impl VecSource {
    pub fn ramp(frames: u64, sample_rate: u32) -> Self {
        Self {
            available: frames,
            reported: frames,
            position: 0,
            sample_rate,
            stream_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Report a different length than the frames that exist.
    pub fn with_reported_length(mut self, frames: u64) -> Self {
        self.reported = frames;
        self
    }

    /// Counter bumped by every `stream` call.
    pub fn stream_calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.stream_calls)
    }
}

impl FrameSource for VecSource {
    fn stream(&mut self, buf: &mut [Frame]) -> Result<StreamStatus, PlayerError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let left = self.available.saturating_sub(self.position);
        let n = (buf.len() as u64).min(left) as usize;
        for (offset, slot) in buf[..n].iter_mut().enumerate() {
            *slot = ramp_frame(self.position + offset as u64);
        }
        self.position += n as u64;
        Ok(StreamStatus {
            frames: n,
            more: self.position < self.available,
        })
    }

    fn seek(&mut self, frame: u64) -> Result<(), PlayerError> {
        if frame > self.available {
            return Err(PlayerError::Seek(format!(
                "frame {} beyond end {}",
                frame, self.available
            )));
        }
        self.position = frame;
        Ok(())
    }

    fn length(&self) -> u64 {
        self.reported
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn correct_length(&mut self, frames: u64) {
        self.reported = frames;
    }
}

/// Produces `frames` ramp frames, then fails every call with a decode error.
pub struct FailingSource {
    inner: VecSource,
}

impl FailingSource {
    pub fn after(frames: u64) -> Self {
        Self {
            inner: VecSource::ramp(frames, 48_000).with_reported_length(frames * 2),
        }
    }
}

impl FrameSource for FailingSource {
    fn stream(&mut self, buf: &mut [Frame]) -> Result<StreamStatus, PlayerError> {
        let status = self.inner.stream(buf)?;
        if status.frames == 0 {
            return Err(PlayerError::Decode("corrupt packet".to_string()));
        }
        Ok(StreamStatus {
            frames: status.frames,
            more: true,
        })
    }

    fn seek(&mut self, frame: u64) -> Result<(), PlayerError> {
        self.inner.seek(frame)
    }

    fn length(&self) -> u64 {
        self.inner.length()
    }

    fn position(&self) -> u64 {
        self.inner.position()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn correct_length(&mut self, frames: u64) {
        self.inner.correct_length(frames);
    }
}

/// Opens a [`GatedSource`].
#[derive(Clone)]
pub struct Gate(Arc<(Mutex<bool>, Condvar)>);

impl Gate {
    pub fn open(&self) {
        *self.0.0.lock() = true;
        self.0.1.notify_all();
    }

    fn wait(&self) {
        let mut open = self.0.0.lock();
        while !*open {
            self.0.1.wait(&mut open);
        }
    }
}

/// A source whose `stream` blocks until its gate is opened.
pub struct GatedSource {
    inner: VecSource,
    gate: Gate,
}

impl GatedSource {
    pub fn new(inner: VecSource) -> Self {
        Self {
            inner,
            gate: Gate(Arc::new((Mutex::new(false), Condvar::new()))),
        }
    }

    pub fn gate(&self) -> Gate {
        self.gate.clone()
    }
}

impl FrameSource for GatedSource {
    fn stream(&mut self, buf: &mut [Frame]) -> Result<StreamStatus, PlayerError> {
        self.gate.wait();
        self.inner.stream(buf)
    }

    fn seek(&mut self, frame: u64) -> Result<(), PlayerError> {
        self.inner.seek(frame)
    }

    fn length(&self) -> u64 {
        self.inner.length()
    }

    fn position(&self) -> u64 {
        self.inner.position()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn correct_length(&mut self, frames: u64) {
        self.inner.correct_length(frames);
    }

    fn set_length_listener(&mut self, listener: LengthNotifier) {
        self.inner.set_length_listener(listener);
    }
}

// ============================================================================
// WAV fixtures
// ============================================================================

/// The sample [`write_test_wav`] stores at frame `i`, as the decoder returns it.
pub fn wav_sample(i: u64) -> f32 {
    wav_pcm(i) as f32 / 32768.0
}

fn wav_pcm(i: u64) -> i16 {
    ((i % 200) as i16 - 100) * 100
}

/// Write a 16-bit mono WAV of `secs` seconds into `dir`.
pub fn write_test_wav(dir: &Path, name: &str, secs: f64, sample_rate: u32) -> PathBuf {
    let path = dir.join(name);
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(&path, spec).expect("Failed to create WAV writer");
    let frames = (secs * sample_rate as f64) as u64;
    for i in 0..frames {
        writer
            .write_sample(wav_pcm(i))
            .expect("Failed to write WAV sample");
    }
    writer.finalize().expect("Failed to finalize WAV");
    path
}

// ============================================================================
// Output sink
// ============================================================================

/// Output sink that calls the render function in a loop on its own thread,
/// much faster than real time.
pub struct PullSink {
    block: usize,
    fail_start: bool,
    config: Option<SinkConfig>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    clears: Arc<AtomicUsize>,
    /// Every non-silent frame rendered, in order
    heard: Arc<Mutex<Vec<Frame>>>,
}

impl PullSink {
    pub fn new(block: usize) -> Self {
        Self {
            block,
            fail_start: false,
            config: None,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
            clears: Arc::new(AtomicUsize::new(0)),
            heard: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A sink whose device never opens.
    pub fn failing() -> Self {
        let mut sink = Self::new(256);
        sink.fail_start = true;
        sink
    }

    /// Counter bumped by every `clear` call.
    pub fn clears(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.clears)
    }

    /// Non-silent frames rendered so far.
    pub fn heard(&self) -> Arc<Mutex<Vec<Frame>>> {
        Arc::clone(&self.heard)
    }

    fn stop_thread(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl OutputSink for PullSink {
    fn start(&mut self, config: SinkConfig, mut render: RenderFn) -> Result<(), PlayerError> {
        self.stop_thread();
        if self.fail_start {
            return Err(PlayerError::OutputInit("no device".to_string()));
        }

        let running = Arc::new(AtomicBool::new(true));
        let block = self.block;
        let flag = Arc::clone(&running);
        let heard = Arc::clone(&self.heard);
        let thread = thread::Builder::new()
            .name("pull-sink".to_string())
            .spawn(move || {
                let mut buf = vec![Frame::SILENCE; block];
                while flag.load(Ordering::SeqCst) {
                    render(&mut buf);
                    heard
                        .lock()
                        .extend(buf.iter().filter(|f| **f != Frame::SILENCE));
                    thread::sleep(Duration::from_millis(1));
                }
            })
            .map_err(|e| PlayerError::Spawn(e.to_string()))?;

        self.running = running;
        self.thread = Some(thread);
        self.config = Some(config);
        Ok(())
    }

    fn config(&self) -> Option<SinkConfig> {
        self.config
    }

    fn clear(&mut self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&mut self) {
        self.stop_thread();
        self.config = None;
    }
}

impl Drop for PullSink {
    fn drop(&mut self) {
        self.stop_thread();
    }
}
