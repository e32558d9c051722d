//! Gapless file playback through an adaptive ring buffer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Player (caller threads)                     │
//! │   load / play / pause / seek / volume, owns one Session         │
//! └────────────────────────────┬────────────────────────────────────┘
//!                              │ source lock → ring lock
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │   ring-fill thread: FrameSource::stream ─► RingBuffer           │
//! │   ring-monitor thread: health checks, capacity steps            │
//! └────────────────────────────┬────────────────────────────────────┘
//!                              │ RingBuffer::read (blocking, backoff)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │   audio-output thread: render callback ─► gain ─► device        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod decoder;
mod fill;
mod frame;
mod gain;
mod oracle;
mod output;
mod ring_buffer;
mod source;
mod state;
mod underrun;

pub use decoder::AudioDecoder;
pub use fill::{FillLoop, FillSettings};
pub use frame::{Frame, frames_to_secs, secs_to_frames};
pub use gain::Gain;
pub use oracle::{DurationOracle, LoftyOracle};
pub use output::{
    CpalSink, OutputSink, RenderFn, SinkConfig, current_audio_device, list_audio_devices,
};
pub use ring_buffer::{ReadOutcome, RingBuffer, RingSettings, RingSnapshot};
pub use source::{
    CorrectionOrigin, FrameSource, LengthCorrection, LengthNotifier, SharedSource, StreamStatus,
};
pub use state::{PlaybackState, PlaybackStatus, format_duration};
pub use underrun::{ResizeController, ResizePolicy, UnderrunStats};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Frames from the end at which a playing track counts as finished.
const END_TOLERANCE_FRAMES: u64 = 100;

/// Pending length corrections kept before new ones are dropped.
const CORRECTION_CAPACITY: usize = 16;

/// The playback controller.
///
/// All methods take `&self`; the player can be shared between a control
/// thread and a UI thread behind an `Arc`.
pub struct Player {
    config: Config,
    inner: Mutex<Inner>,
    /// State read by the output callback once per block
    render: Arc<Mutex<RenderState>>,
    seek_in_progress: AtomicBool,
    oracle: Option<Arc<dyn DurationOracle>>,
    next_session: AtomicU64,
    corrections_tx: Sender<LengthCorrection>,
    corrections_rx: Receiver<LengthCorrection>,
}

struct Inner {
    sink: Box<dyn OutputSink>,
    /// Sample rate the sink was last started with
    sink_rate: Option<u32>,
    session: Option<Session>,
    gain: Gain,
}

/// Everything that belongs to one loaded file.
struct Session {
    id: u64,
    path: Option<PathBuf>,
    source: SharedSource,
    ring: Arc<RingBuffer>,
    fill: FillLoop,
    sample_rate: u32,
    playing: bool,
}

struct RenderState {
    paused: bool,
    gain: Gain,
    ring: Option<Arc<RingBuffer>>,
}

impl Player {
    /// Create a player that renders into `sink`.
    ///
    /// The sink is not opened until the first load.
    pub fn new(
        config: Config,
        sink: Box<dyn OutputSink>,
        oracle: Option<Arc<dyn DurationOracle>>,
    ) -> Self {
        let gain = Gain::from_volume(config.audio.volume);
        let (corrections_tx, corrections_rx) = bounded(CORRECTION_CAPACITY);

        Self {
            config,
            inner: Mutex::new(Inner {
                sink,
                sink_rate: None,
                session: None,
                gain,
            }),
            render: Arc::new(Mutex::new(RenderState {
                paused: true,
                gain,
                ring: None,
            })),
            seek_in_progress: AtomicBool::new(false),
            oracle,
            next_session: AtomicU64::new(0),
            corrections_tx,
            corrections_rx,
        }
    }

    /// Create a player on the configured cpal device with lofty duration probing.
    pub fn with_default_output(config: Config) -> Self {
        let sink = CpalSink::new(config.audio.output_device.clone());
        Self::new(config, Box::new(sink), Some(Arc::new(LoftyOracle)))
    }

    /// Load a file, replacing whatever was loaded. Playback starts paused.
    ///
    /// If the file can't be decoded the previous session keeps playing.
    pub fn load(&self, path: &Path) -> Result<(), PlayerError> {
        let decoder = AudioDecoder::open(path)?;
        self.load_source(path, Box::new(decoder))
    }

    /// Load an already opened source. `path` is used for display and the
    /// duration probe.
    pub fn load_source(
        &self,
        path: impl Into<PathBuf>,
        mut source: Box<dyn FrameSource>,
    ) -> Result<(), PlayerError> {
        let path = path.into();
        let mut inner = self.inner.lock();

        // The old fill loop must be joined before anything new starts
        if let Some(old) = inner.session.take() {
            self.teardown(old);
        }

        let sample_rate = source.sample_rate();
        if inner.sink_rate != Some(sample_rate) {
            inner.sink_rate = None;
            let sink_config = SinkConfig {
                sample_rate,
                block_size: self.config.audio.block_size,
            };
            inner.sink.start(sink_config, self.render_fn())?;
            inner.sink_rate = Some(sample_rate);
        }

        let id = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let notifier = LengthNotifier::new(id, self.corrections_tx.clone());
        source.set_length_listener(notifier.clone());
        let estimate = source.length();

        let source: SharedSource = Arc::new(Mutex::new(source));
        let ring = Arc::new(RingBuffer::from_config(&self.config.buffer, sample_rate));
        let fill = FillLoop::spawn(
            Arc::clone(&ring),
            Arc::clone(&source),
            FillSettings::from_config(&self.config.buffer),
        )?;

        {
            let mut render = self.render.lock();
            render.paused = true;
            render.gain = inner.gain;
            render.ring = Some(Arc::clone(&ring));
        }

        if let Some(oracle) = &self.oracle {
            spawn_duration_probe(Arc::clone(oracle), path.clone(), sample_rate, notifier);
        }

        info!(
            session = id,
            "Loaded {} (~{:.1}s at {}Hz)",
            path.display(),
            frames_to_secs(estimate, sample_rate),
            sample_rate
        );

        inner.session = Some(Session {
            id,
            path: Some(path),
            source,
            ring,
            fill,
            sample_rate,
            playing: false,
        });
        Ok(())
    }

    fn render_fn(&self) -> RenderFn {
        let render = Arc::clone(&self.render);
        Box::new(move |out: &mut [Frame]| render_block(&render, out))
    }

    /// Detach a session from the output and stop its threads.
    fn teardown(&self, mut session: Session) {
        {
            let mut render = self.render.lock();
            render.paused = true;
            render.ring = None;
        }
        session.fill.stop();
        debug!(session = session.id, "Session torn down");
    }

    /// Start or resume playback.
    pub fn play(&self) -> Result<(), PlayerError> {
        self.set_playing(true)
    }

    /// Pause playback.
    pub fn pause(&self) -> Result<(), PlayerError> {
        self.set_playing(false)
    }

    /// Toggle play/pause.
    pub fn toggle(&self) -> Result<(), PlayerError> {
        let playing = {
            let inner = self.inner.lock();
            inner
                .session
                .as_ref()
                .ok_or(PlayerError::NotLoaded)?
                .playing
        };
        self.set_playing(!playing)
    }

    fn set_playing(&self, playing: bool) -> Result<(), PlayerError> {
        let mut inner = self.inner.lock();
        let session = inner.session.as_mut().ok_or(PlayerError::NotLoaded)?;
        session.playing = playing;
        self.render.lock().paused = !playing;
        if !playing {
            session.ring.interrupt();
        }
        debug!(playing, "Playback state changed");
        Ok(())
    }

    /// Pause and rewind to the start.
    pub fn stop(&self) -> Result<(), PlayerError> {
        self.pause()?;
        self.seek(Duration::ZERO)
    }

    /// Jump to `position`, clamped to the track.
    ///
    /// A target the source can't reach restarts the track from the beginning.
    /// Play/pause state is preserved.
    pub fn seek(&self, position: Duration) -> Result<(), PlayerError> {
        if self
            .seek_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PlayerError::SeekInProgress);
        }
        let _guard = SeekGuard(&self.seek_in_progress);

        let (id, source, ring, sample_rate, was_playing) = {
            let mut inner = self.inner.lock();
            let Inner { sink, session, .. } = &mut *inner;
            let session = session.as_ref().ok_or(PlayerError::NotLoaded)?;
            if session.playing {
                self.render.lock().paused = true;
                session.ring.interrupt();
                sink.clear();
            }
            (
                session.id,
                Arc::clone(&session.source),
                Arc::clone(&session.ring),
                session.sample_rate,
                session.playing,
            )
        };

        self.apply_corrections(id, &source);

        {
            let mut src = source.lock();
            let target = secs_to_frames(position.as_secs_f64(), sample_rate).min(src.length());

            if let Err(e) = src.seek(target) {
                warn!("Seek to frame {} failed, restarting from the beginning: {}", target, e);
                if let Err(e) = src.seek(0) {
                    warn!("Rewind after failed seek also failed: {}", e);
                }
            }

            ring.reset(src.position());
            debug!(target, landed = src.position(), "Seek applied");
        }

        {
            let mut inner = self.inner.lock();
            match inner.session.as_mut() {
                Some(session) if session.id == id => session.fill.rearm()?,
                _ => return Ok(()),
            }
        }

        if was_playing {
            thread::sleep(Duration::from_millis(self.config.buffer.seek_grace_ms));

            let inner = self.inner.lock();
            if let Some(session) = inner.session.as_ref()
                && session.id == id
                && session.playing
            {
                self.render.lock().paused = false;
            }
        }

        Ok(())
    }

    /// Whether a seek is being applied right now.
    pub fn is_seeking(&self) -> bool {
        self.seek_in_progress.load(Ordering::Acquire)
    }

    /// Set volume (0.0 - 1.0). Works while unloaded; the next load keeps it.
    pub fn set_volume(&self, volume: f32) {
        let gain = Gain::from_volume(volume);
        self.inner.lock().gain = gain;
        self.render.lock().gain = gain;
    }

    /// Get current volume.
    pub fn volume(&self) -> f32 {
        self.inner.lock().gain.to_volume()
    }

    pub fn volume_up(&self) -> f32 {
        self.set_volume(self.volume() + self.config.audio.volume_step);
        self.volume()
    }

    pub fn volume_down(&self) -> f32 {
        self.set_volume(self.volume() - self.config.audio.volume_step);
        self.volume()
    }

    /// Playback position, derived from the frames the output has consumed.
    pub fn position(&self) -> Result<Duration, PlayerError> {
        let inner = self.inner.lock();
        let session = inner.session.as_ref().ok_or(PlayerError::NotLoaded)?;
        Ok(Duration::from_secs_f64(frames_to_secs(
            session.ring.position(),
            session.sample_rate,
        )))
    }

    /// Best known duration of the loaded track.
    pub fn duration(&self) -> Result<Duration, PlayerError> {
        let (id, source, sample_rate) = self.session_source()?;
        self.apply_corrections(id, &source);
        let length = source.lock().length();
        Ok(Duration::from_secs_f64(frames_to_secs(length, sample_rate)))
    }

    /// True once playback has reached the end of the track.
    pub fn has_ended(&self) -> Result<bool, PlayerError> {
        let (id, source, ring, playing) = {
            let inner = self.inner.lock();
            let session = inner.session.as_ref().ok_or(PlayerError::NotLoaded)?;
            (
                session.id,
                Arc::clone(&session.source),
                Arc::clone(&session.ring),
                session.playing,
            )
        };
        if !playing {
            return Ok(false);
        }

        self.apply_corrections(id, &source);
        let length = source.lock().length();
        Ok(ring.position() + END_TOLERANCE_FRAMES >= length || ring.is_drained())
    }

    fn session_source(&self) -> Result<(u64, SharedSource, u32), PlayerError> {
        let inner = self.inner.lock();
        let session = inner.session.as_ref().ok_or(PlayerError::NotLoaded)?;
        Ok((session.id, Arc::clone(&session.source), session.sample_rate))
    }

    /// Apply queued length corrections for session `id`; drop stale ones.
    fn apply_corrections(&self, id: u64, source: &SharedSource) {
        for correction in self.corrections_rx.try_iter() {
            if correction.session != id {
                debug!(?correction, "Dropping length correction for an old session");
                continue;
            }
            debug!(
                frames = correction.frames,
                origin = ?correction.origin,
                "Applying length correction"
            );
            source.lock().correct_length(correction.frames);
        }
    }

    /// Stop the fill loop, drop the source and release the output device.
    /// Safe to call more than once; a later `load` opens the device again.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if let Some(session) = inner.session.take() {
            self.teardown(session);
            info!("Player closed");
        }
        inner.sink.close();
        inner.sink_rate = None;
    }

    /// Get a snapshot of the playback state.
    pub fn state(&self) -> PlaybackState {
        let volume = self.volume();
        let seek_in_progress = self.is_seeking();

        let (session_info, ring, source, output_rate) = {
            let inner = self.inner.lock();
            let output_rate = inner.sink.config().map(|c| c.sample_rate);
            let (info, ring, source) = match inner.session.as_ref() {
                Some(s) => (
                    Some((s.id, s.path.clone(), s.sample_rate, s.playing)),
                    Some(Arc::clone(&s.ring)),
                    Some(Arc::clone(&s.source)),
                ),
                None => (None, None, None),
            };
            (info, ring, source, output_rate)
        };

        let (Some((id, path, sample_rate, playing)), Some(ring), Some(source)) =
            (session_info, ring, source)
        else {
            return PlaybackState {
                volume,
                seek_in_progress,
                output_rate,
                ..Default::default()
            };
        };

        self.apply_corrections(id, &source);
        let length = source.lock().length();

        PlaybackState {
            status: if playing {
                PlaybackStatus::Playing
            } else {
                PlaybackStatus::Paused
            },
            current_file: path,
            position: Duration::from_secs_f64(frames_to_secs(ring.position(), sample_rate)),
            duration: Duration::from_secs_f64(frames_to_secs(length, sample_rate)),
            volume,
            seek_in_progress,
            sample_rate,
            output_rate,
            buffer: Some(ring.snapshot()),
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.close();
    }
}

/// Clears the seek flag however the seek ends.
struct SeekGuard<'a>(&'a AtomicBool);

impl Drop for SeekGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Fill one output block from the current ring.
fn render_block(render: &Mutex<RenderState>, out: &mut [Frame]) {
    let ring = {
        let state = render.lock();
        match (&state.ring, state.paused) {
            (Some(ring), false) => Arc::clone(ring),
            _ => {
                out.fill(Frame::SILENCE);
                return;
            }
        }
    };

    let epoch = ring.epoch();
    let mut filled = 0;
    while filled < out.len() {
        match ring.read(&mut out[filled..]) {
            ReadOutcome::Frames(n) => filled += n,
            ReadOutcome::Interrupted | ReadOutcome::EndOfStream => break,
        }
    }
    out[filled..].fill(Frame::SILENCE);

    // Frames read before a pause already count as played and must be heard.
    // Only a seek that reset the ring mid-read makes them stale.
    let state = render.lock();
    if ring.epoch() != epoch {
        out.fill(Frame::SILENCE);
    } else {
        state.gain.apply(out);
    }
}

fn spawn_duration_probe(
    oracle: Arc<dyn DurationOracle>,
    path: PathBuf,
    sample_rate: u32,
    notifier: LengthNotifier,
) {
    let spawned = thread::Builder::new()
        .name("duration-probe".to_string())
        .spawn(move || {
            if let Some(duration) = oracle.probe(&path) {
                debug!("Probed duration of {}: {:?}", path.display(), duration);
                notifier.notify(
                    secs_to_frames(duration.as_secs_f64(), sample_rate),
                    CorrectionOrigin::Oracle,
                );
            }
        });
    if let Err(e) = spawned {
        warn!("Could not start duration probe: {}", e);
    }
}

/// Player errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlayerError {
    #[error("Failed to decode audio: {0}")]
    Decode(String),

    #[error("Seek failed: {0}")]
    Seek(String),

    #[error("No file loaded")]
    NotLoaded,

    #[error("Another seek is already in progress")]
    SeekInProgress,

    #[error("Audio output initialization failed: {0}")]
    OutputInit(String),

    #[error("Audio channel closed")]
    ChannelClosed,

    #[error("Failed to start thread: {0}")]
    Spawn(String),
}
