//! Background threads that keep a ring buffer topped up.
//!
//! ```text
//!   ring-fill:    wait_for_space ─► lock source ─► stream() ─► try_write ─┐
//!                        ▲                                                │
//!                        └────────────────────────────────────────────────┘
//!   ring-monitor: step_capacity ─► health_check (every interval) ─► park
//! ```
//!
//! The producer holds the source lock from `stream` until the frames are in
//! the ring, so a seek (which takes the same lock before resetting the ring)
//! can never interleave stale frames with the new position. Frames that did
//! not fit are carried over only while the ring epoch is unchanged.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use super::PlayerError;
use super::frame::Frame;
use super::ring_buffer::RingBuffer;
use super::source::SharedSource;
use crate::config::BufferConfig;

/// Fill loop tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct FillSettings {
    /// Most frames requested from the source per iteration
    pub chunk_frames: usize,
    /// Interval between stability checks
    pub health_interval: Duration,
    /// Delay between incremental capacity steps
    pub resize_step_delay: Duration,
}

impl FillSettings {
    pub fn from_config(config: &BufferConfig) -> Self {
        Self {
            chunk_frames: config.chunk_frames.max(1),
            health_interval: Duration::from_secs(config.health_interval_secs.max(1)),
            resize_step_delay: Duration::from_millis(config.resize_step_delay_ms),
        }
    }
}

/// Handle to the producer and monitor threads of one playback session.
pub struct FillLoop {
    ring: Arc<RingBuffer>,
    source: SharedSource,
    settings: FillSettings,
    producer: Option<JoinHandle<()>>,
    /// Set by the producer, under the source lock, right before it exits
    producer_done: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
}

impl FillLoop {
    /// Start filling `ring` from `source`.
    pub fn spawn(
        ring: Arc<RingBuffer>,
        source: SharedSource,
        settings: FillSettings,
    ) -> Result<Self, PlayerError> {
        let monitor = {
            let ring = Arc::clone(&ring);
            let settings = settings.clone();
            thread::Builder::new()
                .name("ring-monitor".to_string())
                .spawn(move || run_monitor(&ring, &settings))
                .map_err(|e| PlayerError::Spawn(e.to_string()))?
        };

        let mut this = Self {
            ring,
            source,
            settings,
            producer: None,
            producer_done: Arc::new(AtomicBool::new(true)),
            monitor: Some(monitor),
        };
        this.start_producer()?;
        Ok(this)
    }

    fn start_producer(&mut self) -> Result<(), PlayerError> {
        if let Some(handle) = self.producer.take() {
            let _ = handle.join();
        }

        let done = Arc::new(AtomicBool::new(false));
        let ring = Arc::clone(&self.ring);
        let source = Arc::clone(&self.source);
        let chunk_frames = self.settings.chunk_frames;
        let producer_done = Arc::clone(&done);

        let handle = thread::Builder::new()
            .name("ring-fill".to_string())
            .spawn(move || run_producer(&ring, &source, chunk_frames, &producer_done))
            .map_err(|e| PlayerError::Spawn(e.to_string()))?;

        self.producer = Some(handle);
        self.producer_done = done;
        Ok(())
    }

    /// True once the producer has stopped (end of stream, error or shutdown).
    pub fn is_finished(&self) -> bool {
        self.producer_done.load(Ordering::Acquire)
    }

    /// Restart the producer if it already stopped, e.g. after a seek out of
    /// the exhausted tail. Call after the ring has been reset.
    pub fn rearm(&mut self) -> Result<(), PlayerError> {
        if self.ring.is_shut_down() || !self.is_finished() {
            return Ok(());
        }
        debug!("Restarting fill producer");
        self.start_producer()
    }

    /// Shut the ring down and wait for both threads. Safe to call twice.
    pub fn stop(&mut self) {
        self.ring.shutdown();
        if let Some(handle) = self.producer.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.monitor.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FillLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for FillLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FillLoop")
            .field("producer_finished", &self.is_finished())
            .field("stopped", &self.monitor.is_none())
            .finish()
    }
}

fn run_producer(ring: &RingBuffer, source: &SharedSource, chunk_frames: usize, done: &AtomicBool) {
    let mut scratch = vec![Frame::SILENCE; chunk_frames];
    let mut pending: Vec<Frame> = Vec::new();
    let mut pending_epoch = 0;
    // The source reported its end but `pending` still has its last frames
    let mut source_done = false;

    debug!("Fill loop started");

    while let Some(space) = ring.wait_for_space() {
        let mut src = source.lock();
        if ring.is_shut_down() {
            break;
        }

        let epoch = ring.epoch();
        if pending_epoch != epoch {
            pending.clear();
            source_done = false;
        }

        if !pending.is_empty() {
            let written = ring.try_write(&pending);
            pending.drain(..written);
            if pending.is_empty() && source_done {
                ring.mark_closed();
                info!("Source exhausted");
                done.store(true, Ordering::Release);
                return;
            }
            continue;
        }

        let want = space.min(chunk_frames);
        let status = match src.stream(&mut scratch[..want]) {
            Ok(status) => status,
            Err(e) => {
                error!("Fill loop stopping: {}", e);
                ring.mark_closed();
                done.store(true, Ordering::Release);
                return;
            }
        };

        let produced = &scratch[..status.frames];
        let written = ring.try_write(produced);
        if written < produced.len() {
            pending.extend_from_slice(&produced[written..]);
            pending_epoch = epoch;
        }

        if !status.more {
            if pending.is_empty() {
                ring.mark_closed();
                info!("Source exhausted");
                done.store(true, Ordering::Release);
                return;
            }
            source_done = true;
        } else if status.frames == 0 {
            drop(src);
            thread::yield_now();
        }
    }

    debug!("Fill loop stopped");
    done.store(true, Ordering::Release);
}

fn run_monitor(ring: &RingBuffer, settings: &FillSettings) {
    let mut next_health = Instant::now() + settings.health_interval;

    while !ring.is_shut_down() {
        let converging = ring.step_capacity();

        let now = Instant::now();
        if now >= next_health {
            ring.health_check();
            next_health = now + settings.health_interval;
        }

        let wait = if converging {
            settings.resize_step_delay
        } else {
            next_health.saturating_duration_since(now)
        };
        ring.park_monitor(wait);
    }

    debug!("Ring monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::ring_buffer::ReadOutcome;
    use crate::test_utils::{FailingSource, VecSource, ramp_frame, shared, test_ring};

    fn settings() -> FillSettings {
        FillSettings {
            chunk_frames: 64,
            health_interval: Duration::from_secs(5),
            resize_step_delay: Duration::from_millis(1),
        }
    }

    fn read_all(ring: &RingBuffer) -> Vec<Frame> {
        let mut out = Vec::new();
        let mut buf = vec![Frame::SILENCE; 50];
        loop {
            match ring.read(&mut buf) {
                ReadOutcome::Frames(n) => out.extend_from_slice(&buf[..n]),
                ReadOutcome::EndOfStream => return out,
                ReadOutcome::Interrupted => panic!("unexpected interrupt"),
            }
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_delivers_whole_source_in_order() {
        let ring = Arc::new(test_ring(256));
        let source = shared(VecSource::ramp(3000, 48_000));
        let fill = FillLoop::spawn(Arc::clone(&ring), source, settings()).unwrap();

        let frames = read_all(&ring);

        assert_eq!(frames.len(), 3000);
        assert!(frames.iter().enumerate().all(|(i, f)| *f == ramp_frame(i as u64)));
        assert!(wait_until(|| fill.is_finished()));
    }

    #[test]
    fn test_source_error_closes_ring() {
        let ring = Arc::new(test_ring(256));
        let source = shared(FailingSource::after(100));
        let fill = FillLoop::spawn(Arc::clone(&ring), source, settings()).unwrap();

        let frames = read_all(&ring);

        assert_eq!(frames.len(), 100);
        assert!(wait_until(|| fill.is_finished()));
    }

    #[test]
    fn test_rearm_after_exhaustion_resumes_from_seek() {
        let ring = Arc::new(test_ring(256));
        let source = shared(VecSource::ramp(500, 48_000));
        let mut fill = FillLoop::spawn(Arc::clone(&ring), Arc::clone(&source), settings()).unwrap();

        assert_eq!(read_all(&ring).len(), 500);
        assert!(wait_until(|| fill.is_finished()));

        {
            let mut src = source.lock();
            src.seek(400).unwrap();
            ring.reset(400);
        }
        fill.rearm().unwrap();

        let tail = read_all(&ring);
        assert_eq!(tail.len(), 100);
        assert_eq!(tail[0], ramp_frame(400));
        assert_eq!(ring.position(), 500);
    }

    #[test]
    fn test_seek_discards_stale_frames() {
        let ring = Arc::new(test_ring(64));
        let source = shared(VecSource::ramp(10_000, 48_000));
        let _fill = FillLoop::spawn(Arc::clone(&ring), Arc::clone(&source), settings()).unwrap();

        assert!(wait_until(|| ring.snapshot().occupancy == 64));
        {
            let mut src = source.lock();
            src.seek(9_000).unwrap();
            ring.reset(9_000);
        }

        let frames = read_all(&ring);
        assert_eq!(frames.len(), 1_000);
        assert_eq!(frames[0], ramp_frame(9_000));
        assert_eq!(frames[999], ramp_frame(9_999));
    }

    #[test]
    fn test_monitor_steps_toward_grown_target() {
        let ring = Arc::new(test_ring(64));
        let source = shared(VecSource::ramp(1_000_000, 48_000));
        let _fill = FillLoop::spawn(Arc::clone(&ring), source, settings()).unwrap();

        let now = Instant::now();
        for i in 0..3 {
            ring.inject_underrun(now + Duration::from_millis(i * 10));
        }
        let target = ring.snapshot().target_capacity;
        assert!(target > 64);

        assert!(wait_until(|| ring.snapshot().active_capacity == target));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let ring = Arc::new(test_ring(64));
        let source = shared(VecSource::ramp(1_000_000, 48_000));
        let mut fill = FillLoop::spawn(Arc::clone(&ring), source, settings()).unwrap();

        fill.stop();
        fill.stop();

        assert!(ring.is_shut_down());
        assert!(fill.is_finished());
        let mut buf = vec![Frame::SILENCE; 8];
        assert_eq!(ring.read(&mut buf), ReadOutcome::Interrupted);
    }
}
