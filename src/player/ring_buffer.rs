//! Blocking ring buffer between the fill loop and the output callback.
//!
//! ```text
//!   fill loop ──try_write()──►  [ . . F F F F F . . . . . . ]  ──read()──► render callback
//!                                      ▲read     ▲write
//!                               |<--- active_capacity --->|
//!                               |<-------------- allocated (max_capacity) ------------>|
//! ```
//!
//! The backing array is allocated once at the policy's maximum capacity and
//! cursors wrap at the allocation size. `active_capacity` only limits how many
//! frames may be buffered at once, so growing or shrinking it never moves
//! frames that are already queued.
//!
//! All state lives behind one mutex. Readers wait on `data_ready` when the
//! buffer is empty, the producer waits on `space_ready` when it is full, and
//! the monitor thread parks on `monitor_wake` between resize steps.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace};

use super::frame::Frame;
use super::underrun::{ResizeController, ResizePolicy, UnderrunStats};
use crate::config::BufferConfig;

/// Reader-side and resize tuning that is not part of the resize policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RingSettings {
    /// Fill ratio the first read waits for before releasing audio
    pub initial_fill_ratio: f32,
    /// Upper bound on the initial fill wait
    pub initial_fill_timeout: Duration,
    /// Smallest change applied by one resize step, in frames
    pub min_resize_step: usize,
}

impl RingSettings {
    pub fn from_config(config: &BufferConfig, sample_rate: u32) -> Self {
        Self {
            initial_fill_ratio: config.initial_fill_ratio,
            initial_fill_timeout: Duration::from_millis(config.initial_fill_timeout_ms),
            min_resize_step: ((config.min_resize_step_ms as u64 * sample_rate as u64) / 1000)
                .max(1) as usize,
        }
    }
}

/// Result of a blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many frames were copied into the output (at least one unless the output was empty)
    Frames(usize),
    /// The wait was cut short by a reset, interrupt or shutdown
    Interrupted,
    /// The source is exhausted and every frame has been read
    EndOfStream,
}

/// Point-in-time view of the buffer for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSnapshot {
    pub occupancy: usize,
    pub active_capacity: usize,
    pub target_capacity: usize,
    pub min_capacity: usize,
    pub max_capacity: usize,
    pub closed: bool,
    pub shut_down: bool,
    pub underruns: UnderrunStats,
}

impl RingSnapshot {
    /// Occupancy divided by active capacity.
    pub fn fill_ratio(&self) -> f32 {
        if self.active_capacity == 0 {
            0.0
        } else {
            self.occupancy as f32 / self.active_capacity as f32
        }
    }
}

struct Inner {
    frames: Box<[Frame]>,
    read_pos: usize,
    write_pos: usize,
    occupancy: usize,
    active_capacity: usize,
    closed: bool,
    shut_down: bool,
    /// Bumped by reset()
    epoch: u64,
    /// Bumped by reset() and interrupt() so blocked readers can bail out
    wakeups: u64,
    /// Set once the initial fill wait has been satisfied
    primed: bool,
    /// Source frame index of the first frame written after the last reset
    origin: u64,
    /// Frames read since the last reset
    consumed: u64,
    controller: ResizeController,
}

impl Inner {
    fn available(&self) -> usize {
        self.active_capacity.saturating_sub(self.occupancy)
    }

    fn initial_fill_reached(&self, ratio: f32) -> bool {
        let wanted = (self.active_capacity as f32 * ratio) as usize;
        self.occupancy >= wanted.max(1)
            || self.closed
            || self.controller.stats().total_underruns > 0
    }

    fn push(&mut self, frames: &[Frame]) -> usize {
        let n = frames.len().min(self.available());
        let len = self.frames.len();
        for frame in &frames[..n] {
            self.frames[self.write_pos] = *frame;
            self.write_pos = (self.write_pos + 1) % len;
        }
        self.occupancy += n;
        n
    }

    fn pop_into(&mut self, out: &mut [Frame]) -> usize {
        let n = out.len().min(self.occupancy);
        let len = self.frames.len();
        for slot in &mut out[..n] {
            *slot = self.frames[self.read_pos];
            self.read_pos = (self.read_pos + 1) % len;
        }
        self.occupancy -= n;
        self.consumed += n as u64;
        n
    }

    fn debug_check(&self) {
        debug_assert!(self.occupancy <= self.active_capacity);
        debug_assert!(self.active_capacity <= self.frames.len());
    }
}

/// Fixed-allocation stereo ring buffer with an adjustable active window.
pub struct RingBuffer {
    inner: Mutex<Inner>,
    data_ready: Condvar,
    space_ready: Condvar,
    monitor_wake: Condvar,
    settings: RingSettings,
}

impl RingBuffer {
    pub fn new(policy: ResizePolicy, settings: RingSettings) -> Self {
        let max = policy.max_capacity.max(1);
        let active = policy.default_capacity.clamp(1, max);

        debug!(
            active,
            min = policy.min_capacity,
            max,
            "Creating ring buffer"
        );

        Self {
            inner: Mutex::new(Inner {
                frames: vec![Frame::SILENCE; max].into_boxed_slice(),
                read_pos: 0,
                write_pos: 0,
                occupancy: 0,
                active_capacity: active,
                closed: false,
                shut_down: false,
                epoch: 0,
                wakeups: 0,
                primed: false,
                origin: 0,
                consumed: 0,
                controller: ResizeController::new(policy),
            }),
            data_ready: Condvar::new(),
            space_ready: Condvar::new(),
            monitor_wake: Condvar::new(),
            settings,
        }
    }

    /// Build a ring buffer for `sample_rate` from the buffer config.
    pub fn from_config(config: &BufferConfig, sample_rate: u32) -> Self {
        Self::new(
            ResizePolicy::from_config(config, sample_rate),
            RingSettings::from_config(config, sample_rate),
        )
    }

    /// Write as many frames as fit in the active window without blocking.
    ///
    /// Returns the number of frames written.
    pub fn try_write(&self, frames: &[Frame]) -> usize {
        let mut inner = self.inner.lock();
        if inner.shut_down || frames.is_empty() {
            return 0;
        }
        let written = inner.push(frames);
        inner.debug_check();
        drop(inner);

        if written > 0 {
            self.data_ready.notify_all();
        }
        written
    }

    /// Read up to `out.len()` frames, blocking while the buffer is empty.
    ///
    /// An empty buffer whose source is still producing is an underrun: the
    /// resize controller records it and the reader sleeps for the backoff it
    /// returns, with the lock released, before looking again.
    pub fn read(&self, out: &mut [Frame]) -> ReadOutcome {
        if out.is_empty() {
            return ReadOutcome::Frames(0);
        }

        let mut inner = self.inner.lock();
        let wakeups = inner.wakeups;

        if !inner.primed {
            self.wait_initial_fill(&mut inner, wakeups);
            if inner.shut_down || inner.wakeups != wakeups {
                return ReadOutcome::Interrupted;
            }
            inner.primed = true;
        }

        loop {
            if inner.shut_down || inner.wakeups != wakeups {
                return ReadOutcome::Interrupted;
            }

            if inner.occupancy > 0 {
                let occupancy = inner.occupancy;
                inner.controller.on_read(Instant::now(), occupancy);
                let n = inner.pop_into(out);
                drop(inner);
                self.space_ready.notify_all();
                return ReadOutcome::Frames(n);
            }

            if inner.closed {
                return ReadOutcome::EndOfStream;
            }

            let action = inner.controller.on_underrun(Instant::now());
            if action.grew {
                self.monitor_wake.notify_all();
            }
            MutexGuard::unlocked(&mut inner, || std::thread::sleep(action.backoff));
        }
    }

    fn wait_initial_fill(&self, inner: &mut MutexGuard<'_, Inner>, wakeups: u64) {
        let ratio = self.settings.initial_fill_ratio;
        let deadline = Instant::now() + self.settings.initial_fill_timeout;

        while !inner.initial_fill_reached(ratio) {
            if inner.shut_down || inner.wakeups != wakeups {
                return;
            }
            if self.data_ready.wait_until(inner, deadline).timed_out() {
                debug!(
                    occupancy = inner.occupancy,
                    active = inner.active_capacity,
                    "Initial fill wait timed out, starting anyway"
                );
                return;
            }
        }
    }

    /// Block until the active window has free space.
    ///
    /// Returns `None` once the buffer is closed or shut down.
    pub fn wait_for_space(&self) -> Option<usize> {
        let mut inner = self.inner.lock();
        loop {
            if inner.shut_down || inner.closed {
                return None;
            }
            let available = inner.available();
            if available > 0 {
                return Some(available);
            }
            self.space_ready.wait(&mut inner);
        }
    }

    /// Mark the source as exhausted. Readers drain what is left, then see end-of-stream.
    pub fn mark_closed(&self) {
        self.inner.lock().closed = true;
        self.data_ready.notify_all();
        self.space_ready.notify_all();
    }

    /// Drop all buffered frames and restart position tracking at `origin`.
    ///
    /// Clears the closed flag and interrupts any blocked reader. Underrun
    /// statistics and capacities survive.
    pub fn reset(&self, origin: u64) {
        let mut inner = self.inner.lock();
        let dropped = inner.occupancy;
        inner.read_pos = 0;
        inner.write_pos = 0;
        inner.occupancy = 0;
        inner.closed = false;
        inner.origin = origin;
        inner.consumed = 0;
        inner.epoch = inner.epoch.wrapping_add(1);
        inner.wakeups = inner.wakeups.wrapping_add(1);
        drop(inner);

        debug!(dropped, origin, "Ring buffer reset");
        self.data_ready.notify_all();
        self.space_ready.notify_all();
    }

    /// Wake a blocked reader without touching the buffered frames.
    pub fn interrupt(&self) {
        let mut inner = self.inner.lock();
        inner.wakeups = inner.wakeups.wrapping_add(1);
        drop(inner);
        self.data_ready.notify_all();
    }

    /// Tear the buffer down for good and wake every waiter.
    pub fn shutdown(&self) {
        self.inner.lock().shut_down = true;
        self.data_ready.notify_all();
        self.space_ready.notify_all();
        self.monitor_wake.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().shut_down
    }

    /// Closed and fully drained.
    pub fn is_drained(&self) -> bool {
        let inner = self.inner.lock();
        inner.closed && inner.occupancy == 0
    }

    /// Source frame index of the next frame a read would return.
    pub fn position(&self) -> u64 {
        let inner = self.inner.lock();
        inner.origin + inner.consumed
    }

    /// Reset counter, used to detect a seek between two observations.
    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    /// Move the active capacity one step toward the target.
    ///
    /// A step is 10% of the current active capacity or the configured minimum,
    /// whichever is larger. Shrinking never cuts below the current occupancy.
    /// Returns true while the active capacity still differs from the target.
    pub fn step_capacity(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.shut_down {
            return false;
        }

        let target = inner.controller.target();
        let active = inner.active_capacity;
        let step = (active / 10).max(self.settings.min_resize_step);

        let next = if active < target {
            (active + step).min(target)
        } else if active > target {
            active.saturating_sub(step).max(target).max(inner.occupancy)
        } else {
            return false;
        };

        if next != active {
            trace!(from = active, to = next, target, "Resize step");
            inner.active_capacity = next;
            inner.debug_check();
        }
        let grew = next > active;
        let converging = next != target;
        drop(inner);

        if grew {
            self.space_ready.notify_all();
        }
        converging
    }

    /// Run the resize controller's stability check against the current fill.
    pub fn health_check(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.shut_down {
            return false;
        }
        let (occupancy, active) = (inner.occupancy, inner.active_capacity);
        let shrunk = inner.controller.health_check(Instant::now(), occupancy, active);
        drop(inner);

        if shrunk {
            self.monitor_wake.notify_all();
        }
        shrunk
    }

    /// Park the monitor thread for up to `timeout`, or until the target
    /// changes or the buffer shuts down.
    pub fn park_monitor(&self, timeout: Duration) {
        let mut inner = self.inner.lock();
        if inner.shut_down {
            return;
        }
        self.monitor_wake.wait_for(&mut inner, timeout);
    }

    pub fn snapshot(&self) -> RingSnapshot {
        let inner = self.inner.lock();
        let policy = inner.controller.policy();
        RingSnapshot {
            occupancy: inner.occupancy,
            active_capacity: inner.active_capacity,
            target_capacity: inner.controller.target(),
            min_capacity: policy.min_capacity,
            max_capacity: inner.frames.len(),
            closed: inner.closed,
            shut_down: inner.shut_down,
            underruns: inner.controller.stats(),
        }
    }

    /// Record an underrun without a reader, for driving the controller in tests.
    #[cfg(test)]
    pub(crate) fn inject_underrun(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        let grew = inner.controller.on_underrun(now).grew;
        drop(inner);
        if grew {
            self.monitor_wake.notify_all();
        }
        grew
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("RingBuffer")
            .field("occupancy", &snapshot.occupancy)
            .field("active_capacity", &snapshot.active_capacity)
            .field("target_capacity", &snapshot.target_capacity)
            .field("closed", &snapshot.closed)
            .finish()
    }
}


/// Property-based tests using proptest
#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Write(usize),
        Read(usize),
        Underrun,
        Health,
        Step,
        Reset,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..64).prop_map(Op::Write),
            (1usize..64).prop_map(Op::Read),
            Just(Op::Underrun),
            Just(Op::Health),
            Just(Op::Step),
            Just(Op::Reset),
        ]
    }

    proptest! {
        /// 0 <= occupancy <= active <= max, and active/target stay within [min, max]
        #[test]
        fn occupancy_invariant_holds(ops in prop::collection::vec(op(), 1..300)) {
            let policy = ResizePolicy {
                min_capacity: 16,
                default_capacity: 32,
                max_capacity: 96,
                grow_increment: 8,
                shrink_decrement: 4,
                underrun_window: Duration::from_secs(2),
                grow_cooldown: Duration::ZERO,
                stable_period: Duration::ZERO,
                warmup: Duration::ZERO,
                high_fullness: 0.5,
            };
            let settings = RingSettings {
                initial_fill_ratio: 0.0,
                initial_fill_timeout: Duration::ZERO,
                min_resize_step: 2,
            };
            let rb = RingBuffer::new(policy.clone(), settings);
            let mut written = 0u64;

            for op in ops {
                match op {
                    Op::Write(n) => {
                        let frames = vec![Frame::mono(0.25); n];
                        written += rb.try_write(&frames) as u64;
                    }
                    Op::Read(n) => {
                        // Only read what is there so the test never blocks.
                        let available = rb.snapshot().occupancy.min(n);
                        if available > 0 {
                            let mut out = vec![Frame::SILENCE; available];
                            prop_assert_eq!(rb.read(&mut out), ReadOutcome::Frames(available));
                        }
                    }
                    Op::Underrun => { rb.inject_underrun(Instant::now()); }
                    Op::Health => { rb.health_check(); }
                    Op::Step => { rb.step_capacity(); }
                    Op::Reset => { rb.reset(written); }
                }

                let s = rb.snapshot();
                prop_assert!(s.occupancy <= s.active_capacity);
                prop_assert!(s.active_capacity <= s.max_capacity);
                prop_assert!(s.target_capacity >= policy.min_capacity);
                prop_assert!(s.target_capacity <= policy.max_capacity);
                prop_assert!(s.active_capacity >= policy.min_capacity);
            }
        }
    }
}
