//! Underrun detection and ring buffer resize policy.
//!
//! The controller only decides; it never touches frames. The ring buffer
//! calls into it under its own lock:
//!
//! - [`ResizeController::on_read`] after every successful read
//! - [`ResizeController::on_underrun`] whenever a read finds the buffer empty
//!   while the source is still producing
//! - [`ResizeController::health_check`] from the monitor thread on a fixed tick
//!
//! Growth reacts within a couple of underruns; shrinking needs tens of seconds
//! of clean playback with a nearly full buffer. An oversized buffer only costs
//! memory, a gap is audible.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::BufferConfig;

/// Sleep applied before retrying a read after an underrun, indexed by the
/// consecutive underrun count (1-based). The last entry is the floor.
const BACKOFF_STEPS: [Duration; 4] = [
    Duration::from_millis(100),
    Duration::from_millis(50),
    Duration::from_millis(25),
    Duration::from_millis(10),
];

/// Smallest backoff the controller will ever ask for.
pub const MIN_BACKOFF: Duration = Duration::from_millis(10);

/// Consecutive underruns needed before the target capacity grows.
const GROW_THRESHOLD: u32 = 2;

/// Longest gap between reads still counted as playback. Anything longer is
/// a pause or a stall.
const READ_GAP: Duration = Duration::from_secs(1);

/// Underrun counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnderrunStats {
    /// Every empty read while the source was still producing
    pub total_underruns: u64,
    /// Underruns that each followed the previous one within the window
    pub consecutive_underruns: u32,
    /// When the last underrun happened
    pub last_underrun: Option<Instant>,
    /// Highest occupancy seen by a read
    pub max_observed_occupancy: usize,
}

/// Resize policy in frames, derived from [`BufferConfig`] for one sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct ResizePolicy {
    pub min_capacity: usize,
    pub default_capacity: usize,
    pub max_capacity: usize,
    pub grow_increment: usize,
    pub shrink_decrement: usize,
    pub underrun_window: Duration,
    pub grow_cooldown: Duration,
    pub stable_period: Duration,
    pub warmup: Duration,
    pub high_fullness: f32,
}

impl ResizePolicy {
    pub fn from_config(config: &BufferConfig, sample_rate: u32) -> Self {
        let frames = |secs: f32| ((secs.max(0.0) as f64) * sample_rate as f64) as usize;

        let min_capacity = frames(config.min_secs).max(1);
        let max_capacity = frames(config.max_secs).max(min_capacity);
        let default_capacity = frames(config.default_secs).clamp(min_capacity, max_capacity);

        Self {
            min_capacity,
            default_capacity,
            max_capacity,
            grow_increment: frames(config.grow_secs).max(1),
            shrink_decrement: frames(config.shrink_secs).max(1),
            underrun_window: Duration::from_millis(config.underrun_window_ms),
            grow_cooldown: Duration::from_millis(config.grow_cooldown_ms),
            stable_period: Duration::from_secs(config.stable_period_secs),
            warmup: Duration::from_secs(config.warmup_secs),
            high_fullness: config.high_fullness_ratio,
        }
    }
}

/// What the reader should do after an underrun.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnderrunAction {
    /// Sleep before the next read attempt
    pub backoff: Duration,
    /// Whether the target capacity was raised by this underrun
    pub grew: bool,
}

/// Tracks underruns and owns the ring buffer's target capacity.
#[derive(Debug, Clone)]
pub struct ResizeController {
    policy: ResizePolicy,
    target: usize,
    stats: UnderrunStats,
    /// Time spent actually reading, counted toward the warm-up period
    played: Duration,
    last_read: Option<Instant>,
    last_grow: Option<Instant>,
}

impl ResizeController {
    pub fn new(policy: ResizePolicy) -> Self {
        Self {
            target: policy.default_capacity,
            policy,
            stats: UnderrunStats::default(),
            played: Duration::ZERO,
            last_read: None,
            last_grow: None,
        }
    }

    pub fn policy(&self) -> &ResizePolicy {
        &self.policy
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn stats(&self) -> UnderrunStats {
        self.stats
    }

    /// Backoff for the given consecutive underrun count.
    pub fn backoff_for(consecutive: u32) -> Duration {
        let index = (consecutive.max(1) as usize - 1).min(BACKOFF_STEPS.len() - 1);
        BACKOFF_STEPS[index]
    }

    /// Record a successful read that found `occupancy` frames buffered.
    pub fn on_read(&mut self, now: Instant, occupancy: usize) {
        if let Some(last) = self.last_read {
            let gap = now.saturating_duration_since(last);
            if gap <= READ_GAP {
                self.played += gap;
            }
        }
        self.last_read = Some(now);
        self.stats.max_observed_occupancy = self.stats.max_observed_occupancy.max(occupancy);
    }

    /// Record an underrun and decide on backoff and growth.
    pub fn on_underrun(&mut self, now: Instant) -> UnderrunAction {
        self.stats.total_underruns += 1;

        let within_window = self
            .stats
            .last_underrun
            .is_some_and(|last| now.saturating_duration_since(last) <= self.policy.underrun_window);
        self.stats.consecutive_underruns = if within_window {
            self.stats.consecutive_underruns.saturating_add(1)
        } else {
            1
        };
        self.stats.last_underrun = Some(now);

        let backoff = Self::backoff_for(self.stats.consecutive_underruns);
        let grew = self.try_grow(now);

        debug!(
            total = self.stats.total_underruns,
            consecutive = self.stats.consecutive_underruns,
            backoff_ms = backoff.as_millis() as u64,
            "Buffer underrun"
        );

        UnderrunAction { backoff, grew }
    }

    fn try_grow(&mut self, now: Instant) -> bool {
        if self.stats.consecutive_underruns < GROW_THRESHOLD || self.target >= self.policy.max_capacity {
            return false;
        }
        let cooling_down = self
            .last_grow
            .is_some_and(|last| now.saturating_duration_since(last) < self.policy.grow_cooldown);
        if cooling_down {
            return false;
        }

        let previous = self.target;
        self.target = (self.target + self.policy.grow_increment).min(self.policy.max_capacity);
        self.last_grow = Some(now);

        warn!(
            from = previous,
            to = self.target,
            consecutive = self.stats.consecutive_underruns,
            "Repeated underruns, growing buffer target"
        );
        true
    }

    /// Periodic stability check. Returns true if the target shrank.
    ///
    /// `occupancy` and `active` describe the buffer at the time of the check.
    pub fn health_check(&mut self, now: Instant, occupancy: usize, active: usize) -> bool {
        let since_underrun = self
            .stats
            .last_underrun
            .map(|last| now.saturating_duration_since(last));

        let stable_since_underrun = since_underrun.is_some_and(|d| d >= self.policy.stable_period);
        if stable_since_underrun && self.stats.consecutive_underruns > 0 {
            debug!("Stable period elapsed, clearing consecutive underruns");
            self.stats.consecutive_underruns = 0;
        }

        // A paused reader says nothing about how stable playback is
        let reading = self
            .last_read
            .is_some_and(|last| now.saturating_duration_since(last) <= READ_GAP);
        if !reading {
            return false;
        }

        let quiet = match since_underrun {
            None => self.played >= self.policy.warmup,
            Some(_) => stable_since_underrun,
        };
        if !quiet || active == 0 {
            return false;
        }

        let fill = occupancy as f32 / active as f32;
        if fill <= self.policy.high_fullness || self.target <= self.policy.min_capacity {
            return false;
        }

        let previous = self.target;
        self.target = self
            .target
            .saturating_sub(self.policy.shrink_decrement)
            .max(self.policy.min_capacity);

        info!(
            from = previous,
            to = self.target,
            fill_pct = (fill * 100.0) as u32,
            "Buffer stable, shrinking target"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ResizePolicy {
        ResizePolicy {
            min_capacity: 1000,
            default_capacity: 2000,
            max_capacity: 4000,
            grow_increment: 500,
            shrink_decrement: 250,
            underrun_window: Duration::from_secs(2),
            grow_cooldown: Duration::from_secs(1),
            stable_period: Duration::from_secs(60),
            warmup: Duration::from_secs(10),
            high_fullness: 0.9,
        }
    }

    fn at(base: Instant, millis: u64) -> Instant {
        base + Duration::from_millis(millis)
    }

    /// Steady reads every 100ms over `[from, to]`.
    fn play_for(ctl: &mut ResizeController, base: Instant, from: u64, to: u64) {
        for ms in (from..=to).step_by(100) {
            ctl.on_read(at(base, ms), 0);
        }
    }

    #[test]
    fn test_backoff_shrinks_to_floor() {
        let mut ctl = ResizeController::new(policy());
        let base = Instant::now();

        let backoffs: Vec<_> = (0..6)
            .map(|i| ctl.on_underrun(at(base, i * 100)).backoff.as_millis())
            .collect();

        assert_eq!(backoffs, vec![100, 50, 25, 10, 10, 10]);
        assert_eq!(ResizeController::backoff_for(0), Duration::from_millis(100));
    }

    #[test]
    fn test_consecutive_resets_outside_window() {
        let mut ctl = ResizeController::new(policy());
        let base = Instant::now();

        ctl.on_underrun(base);
        ctl.on_underrun(at(base, 500));
        assert_eq!(ctl.stats().consecutive_underruns, 2);

        let action = ctl.on_underrun(at(base, 5_000));
        assert_eq!(ctl.stats().consecutive_underruns, 1);
        assert_eq!(action.backoff, Duration::from_millis(100));
        assert_eq!(ctl.stats().total_underruns, 3);
    }

    #[test]
    fn test_five_underruns_in_three_seconds_grow() {
        let mut ctl = ResizeController::new(policy());
        let base = Instant::now();
        let start_target = ctl.target();

        for i in 0..5 {
            ctl.on_underrun(at(base, i * 600));
        }

        assert!(ctl.target() >= start_target + policy().grow_increment);
        assert!(ctl.target() <= policy().max_capacity);
    }

    #[test]
    fn test_single_underrun_does_not_grow() {
        let mut ctl = ResizeController::new(policy());
        let action = ctl.on_underrun(Instant::now());
        assert!(!action.grew);
        assert_eq!(ctl.target(), policy().default_capacity);
    }

    #[test]
    fn test_growth_clamped_to_max() {
        let mut ctl = ResizeController::new(policy());
        let base = Instant::now();

        for i in 0..100 {
            ctl.on_underrun(at(base, i * 1_500));
        }

        assert_eq!(ctl.target(), policy().max_capacity);
    }

    #[test]
    fn test_grow_cooldown_limits_long_stall() {
        let mut ctl = ResizeController::new(policy());
        let base = Instant::now();

        // A stall retried every 10ms for half a second grows only once.
        let grows = (0..50)
            .filter(|i| ctl.on_underrun(at(base, i * 10)).grew)
            .count();

        assert_eq!(grows, 1);
        assert_eq!(ctl.target(), policy().default_capacity + policy().grow_increment);
    }

    #[test]
    fn test_no_shrink_before_warmup() {
        let mut ctl = ResizeController::new(policy());
        let base = Instant::now();
        play_for(&mut ctl, base, 0, 5_000);

        assert!(!ctl.health_check(at(base, 5_000), 1990, 2000));
        assert_eq!(ctl.target(), policy().default_capacity);
    }

    #[test]
    fn test_shrink_after_warmup_without_underruns() {
        let mut ctl = ResizeController::new(policy());
        let base = Instant::now();
        play_for(&mut ctl, base, 0, 11_000);

        assert!(ctl.health_check(at(base, 11_000), 1990, 2000));
        assert_eq!(ctl.target(), 1750);
    }

    #[test]
    fn test_no_shrink_when_buffer_not_full() {
        let mut ctl = ResizeController::new(policy());
        let base = Instant::now();
        play_for(&mut ctl, base, 0, 11_000);

        assert!(!ctl.health_check(at(base, 11_000), 1000, 2000));
    }

    #[test]
    fn test_shrink_stops_at_min() {
        let mut ctl = ResizeController::new(policy());
        let base = Instant::now();
        play_for(&mut ctl, base, 0, 11_000);

        for i in 0..20 {
            let now = at(base, 11_000 + i * 5_000);
            ctl.on_read(now, 0);
            ctl.health_check(now, 1000, 1000);
        }

        assert_eq!(ctl.target(), policy().min_capacity);
    }

    #[test]
    fn test_shrink_needs_stable_period_after_underrun() {
        let mut ctl = ResizeController::new(policy());
        let base = Instant::now();
        ctl.on_read(base, 0);
        ctl.on_underrun(at(base, 20_000));

        ctl.on_read(at(base, 50_000), 0);
        assert!(!ctl.health_check(at(base, 50_000), 2000, 2000));
        ctl.on_read(at(base, 81_000), 0);
        assert!(ctl.health_check(at(base, 81_000), 2000, 2000));
    }

    #[test]
    fn test_pause_does_not_count_toward_warmup() {
        let mut ctl = ResizeController::new(policy());
        let base = Instant::now();
        play_for(&mut ctl, base, 0, 2_000);

        // Paused for a minute with a full buffer, then one read
        assert!(!ctl.health_check(at(base, 30_000), 2000, 2000));
        ctl.on_read(at(base, 60_000), 2000);
        assert!(!ctl.health_check(at(base, 60_000), 2000, 2000));
        assert_eq!(ctl.target(), policy().default_capacity);
    }

    #[test]
    fn test_no_shrink_while_paused_after_warmup() {
        let mut ctl = ResizeController::new(policy());
        let base = Instant::now();
        play_for(&mut ctl, base, 0, 11_000);

        for i in 1..=20 {
            ctl.health_check(at(base, 11_000 + i * 5_000), 2000, 2000);
        }
        assert_eq!(ctl.target(), policy().default_capacity);
    }

    #[test]
    fn test_consecutive_cleared_only_after_stable_period() {
        let mut ctl = ResizeController::new(policy());
        let base = Instant::now();
        ctl.on_underrun(base);
        ctl.on_underrun(at(base, 100));
        ctl.on_read(at(base, 200), 10);

        ctl.health_check(at(base, 10_000), 10, 2000);
        assert_eq!(ctl.stats().consecutive_underruns, 2);

        ctl.health_check(at(base, 61_000), 10, 2000);
        assert_eq!(ctl.stats().consecutive_underruns, 0);
    }

    #[test]
    fn test_growth_monotonic_under_stress() {
        let mut ctl = ResizeController::new(policy());
        let base = Instant::now();
        ctl.on_read(base, 0);
        let mut last_target = ctl.target();

        // Underruns every 700ms with full-buffer health checks in between.
        for i in 0..40 {
            ctl.on_underrun(at(base, i * 700));
            ctl.health_check(at(base, i * 700 + 350), 4000, 4000);
            assert!(ctl.target() >= last_target);
            last_target = ctl.target();
        }
    }

    #[test]
    fn test_max_observed_occupancy() {
        let mut ctl = ResizeController::new(policy());
        let now = Instant::now();
        ctl.on_read(now, 300);
        ctl.on_read(now, 1200);
        ctl.on_read(now, 50);
        assert_eq!(ctl.stats().max_observed_occupancy, 1200);
    }

    #[test]
    fn test_policy_from_config() {
        let config = BufferConfig::default();
        let policy = ResizePolicy::from_config(&config, 48_000);

        assert!(policy.min_capacity <= policy.default_capacity);
        assert!(policy.default_capacity <= policy.max_capacity);
        assert_eq!(policy.grow_increment, 24_000);
        assert_eq!(policy.shrink_decrement, 12_000);
    }
}
