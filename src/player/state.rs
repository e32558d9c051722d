//! Player state snapshot types.

use std::path::PathBuf;
use std::time::Duration;

use super::ring_buffer::RingSnapshot;

/// Current playback status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
    #[default]
    Unloaded,
    Paused,
    Playing,
}

/// Point-in-time view of the player, returned by `Player::state`.
#[derive(Debug, Clone)]
pub struct PlaybackState {
    /// Current playback status
    pub status: PlaybackStatus,
    /// Loaded file (if any)
    pub current_file: Option<PathBuf>,
    /// Current position in the track
    pub position: Duration,
    /// Best known total duration of the track
    pub duration: Duration,
    /// Volume level (0.0 - 1.0)
    pub volume: f32,
    /// A seek is being applied right now
    pub seek_in_progress: bool,
    /// Sample rate of the loaded source
    pub sample_rate: u32,
    /// Rate the output device actually runs at
    pub output_rate: Option<u32>,
    /// Ring buffer diagnostics
    pub buffer: Option<RingSnapshot>,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            status: PlaybackStatus::Unloaded,
            current_file: None,
            position: Duration::ZERO,
            duration: Duration::ZERO,
            volume: 1.0,
            seek_in_progress: false,
            sample_rate: 0,
            output_rate: None,
            buffer: None,
        }
    }
}

impl PlaybackState {
    /// Get position as a fraction (0.0 - 1.0).
    pub fn position_fraction(&self) -> f32 {
        if self.duration.is_zero() {
            0.0
        } else {
            (self.position.as_secs_f32() / self.duration.as_secs_f32()).min(1.0)
        }
    }

    /// Format position as MM:SS.
    pub fn position_str(&self) -> String {
        format_duration(self.position)
    }

    /// Format duration as MM:SS.
    pub fn duration_str(&self) -> String {
        format_duration(self.duration)
    }

    /// One-line buffer summary for display.
    pub fn buffer_info(&self) -> String {
        let Some(buffer) = &self.buffer else {
            return "no buffer".to_string();
        };
        let secs = |frames: usize| {
            if self.sample_rate == 0 {
                0.0
            } else {
                frames as f64 / self.sample_rate as f64
            }
        };
        format!(
            "{:.1}s / {:.1}s buffered ({:.0}%, target {:.1}s), {} underruns",
            secs(buffer.occupancy),
            secs(buffer.active_capacity),
            buffer.fill_ratio() * 100.0,
            secs(buffer.target_capacity),
            buffer.underruns.total_underruns
        )
    }
}

/// Format a duration as MM:SS or HH:MM:SS.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, mins, secs)
    } else {
        format!("{}:{:02}", mins, secs)
    }
}
