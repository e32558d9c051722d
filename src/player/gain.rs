//! Volume as a decibel gain applied to rendered frames.

use super::frame::Frame;

/// Linear volumes at or below this are rendered as silence.
pub const SILENCE_FLOOR: f32 = 0.001;

/// Output gain. Stored in decibels so volume changes are perceptually even.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Gain {
    Silent,
    Decibels(f32),
}

impl Default for Gain {
    fn default() -> Self {
        Gain::Decibels(0.0)
    }
}

impl Gain {
    /// Build from a linear volume, clamped to [0, 1].
    pub fn from_volume(volume: f32) -> Self {
        let volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
        if volume <= SILENCE_FLOOR {
            Gain::Silent
        } else {
            Gain::Decibels(linear_to_db(volume))
        }
    }

    /// Linear volume this gain corresponds to.
    pub fn to_volume(self) -> f32 {
        match self {
            Gain::Silent => 0.0,
            Gain::Decibels(db) => db_to_linear(db).clamp(0.0, 1.0),
        }
    }

    /// Multiplier applied to each sample.
    pub fn factor(self) -> f32 {
        match self {
            Gain::Silent => 0.0,
            Gain::Decibels(db) => db_to_linear(db),
        }
    }

    pub fn apply(self, frames: &mut [Frame]) {
        match self {
            Gain::Decibels(db) if db == 0.0 => {}
            Gain::Silent => frames.fill(Frame::SILENCE),
            gain => {
                let factor = gain.factor();
                for frame in frames {
                    *frame = frame.scaled(factor);
                }
            }
        }
    }
}

#[inline]
fn linear_to_db(linear: f32) -> f32 {
    20.0 * linear.log10()
}

#[inline]
fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}
