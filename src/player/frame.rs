//! Stereo frame type shared by every stage of the pipeline.

/// One stereo sample pair, normalized to [-1.0, 1.0].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Frame {
    pub left: f32,
    pub right: f32,
}

impl Frame {
    pub const SILENCE: Frame = Frame { left: 0.0, right: 0.0 };

    pub fn new(left: f32, right: f32) -> Self {
        Self { left, right }
    }

    /// Duplicate a mono sample into both channels.
    pub fn mono(sample: f32) -> Self {
        Self { left: sample, right: sample }
    }

    /// Build a frame from one interleaved group of `channels` samples.
    ///
    /// Mono is duplicated; anything wider than stereo keeps the first two channels.
    pub fn from_interleaved(samples: &[f32]) -> Self {
        match samples {
            [] => Self::SILENCE,
            [s] => Self::mono(*s),
            [l, r, ..] => Self::new(*l, *r),
        }
    }

    pub fn scaled(self, factor: f32) -> Self {
        Self {
            left: self.left * factor,
            right: self.right * factor,
        }
    }
}

/// Convert a frame count to seconds at `sample_rate`.
pub fn frames_to_secs(frames: u64, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    frames as f64 / sample_rate as f64
}

/// Convert seconds to a frame count at `sample_rate`, rounding down.
pub fn secs_to_frames(secs: f64, sample_rate: u32) -> u64 {
    if secs <= 0.0 {
        return 0;
    }
    (secs * sample_rate as f64) as u64
}
