//! The frame source interface the buffering engine pulls from.

use std::sync::Arc;

use crossbeam_channel::{Sender, TrySendError};
use parking_lot::Mutex;

use super::PlayerError;
use super::frame::Frame;

/// Result of one [`FrameSource::stream`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStatus {
    /// Frames written to the front of the buffer
    pub frames: usize,
    /// False once the source has nothing left; with `frames == 0` this is exhaustion
    pub more: bool,
}

/// A sequential producer of decoded frames.
pub trait FrameSource: Send {
    /// Fill the front of `buf` with the next frames.
    fn stream(&mut self, buf: &mut [Frame]) -> Result<StreamStatus, PlayerError>;

    /// Move to `frame`. May land near rather than exactly on the target.
    fn seek(&mut self, frame: u64) -> Result<(), PlayerError>;

    /// Total length in frames. An estimate that may be corrected later.
    fn length(&self) -> u64;

    /// Index of the next frame `stream` will produce.
    fn position(&self) -> u64;

    fn sample_rate(&self) -> u32;

    /// Apply a length determined elsewhere (e.g. a container probe).
    fn correct_length(&mut self, frames: u64);

    /// Register where to report length corrections the source discovers itself.
    fn set_length_listener(&mut self, _listener: LengthNotifier) {}
}

/// A frame source shared between the fill loop and the controller.
pub type SharedSource = Arc<Mutex<Box<dyn FrameSource>>>;

/// Where a length correction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionOrigin {
    /// The decoder reached the end and counted the real length
    Decoder,
    /// An external duration probe
    Oracle,
}

/// A corrected total length for the source loaded in `session`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthCorrection {
    pub session: u64,
    pub frames: u64,
    pub origin: CorrectionOrigin,
}

/// Sending half for length corrections, tagged with the session it belongs to.
#[derive(Debug, Clone)]
pub struct LengthNotifier {
    session: u64,
    tx: Sender<LengthCorrection>,
}

impl LengthNotifier {
    pub fn new(session: u64, tx: Sender<LengthCorrection>) -> Self {
        Self { session, tx }
    }

    /// Report a corrected length. Never blocks; a full or closed channel drops it.
    pub fn notify(&self, frames: u64, origin: CorrectionOrigin) {
        let correction = LengthCorrection {
            session: self.session,
            frames,
            origin,
        };
        match self.tx.try_send(correction) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::debug!("Length correction channel full, dropping {:?}", correction);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}
