//! Container-level duration lookup, independent of the decoder.
//!
//! Decoders may only know an estimate until they reach the end of the
//! stream. The oracle reads the container's own properties, which is usually
//! exact and much cheaper than decoding.

use std::path::Path;
use std::time::Duration;

use lofty::file::AudioFile;
use lofty::probe::Probe;
use tracing::debug;

/// Looks up the real duration of a file.
pub trait DurationOracle: Send + Sync {
    /// `None` if the duration can't be determined.
    fn probe(&self, path: &Path) -> Option<Duration>;
}

/// Duration oracle backed by lofty's audio properties.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoftyOracle;

impl DurationOracle for LoftyOracle {
    fn probe(&self, path: &Path) -> Option<Duration> {
        let tagged_file = match Probe::open(path).and_then(|p| p.read()) {
            Ok(file) => file,
            Err(e) => {
                debug!("Duration probe failed for {}: {}", path.display(), e);
                return None;
            }
        };

        let duration = tagged_file.properties().duration();
        (!duration.is_zero()).then_some(duration)
    }
}
