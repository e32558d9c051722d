//! Audio decoder using symphonia for multi-format support.
//!
//! Supported formats:
//! - MP3
//! - FLAC
//! - OGG Vorbis
//! - WAV/PCM
//! - AAC (in MP4 container)
//!
//! The decoder is a [`FrameSource`]: it hands out stereo frames in whatever
//! amounts the fill loop asks for, keeping the remainder of the last decoded
//! packet for the next call.

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CODEC_TYPE_NULL, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, Packet, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{Time, TimeBase};
use tracing::{debug, info};

use super::PlayerError;
use super::frame::Frame;
use super::source::{CorrectionOrigin, FrameSource, LengthNotifier, StreamStatus};

/// Audio decoder wrapper for symphonia.
pub struct AudioDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: u16,
    time_base: Option<TimeBase>,
    /// Length in frames; exact once the end has been reached
    length: u64,
    length_exact: bool,
    /// Next frame index `stream` hands out
    position: u64,
    /// Decoded frames not yet handed out
    pending: Vec<Frame>,
    pending_pos: usize,
    /// Frames to drop after an accurate seek landed before the target
    skip: u64,
    exhausted: bool,
    listener: Option<LengthNotifier>,
}

impl AudioDecoder {
    /// Open a file for decoding.
    ///
    /// Fails if the file can't be opened, isn't a recognized format, or
    /// contains no audio frames.
    pub fn open(path: &Path) -> Result<Self, PlayerError> {
        let file = File::open(path)
            .map_err(|e| PlayerError::Decode(format!("{}: {}", path.display(), e)))?;
        let file_size = file.metadata().map(|m| m.len()).unwrap_or(0);

        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        // Probe the format
        let mut hint = Hint::new();
        if let Some(ext) = path.extension() {
            hint.with_extension(&ext.to_string_lossy());
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let metadata_opts = MetadataOptions::default();

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &metadata_opts)
            .map_err(|e| PlayerError::Decode(format!("{}: {}", path.display(), e)))?;

        let reader = probed.format;

        // Find the first audio track
        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| PlayerError::Decode("No audio track found".to_string()))?;

        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let sample_rate = codec_params
            .sample_rate
            .ok_or_else(|| PlayerError::Decode("Unknown sample rate".to_string()))?;
        let channels = codec_params.channels.map(|c| c.count() as u16).unwrap_or(2);

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| PlayerError::Decode(e.to_string()))?;

        let mut this = Self {
            reader,
            decoder,
            track_id,
            sample_rate,
            channels,
            time_base: codec_params.time_base,
            length: 0,
            length_exact: false,
            position: 0,
            pending: Vec::new(),
            pending_pos: 0,
            skip: 0,
            exhausted: false,
            listener: None,
        };

        match codec_params.n_frames {
            Some(0) => return Err(PlayerError::Decode("No audio frames".to_string())),
            Some(n_frames) => this.length = n_frames,
            None => this.estimate_length(file_size)?,
        }

        info!(
            "Opened {}: {}Hz, {} channels, ~{:.1}s",
            path.display(),
            sample_rate,
            channels,
            this.length as f64 / sample_rate as f64
        );

        Ok(this)
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Estimate the length from the first packet's size when the container
    /// doesn't say. The packet's frames stay queued for playback.
    fn estimate_length(&mut self, file_size: u64) -> Result<(), PlayerError> {
        let Some(packet) = self.next_track_packet()? else {
            return Err(PlayerError::Decode("No audio frames".to_string()));
        };

        let packet_frames = self.ts_to_frames(packet.dur()).max(1);
        let bytes_per_frame = packet.buf().len().max(1) as f64 / packet_frames as f64;
        self.length = (file_size as f64 / bytes_per_frame) as u64;

        debug!(
            bytes_per_frame,
            estimate = self.length,
            "Estimated length from first packet"
        );

        self.decode_packet(&packet)?;
        if self.pending.is_empty() && self.next_decoded().map_or(true, |more| !more) {
            return Err(PlayerError::Decode("No audio frames".to_string()));
        }
        Ok(())
    }

    fn ts_to_frames(&self, ts: u64) -> u64 {
        match self.time_base {
            Some(tb) => {
                let time = tb.calc_time(ts);
                ((time.seconds as f64 + time.frac) * self.sample_rate as f64).round() as u64
            }
            None => ts,
        }
    }

    /// Next packet belonging to our track, or `None` at end of stream.
    fn next_track_packet(&mut self) -> Result<Option<Packet>, PlayerError> {
        loop {
            match self.reader.next_packet() {
                Ok(packet) if packet.track_id() == self.track_id => return Ok(Some(packet)),
                Ok(_) => continue,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                }
                Err(e) => return Err(PlayerError::Decode(e.to_string())),
            }
        }
    }

    /// Decode one packet into `pending`, honouring any pending seek skip.
    fn decode_packet(&mut self, packet: &Packet) -> Result<(), PlayerError> {
        let decoded = match self.decoder.decode(packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                debug!("Skipping bad packet: {}", e);
                return Ok(());
            }
            Err(e) => return Err(PlayerError::Decode(e.to_string())),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count().max(1);
        let mut samples = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        samples.copy_interleaved_ref(decoded);

        let frames = samples.samples().chunks_exact(channels);
        let skip = (self.skip as usize).min(frames.len());
        self.skip -= skip as u64;

        self.pending.clear();
        self.pending_pos = 0;
        self.pending
            .extend(frames.skip(skip).map(Frame::from_interleaved));
        Ok(())
    }

    /// Decode the next packet. Returns `Ok(false)` at end of stream.
    fn next_decoded(&mut self) -> Result<bool, PlayerError> {
        match self.next_track_packet()? {
            Some(packet) => {
                self.decode_packet(&packet)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn finish(&mut self) {
        self.exhausted = true;
        if self.skip > 0 {
            // The seek target lay past the real end of the stream
            self.position = self.position.saturating_sub(self.skip);
            self.skip = 0;
        }
        if self.length_exact {
            return;
        }
        self.length_exact = true;
        if self.length != self.position {
            info!(
                estimated = self.length,
                actual = self.position,
                "Decoder reached end, correcting length"
            );
            self.length = self.position;
            if let Some(listener) = &self.listener {
                listener.notify(self.position, CorrectionOrigin::Decoder);
            }
        }
    }
}

impl FrameSource for AudioDecoder {
    fn stream(&mut self, buf: &mut [Frame]) -> Result<StreamStatus, PlayerError> {
        let mut written = 0;

        while written < buf.len() {
            let queued = &self.pending[self.pending_pos..];
            if !queued.is_empty() {
                let n = queued.len().min(buf.len() - written);
                buf[written..written + n].copy_from_slice(&queued[..n]);
                self.pending_pos += n;
                written += n;
                continue;
            }
            if self.exhausted || !self.next_decoded()? {
                self.position += written as u64;
                if !self.exhausted {
                    self.finish();
                }
                return Ok(StreamStatus {
                    frames: written,
                    more: false,
                });
            }
        }

        self.position += written as u64;
        Ok(StreamStatus {
            frames: written,
            more: true,
        })
    }

    fn seek(&mut self, frame: u64) -> Result<(), PlayerError> {
        let seek_to = SeekTo::Time {
            time: Time::from(frame as f64 / self.sample_rate as f64),
            track_id: Some(self.track_id),
        };

        let seeked = self
            .reader
            .seek(SeekMode::Accurate, seek_to)
            .map_err(|e| PlayerError::Seek(e.to_string()))?;

        // Reset decoder state after seeking
        self.decoder.reset();
        self.pending.clear();
        self.pending_pos = 0;
        self.exhausted = false;

        let landed = self.ts_to_frames(seeked.actual_ts);
        self.skip = frame.saturating_sub(landed);
        self.position = landed + self.skip;

        debug!(target_frame = frame, landed, skip = self.skip, "Decoder seek");
        Ok(())
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn correct_length(&mut self, frames: u64) {
        if !self.length_exact && frames > 0 {
            self.length = frames;
        }
    }

    fn set_length_listener(&mut self, listener: LengthNotifier) {
        self.listener = Some(listener);
    }
}
