//! Audio output using cpal.
//!
//! The player only sees the [`OutputSink`] trait: a pull-based device that
//! calls a render function once per hardware block. [`CpalSink`] implements
//! it on a dedicated `audio-output` thread, since a cpal `Stream` can't move
//! between threads. The thread owns the stream and is driven by commands.

use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use tracing::{debug, error, info, warn};

use super::PlayerError;
use super::frame::Frame;

/// Requested device parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkConfig {
    pub sample_rate: u32,
    /// Frames per device block (0 = device default)
    pub block_size: u32,
}

/// Fills one block of output frames. Runs on the device's real-time thread.
pub type RenderFn = Box<dyn FnMut(&mut [Frame]) + Send>;

/// A pull-based output device.
pub trait OutputSink: Send {
    /// Open (or reopen) the device and start pulling from `render`.
    fn start(&mut self, config: SinkConfig, render: RenderFn) -> Result<(), PlayerError>;

    /// Configuration of the running device, if open.
    fn config(&self) -> Option<SinkConfig>;

    /// Drop whatever the device has queued but not yet played.
    fn clear(&mut self);

    /// Stop pulling and release the device.
    fn close(&mut self);
}

enum SinkCommand {
    Start {
        config: SinkConfig,
        render: RenderFn,
        reply: Sender<Result<SinkConfig, PlayerError>>,
    },
    Clear,
    Close,
}

/// cpal-backed output sink.
pub struct CpalSink {
    /// Preferred device name (empty = system default)
    device_name: String,
    command_tx: Option<Sender<SinkCommand>>,
    thread: Option<JoinHandle<()>>,
    config: Option<SinkConfig>,
}

impl CpalSink {
    /// Create a sink for the named device. Nothing is opened until `start`.
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            command_tx: None,
            thread: None,
            config: None,
        }
    }

    fn command_tx(&mut self) -> Result<Sender<SinkCommand>, PlayerError> {
        if let Some(tx) = &self.command_tx {
            return Ok(tx.clone());
        }

        let (tx, rx) = unbounded();
        let device_name = self.device_name.clone();
        let thread = thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || output_thread_main(&device_name, rx))
            .map_err(|e| PlayerError::Spawn(e.to_string()))?;

        self.thread = Some(thread);
        self.command_tx = Some(tx.clone());
        Ok(tx)
    }
}

impl OutputSink for CpalSink {
    fn start(&mut self, config: SinkConfig, render: RenderFn) -> Result<(), PlayerError> {
        let tx = self.command_tx()?;
        let (reply_tx, reply_rx) = bounded(1);

        tx.send(SinkCommand::Start {
            config,
            render,
            reply: reply_tx,
        })
        .map_err(|_| PlayerError::ChannelClosed)?;

        match reply_rx.recv() {
            Ok(Ok(actual)) => {
                self.config = Some(actual);
                Ok(())
            }
            Ok(Err(e)) => {
                self.config = None;
                Err(e)
            }
            Err(_) => {
                self.config = None;
                Err(PlayerError::ChannelClosed)
            }
        }
    }

    fn config(&self) -> Option<SinkConfig> {
        self.config
    }

    fn clear(&mut self) {
        if let Some(tx) = &self.command_tx {
            let _ = tx.send(SinkCommand::Clear);
        }
    }

    fn close(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(SinkCommand::Close);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.config = None;
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Main loop for the output thread. Owns the stream for its whole life.
fn output_thread_main(device_name: &str, command_rx: Receiver<SinkCommand>) {
    let mut stream: Option<Stream> = None;

    while let Ok(command) = command_rx.recv() {
        match command {
            SinkCommand::Start {
                config,
                render,
                reply,
            } => {
                // Release the old stream before opening the device again
                stream = None;
                let result = open_stream(device_name, config, render).map(|(s, actual)| {
                    stream = Some(s);
                    actual
                });
                let _ = reply.send(result);
            }
            SinkCommand::Clear => {
                if let Some(s) = &stream {
                    let _ = s.pause();
                    if let Err(e) = s.play() {
                        error!("Failed to restart stream after clear: {}", e);
                    }
                }
            }
            SinkCommand::Close => break,
        }
    }

    drop(stream);
    debug!("Audio output thread stopped");
}

fn open_stream(
    device_name: &str,
    requested: SinkConfig,
    render: RenderFn,
) -> Result<(Stream, SinkConfig), PlayerError> {
    let host = cpal::default_host();
    let device = select_device(&host, device_name)?;

    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    info!("Using audio device: {}", name);

    let supported = device
        .supported_output_configs()
        .map_err(|e| PlayerError::OutputInit(e.to_string()))?
        .filter(|c| matches!(c.sample_format(), SampleFormat::F32 | SampleFormat::I16))
        .filter(|c| {
            c.min_sample_rate().0 <= requested.sample_rate
                && c.max_sample_rate().0 >= requested.sample_rate
        })
        .max_by_key(|c| (c.channels() == 2, c.sample_format() == SampleFormat::F32))
        .map(|c| c.with_sample_rate(cpal::SampleRate(requested.sample_rate)));

    let supported = match supported {
        Some(config) => config,
        None => {
            let fallback = device
                .default_output_config()
                .map_err(|e| PlayerError::OutputInit(e.to_string()))?;
            warn!(
                requested = requested.sample_rate,
                actual = fallback.sample_rate().0,
                "Device does not support the source sample rate, using its default"
            );
            fallback
        }
    };

    let config = StreamConfig {
        channels: supported.channels(),
        sample_rate: supported.sample_rate(),
        buffer_size: match requested.block_size {
            0 => cpal::BufferSize::Default,
            frames => cpal::BufferSize::Fixed(frames),
        },
    };

    info!(
        "Audio format: {}Hz, {} channels, {:?}",
        config.sample_rate.0,
        config.channels,
        supported.sample_format()
    );

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, render),
        SampleFormat::I16 => build_stream::<i16>(&device, &config, render),
        format => {
            return Err(PlayerError::OutputInit(format!(
                "Unsupported sample format: {:?}",
                format
            )));
        }
    }
    .map_err(|e| PlayerError::OutputInit(e.to_string()))?;

    stream
        .play()
        .map_err(|e| PlayerError::OutputInit(e.to_string()))?;

    Ok((
        stream,
        SinkConfig {
            sample_rate: config.sample_rate.0,
            block_size: requested.block_size,
        },
    ))
}

/// Find the configured device by name, falling back to the system default.
fn select_device(host: &cpal::Host, device_name: &str) -> Result<Device, PlayerError> {
    if !device_name.is_empty() {
        let found = host
            .output_devices()
            .map_err(|e| PlayerError::OutputInit(e.to_string()))?
            .find(|d| d.name().ok().as_deref() == Some(device_name));
        match found {
            Some(device) => return Ok(device),
            None => warn!("Audio device {:?} not found, using default", device_name),
        }
    }

    host.default_output_device()
        .ok_or_else(|| PlayerError::OutputInit("No output device found".to_string()))
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut render: RenderFn,
) -> Result<Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let mut frames: Vec<Frame> = Vec::new();

    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let count = data.len() / channels;
            if frames.len() < count {
                frames.resize(count, Frame::SILENCE);
            }
            let block = &mut frames[..count];
            render(block);

            for (out, frame) in data.chunks_exact_mut(channels).zip(block.iter()) {
                write_frame(out, *frame);
            }
        },
        |err| {
            error!("Audio stream error: {}", err);
        },
        None,
    )
}

/// Map a stereo frame onto a device frame of any channel count.
fn write_frame<T: cpal::Sample + cpal::FromSample<f32>>(out: &mut [T], frame: Frame) {
    match out {
        [] => {}
        [mono] => *mono = T::from_sample((frame.left + frame.right) * 0.5),
        [left, right, rest @ ..] => {
            *left = T::from_sample(frame.left);
            *right = T::from_sample(frame.right);
            for sample in rest {
                *sample = T::from_sample(0.0f32);
            }
        }
    }
}

/// List available audio output devices.
pub fn list_audio_devices() -> Vec<String> {
    let host = cpal::default_host();
    host.output_devices()
        .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
        .unwrap_or_default()
}

/// Get the current/default audio device name.
pub fn current_audio_device() -> String {
    let host = cpal::default_host();
    host.default_output_device()
        .and_then(|d| d.name().ok())
        .unwrap_or_else(|| "Unknown".to_string())
}
