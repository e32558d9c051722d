//! File and device inspection commands.

use std::path::Path;
use std::time::Duration;

use crate::config;
use crate::error::{Error, Result, ResultExt};
use crate::player::{
    AudioDecoder, DurationOracle, FrameSource, LoftyOracle, current_audio_device, format_duration,
    frames_to_secs, list_audio_devices,
};

/// Show the decoder's length estimate next to the container's duration
pub fn cmd_probe(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(Error::not_found(path));
    }

    let decoder = AudioDecoder::open(path)
        .with_context(format!("Failed to open {}", path.display()))?;
    let estimate = Duration::from_secs_f64(frames_to_secs(decoder.length(), decoder.sample_rate()));

    println!("File:        {}", path.display());
    println!(
        "Format:      {}Hz, {} channels",
        decoder.sample_rate(),
        decoder.channels()
    );
    println!(
        "Decoder:     {} ({} frames)",
        format_duration(estimate),
        decoder.length()
    );

    match LoftyOracle.probe(path) {
        Some(duration) => {
            let drift = duration.as_secs_f64() - estimate.as_secs_f64();
            println!(
                "Container:   {} ({:+.2}s vs decoder)",
                format_duration(duration),
                drift
            );
        }
        None => println!("Container:   unknown"),
    }

    Ok(())
}

/// List available output devices
pub fn cmd_devices() {
    let default = current_audio_device();
    let configured = config::load().audio.output_device;

    println!("Output devices:");
    for name in list_audio_devices() {
        let mut marks = Vec::new();
        if name == default {
            marks.push("default");
        }
        if name == configured {
            marks.push("configured");
        }
        if marks.is_empty() {
            println!("  {}", name);
        } else {
            println!("  {} ({})", name, marks.join(", "));
        }
    }
}
