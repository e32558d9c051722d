//! ringplay - gapless audio file playback through an adaptive ring buffer.
//!
//! The decoder runs ahead on a fill thread while the output device pulls
//! fixed-size blocks; a ring buffer that grows under underruns and shrinks
//! when playback is stable sits between the two.

pub mod cli;
pub mod config;
pub mod error;
pub mod player;
#[cfg(test)]
pub mod test_utils;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("ringplay=info".parse()?))
        .init();

    cli::run_command(&args)
}
