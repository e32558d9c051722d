//! CLI command definitions and dispatch.
//!
//! Each subcommand is implemented in its own submodule:
//! - `play`: interactive playback
//! - `probe`: length estimates and output devices
//! - `settings`: config file management

mod play;
mod probe;
mod settings;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub use play::cmd_play;
pub use probe::{cmd_devices, cmd_probe};
pub use settings::cmd_config;

/// ringplay CLI
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand)]
pub enum Commands {
    /// Play an audio file
    Play {
        /// Path to the audio file
        path: PathBuf,
        /// Initial volume (0.0-1.0), overrides the config file
        #[arg(short, long)]
        volume: Option<f32>,
        /// Start position in seconds
        #[arg(short, long)]
        start: Option<f64>,
    },
    /// Compare the decoder's length estimate with the container's duration
    Probe {
        /// Path to the audio file
        path: PathBuf,
    },
    /// List audio output devices
    Devices,
    /// Show the config file
    Config {
        /// Write a default config file if none exists
        #[arg(long)]
        init: bool,
    },
}

/// Run the parsed command.
pub fn run_command(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Play {
            path,
            volume,
            start,
        } => cmd_play(path, *volume, *start)?,
        Commands::Probe { path } => cmd_probe(path)?,
        Commands::Devices => cmd_devices(),
        Commands::Config { init } => cmd_config(*init)?,
    }
    Ok(())
}
