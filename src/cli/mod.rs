//! Command-line interface for ringplay.
//!
//! This module provides commands for playing a file interactively,
//! inspecting a file's length estimates, listing output devices and
//! managing the config file.

mod commands;

pub use commands::{Cli, Commands, run_command};
