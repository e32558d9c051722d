//! Config file command.

use std::path::Path;

use crate::config::{self, Config, ConfigError};
use crate::error::{Result, ResultExt};

/// Print the active configuration, optionally writing a default file first
pub fn cmd_config(init: bool) -> Result<()> {
    let path = config::config_path().ok_or(ConfigError::NoConfigDir)?;

    if init {
        init_config(&path)?;
    }

    let config = if path.exists() {
        println!("# {}", path.display());
        config::load_from(&path).with_context("Config file is invalid")?
    } else {
        println!("# {} (not present, showing defaults)", path.display());
        Config::default()
    };

    let contents = toml::to_string_pretty(&config).map_err(ConfigError::Serialize)?;
    println!("{}", contents);
    Ok(())
}

/// Write the default config to `path` unless a file is already there.
fn init_config(path: &Path) -> Result<bool> {
    if path.exists() {
        println!("Config already exists at {}", path.display());
        return Ok(false);
    }
    config::save_to(&Config::default(), path).with_context("Failed to write default config")?;
    println!("Wrote default config to {}", path.display());
    Ok(true)
}
