//! Configuration loading for the fitbridge CLI
//!
//! A TOML file (`--config`) is parsed into [`FitConfig`]; missing tables fall
//! back to their defaults. Command line flags are applied on top, and a bare
//! database file name is placed under the user data directory.

use std::path::{Path, PathBuf};

use fitbridge_core::{FitConfig, OscConfig};
use tracing::info;

use crate::cli::Cli;
use crate::error::{CliError, Result};

/// Directory under the user data dir holding the default database
pub const DATA_DIR_NAME: &str = "fitbridge";

/// Load the configuration named by the command line, or the defaults
pub fn load(cli: &Cli) -> Result<FitConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            load_from_file(path)?
        }
        None => {
            info!("Using default configuration");
            FitConfig::default()
        }
    };
    apply_overrides(&mut config, cli);
    config.database.path = resolve_database_path(&config.database.path, dirs::data_dir());
    validate(&config)?;
    Ok(config)
}

pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<FitConfig> {
    let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        CliError::Config(format!("Failed to read {}: {}", path.as_ref().display(), e))
    })?;
    from_toml(&text)
}

pub fn from_toml(text: &str) -> Result<FitConfig> {
    Ok(toml::from_str(text)?)
}

/// Flags win over the file
pub fn apply_overrides(config: &mut FitConfig, cli: &Cli) {
    if let Some(db) = &cli.db {
        config.database.path = PathBuf::from(db);
    }
}

/// A bare file name lives in `<data_dir>/fitbridge/`; anything with a
/// directory component is used as given
pub fn resolve_database_path(path: &Path, data_dir: Option<PathBuf>) -> PathBuf {
    let bare = path.is_relative() && path.parent().map_or(true, |p| p.as_os_str().is_empty());
    match data_dir {
        Some(dir) if bare => dir.join(DATA_DIR_NAME).join(path),
        _ => path.to_path_buf(),
    }
}

fn validate_hop(name: &str, hop: &OscConfig) -> Result<()> {
    if hop.ping_interval_ms == 0 || hop.command_timeout_ms == 0 {
        return Err(CliError::Config(format!(
            "{name}: ping interval and command timeout must be greater than 0"
        )));
    }
    if hop.ping_timeout_ms <= hop.ping_interval_ms {
        return Err(CliError::Config(format!(
            "{name}: ping timeout must exceed the ping interval"
        )));
    }
    if hop.bind == hop.peer {
        return Err(CliError::Config(format!("{name}: bind and peer are the same address")));
    }
    Ok(())
}

/// Validate the configuration for consistency
pub fn validate(config: &FitConfig) -> Result<()> {
    validate_hop("frontend", &config.frontend)?;
    if let Some(driver) = &config.driver {
        validate_hop("driver", driver)?;
        if driver.bind == config.frontend.bind {
            return Err(CliError::Config(
                "driver hop cannot bind the frontend address".to_string(),
            ));
        }
    }
    if config.fleet.connect_retry == 0 {
        return Err(CliError::Config("fleet.connect_retry must be at least 1".to_string()));
    }
    Ok(())
}

/// Default configuration rendered as TOML
pub fn example_config() -> Result<String> {
    toml::to_string_pretty(&FitConfig::default())
        .map_err(|e| CliError::Config(format!("Failed to serialize config: {e}")))
}
