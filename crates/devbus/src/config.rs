//! Flag-aware configuration loading for the CLI.
//!
//! Thin layer over `devbus_config`: `--config` picks the file, and the
//! commands that only need a resource file can skip validation entirely.

use std::path::PathBuf;

use devbus_config::Config;

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// The configuration file in effect: `--config` / `DEVBUS_CONFIG`, else
/// the platform default.
pub fn config_path(global: &GlobalOpts) -> PathBuf {
    global
        .config
        .clone()
        .unwrap_or_else(devbus_config::config_path)
}

/// Load and validate the layered configuration.
pub fn load(global: &GlobalOpts) -> Result<Config, CliError> {
    let path = config_path(global);
    tracing::debug!(path = %path.display(), "loading configuration");
    Ok(devbus_config::load_config_from(&path)?)
}

/// The resource file property commands work on: the explicit flag, else
/// `file_database` from the configuration.
pub fn file_database(global: &GlobalOpts, flag: Option<PathBuf>) -> Result<PathBuf, CliError> {
    if let Some(path) = flag {
        return Ok(path);
    }
    load(global)?
        .file_database
        .ok_or_else(|| CliError::NoFileDatabase {
            path: config_path(global).display().to_string(),
        })
}
