//! Subcommand implementations.

pub mod config_cmd;
pub mod memory;
pub mod run;

use anyhow::Context;
use std::path::{Path, PathBuf};
use toolweave_config::AppConfig;

/// The config file a command reads: `--config` if given, else the default.
pub fn config_file(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"))
}

/// Load the configuration with environment overrides applied.
pub fn load_config(explicit: Option<&Path>) -> anyhow::Result<AppConfig> {
    let path = config_file(explicit);
    AppConfig::load_with_env(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}
