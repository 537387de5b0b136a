//! `toolweave config`: Configuration management commands.

use super::{config_file, load_config};
use anyhow::Context;
use std::path::Path;
use toolweave_config::AppConfig;

pub fn show(explicit: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(explicit)?;
    let toml_str = toml::to_string_pretty(&config).context("Failed to render config")?;
    println!("{toml_str}");
    Ok(())
}

pub fn init(explicit: Option<&Path>, force: bool) -> anyhow::Result<()> {
    let path = config_file(explicit);
    if write_default(&path, force)? {
        println!("✅ Wrote default config to {}", path.display());
    } else {
        println!("Config already exists at {} (use --force to overwrite)", path.display());
    }
    Ok(())
}

pub fn path(explicit: Option<&Path>) {
    println!("{}", config_file(explicit).display());
}

/// Write the default config to `path`. False when a file exists and `force` is off.
fn write_default(path: &Path, force: bool) -> anyhow::Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, AppConfig::default_toml())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(true)
}
