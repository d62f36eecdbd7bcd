//! `yggdrasil config`: init/show/validate.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use yggdrasil_core::config::{check_startup, ConfigLoader};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Write a default configuration file at the standard platform location.
    Init,

    /// Print the fully-merged, effective configuration.
    Show,

    /// Load and validate a configuration without starting the dispatcher.
    Validate,
}

pub async fn execute(cmd: ConfigCommands, config: Option<PathBuf>, verbose: bool) -> Result<()> {
    match cmd {
        ConfigCommands::Init => init(),
        ConfigCommands::Show => show(config, verbose),
        ConfigCommands::Validate => validate(config),
    }
}

fn init() -> Result<()> {
    let path = yggdrasil_core::config::init_config_file().context("initializing configuration file")?;
    println!("{} wrote default configuration to {}", "✓".green().bold(), path.display());
    println!("Edit it to add your executor hosts, then run {}.", "yggdrasil run".bright_cyan());
    Ok(())
}

fn loader_for(config: Option<PathBuf>) -> ConfigLoader {
    match config {
        Some(path) => ConfigLoader::new().with_file(path),
        None => ConfigLoader::new(),
    }
}

fn show(config: Option<PathBuf>, verbose: bool) -> Result<()> {
    let loaded = loader_for(config).load().context("loading configuration")?;
    let yaml = serde_yaml::to_string(&loaded).context("serializing configuration")?;
    println!("{yaml}");
    if verbose {
        if let Some(dir) = ConfigLoader::default_config_dir() {
            println!("{} {}", "config directory:".dimmed(), dir.display());
        }
    }
    Ok(())
}

fn validate(config: Option<PathBuf>) -> Result<()> {
    let loaded = loader_for(config).load().context("loading configuration")?;
    check_startup(&loaded).context("validating configuration")?;
    println!("{} configuration is valid ({} host(s) configured)", "✓".green().bold(), loaded.hosts.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loader_for_none_uses_default_search() {
        // Just exercises construction; actual file resolution is covered in
        // `yggdrasil_core::config`'s own test suite.
        let _ = loader_for(None);
    }
}
