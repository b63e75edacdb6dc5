//! Configuration view and validation commands: `enclave config`.

use std::path::Path;

use anyhow::{Context, Result, bail};
use enclave::config::EnclaveConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No config file at {}; using defaults", config_path.display());
            }
            let config = EnclaveConfig::resolve(Some(config_path))?;
            let shown = toml::to_string_pretty(&config.redacted())
                .context("Failed to render configuration")?;
            println!("{}", shown);
        }
        Some(ConfigCommands::Validate) => {
            let config = EnclaveConfig::resolve(Some(config_path))?;
            let report = config.validate();
            for warning in &report.warnings {
                println!("warning: {}", warning);
            }
            for error in &report.errors {
                println!("error: {}", error);
            }
            if !report.is_ok() {
                bail!("{} configuration error(s)", report.errors.len());
            }
            println!("Configuration is valid.");
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                bail!(
                    "{} already exists; pass --force to overwrite",
                    config_path.display()
                );
            }
            EnclaveConfig::default().save(config_path)?;
            println!("Wrote default configuration to {}", config_path.display());
        }
    }
    Ok(())
}
