//! Configuration view and validation commands: `gitbit config`.

use std::path::Path;

use anyhow::Result;

use crate::ConfigCommands;
use gitbit::config::Config;

pub fn cmd_config(config_path: &Path, config: &Config, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("gitbit Configuration");
            println!("====================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found, using defaults.", config_path.display());
            }
            println!("Effective values (with env overrides):");
            println!();
            println!("{}", config.to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No {} found. Checking defaults.", config_path.display());
            }

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
    }

    Ok(())
}
