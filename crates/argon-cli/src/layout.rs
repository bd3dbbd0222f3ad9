//! `argon layout` subcommands.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;

use argon_config::Config;
use argon_layout::LayoutContract;

#[derive(Subcommand)]
pub enum LayoutCommands {
    /// Print a layout contract as TOML
    Show {
        /// Built-in preset to print instead of the configured layout
        #[arg(long)]
        preset: Option<String>,
    },

    /// Validate a contract file
    Check {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// List the built-in presets
    Presets,
}

pub fn run(config: &Config, command: LayoutCommands) -> Result<()> {
    match command {
        LayoutCommands::Show { preset } => {
            let contract = match preset {
                Some(name) => LayoutContract::preset(&name).with_context(|| {
                    format!(
                        "Unknown preset {name} (available: {})",
                        LayoutContract::preset_names().join(", ")
                    )
                })?,
                None => config.layout_contract()?,
            };
            println!("# fingerprint: {}", contract.fingerprint()?);
            print!("{}", contract.to_toml()?);
            Ok(())
        }
        LayoutCommands::Check { file } => {
            let contract = LayoutContract::load(&file)
                .with_context(|| format!("Invalid layout contract {}", file.display()))?;
            println!(
                "OK {} {} fingerprint={}",
                contract.name,
                contract.version,
                contract.fingerprint()?
            );
            Ok(())
        }
        LayoutCommands::Presets => {
            for name in LayoutContract::preset_names() {
                println!("{name}");
            }
            Ok(())
        }
    }
}
