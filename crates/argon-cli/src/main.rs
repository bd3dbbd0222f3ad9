//! # argon CLI
//!
//! Inspect configuration and layout contracts, and exercise the
//! reconciliation pass against simulated scenes.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use argon_config::{log_cli_debug, Config, LogLevel};

mod layout;
mod simulate;

/// argon - circuit power-association leak fix
#[derive(Parser)]
#[command(name = "argon")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (overrides config; ARGON_LOG overrides both)
    #[arg(long, global = true, env = "ARGON_LOG_LEVEL")]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Layout contract inspection
    Layout {
        #[command(subcommand)]
        command: layout::LayoutCommands,
    },

    /// Run the pass over a scene described by a fixture file
    Simulate(simulate::SimulateArgs),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,

    /// Write a default project config to .argon/config.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the config file locations
    Path,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load().context("Failed to load configuration")?;
    argon_config::logging::init_logging(cli.log_level.unwrap_or(config.logging.level));
    log_cli_debug!("Configuration loaded", preset = config.layout.preset.as_str());

    match cli.command {
        Commands::Config { command } => match command {
            ConfigCommands::Show => cmd_config_show(&config),
            ConfigCommands::Init { force } => cmd_config_init(force),
            ConfigCommands::Path => cmd_config_path(),
        },
        Commands::Layout { command } => layout::run(&config, command),
        Commands::Simulate(args) => simulate::run(&config, args),
    }
}

fn cmd_config_show(config: &Config) -> Result<()> {
    let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
    print!("{rendered}");
    Ok(())
}

fn cmd_config_init(force: bool) -> Result<()> {
    let path = Config::project_config_path();
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(&path, Config::default_toml()?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn cmd_config_path() -> Result<()> {
    let global = Config::global_config_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(no home directory)".to_string());
    let project: PathBuf = Config::project_config_path();
    println!("Global:  {global}");
    println!("Project: {}", project.display());
    Ok(())
}
