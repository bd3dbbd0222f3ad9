//! # argon-config
//!
//! Configuration management for argon.
//!
//! Loads configuration from:
//! 1. `~/.argon/config.toml` (global)
//! 2. `.argon/config.toml` (project-local, overrides global key by key)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use std::path::{Path, PathBuf};

use argon_layout::{ContractError, LayoutContract, PRESET_BDS_1_18_2};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use logging::LogLevel;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML render error: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("unknown layout preset: {0}")]
    UnknownPreset(String),
    #[error("layout contract error: {0}")]
    Contract(#[from] ContractError),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub layout: LayoutConfig,
    pub pass: PassConfig,
    pub faults: FaultConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let global = Self::global_config_path();
        let project = Self::project_config_path();
        let mut config = Self::load_from(global.as_deref(), Some(&project))?;

        // Environment variable overrides
        config.apply_env_overrides(|key| std::env::var(key).ok());

        Ok(config)
    }

    /// Load from explicit global/project files; missing files are skipped.
    pub fn load_from(global: Option<&Path>, project: Option<&Path>) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();

        for path in [global, project].into_iter().flatten() {
            if path.exists() {
                debug!("Loading config from {:?}", path);
                let contents = std::fs::read_to_string(path)?;
                let table: toml::Table = toml::from_str(&contents)?;
                merge_tables(&mut merged, table);
            }
        }

        Ok(toml::Value::Table(merged).try_into()?)
    }

    /// Global config path: ~/.argon/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".argon/config.toml"))
    }

    /// Project config path: .argon/config.toml
    pub fn project_config_path() -> PathBuf {
        PathBuf::from(".argon/config.toml")
    }

    /// Apply environment variable overrides through `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(preset) = lookup("ARGON_LAYOUT_PRESET") {
            self.layout.preset = preset;
        }
        if let Some(path) = lookup("ARGON_LAYOUT_PATH") {
            self.layout.path = Some(PathBuf::from(path));
        }
        if let Some(fallback) = lookup("ARGON_FALLBACK") {
            match fallback.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.pass.fallback_to_original = true,
                "0" | "false" | "no" | "off" => self.pass.fallback_to_original = false,
                other => debug!("Ignoring ARGON_FALLBACK={}", other),
            }
        }
        if let Some(level) = lookup("ARGON_LOG_LEVEL") {
            if let Ok(level) = level.parse() {
                self.logging.level = level;
            }
        }
    }

    /// Resolve the configured layout: an explicit contract file wins over the preset.
    pub fn layout_contract(&self) -> Result<LayoutContract, ConfigError> {
        if let Some(path) = &self.layout.path {
            debug!("Loading layout contract from {:?}", path);
            return Ok(LayoutContract::load(path)?);
        }
        let contract = LayoutContract::preset(&self.layout.preset)
            .ok_or_else(|| ConfigError::UnknownPreset(self.layout.preset.clone()))?;
        contract.validate()?;
        Ok(contract)
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Config::default())?)
    }
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Layout selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Named layout preset
    pub preset: String,
    /// Contract file overriding the preset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            preset: PRESET_BDS_1_18_2.to_string(),
            path: None,
        }
    }
}

/// Reconciliation pass behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassConfig {
    /// Call the displaced host routine when a pass aborts on a layout fault
    pub fallback_to_original: bool,
}

impl Default for PassConfig {
    fn default() -> Self {
        Self {
            fallback_to_original: true,
        }
    }
}

/// Fault log rate limiting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    /// Faults logged in full before switching to summaries
    pub log_burst: u32,
    /// After the burst, log one summary every this many faults
    pub log_every: u64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            log_burst: 3,
            log_every: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.layout.preset, PRESET_BDS_1_18_2);
        assert!(config.pass.fallback_to_original);
        assert_eq!(config.faults.log_burst, 3);
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml().unwrap();
        assert!(toml_str.contains("[layout]"));
        assert!(toml_str.contains("[faults]"));
        assert!(toml_str.contains("bds-1.18.2-msvc"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("ARGON_LAYOUT_PRESET", "simulated"),
            ("ARGON_FALLBACK", "off"),
            ("ARGON_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.layout.preset, "simulated");
        assert!(!config.pass.fallback_to_original);
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn test_unparseable_fallback_is_ignored() {
        let mut config = Config::default();
        config.apply_env_overrides(|k| (k == "ARGON_FALLBACK").then(|| "maybe".to_string()));
        assert!(config.pass.fallback_to_original);
    }

    #[test]
    fn test_unknown_preset() {
        let mut config = Config::default();
        config.layout.preset = "bds-9.9".into();
        assert!(matches!(
            config.layout_contract(),
            Err(ConfigError::UnknownPreset(name)) if name == "bds-9.9"
        ));
    }

    #[test]
    fn test_merge_tables_is_key_by_key() {
        let mut base: toml::Table = toml::from_str("[faults]\nlog_burst = 5\nlog_every = 7").unwrap();
        let overlay: toml::Table = toml::from_str("[faults]\nlog_every = 9").unwrap();
        merge_tables(&mut base, overlay);
        let config: Config = toml::Value::Table(base).try_into().unwrap();
        assert_eq!(config.faults.log_burst, 5);
        assert_eq!(config.faults.log_every, 9);
    }
}
