//! Test environment abstraction for isolated config testing.
//!
//! Provides `TestEnvironment` to manage:
//! - An isolated "home" with `.argon/config.toml`
//! - An isolated project root with its own `.argon/config.toml`
//! - Scratch layout contract files
//!
//! # Usage
//!
//! ```ignore
//! use argon_config::testing::TestEnvironment;
//!
//! let env = TestEnvironment::new()?;
//! env.write_global("[pass]\nfallback_to_original = false\n")?;
//! let config = env.load()?;
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use tempfile::TempDir;

use crate::{Config, ConfigError};

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated config environment
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Stand-in for the user's home directory
    pub home: PathBuf,
    /// Project root for the test
    pub project_root: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let home = root.join("home");
        let project_root = root.join("project");
        std::fs::create_dir_all(home.join(".argon"))?;
        std::fs::create_dir_all(project_root.join(".argon"))?;

        Ok(Self {
            _temp_dir: temp_dir,
            home,
            project_root,
            test_id,
        })
    }

    pub fn global_config_path(&self) -> PathBuf {
        self.home.join(".argon").join("config.toml")
    }

    pub fn project_config_path(&self) -> PathBuf {
        self.project_root.join(".argon").join("config.toml")
    }

    pub fn write_global(&self, contents: &str) -> std::io::Result<()> {
        std::fs::write(self.global_config_path(), contents)
    }

    pub fn write_project(&self, contents: &str) -> std::io::Result<()> {
        std::fs::write(self.project_config_path(), contents)
    }

    /// Write a layout contract file into the project and return its path
    pub fn write_layout(&self, name: &str, contents: &str) -> std::io::Result<PathBuf> {
        let path = self
            .project_root
            .join(".argon")
            .join(format!("{}-{}.toml", name, self.test_id));
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    /// Load config from this environment's files (no environment overrides)
    pub fn load(&self) -> Result<Config, ConfigError> {
        Config::load_from(
            Some(&self.global_config_path()),
            Some(&self.project_config_path()),
        )
    }
}
