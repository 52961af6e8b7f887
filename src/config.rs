use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::app::{APP_ID, CONFIG_FILE_NAME};

/// Executable looked up on PATH when none is configured
pub const DEFAULT_EXECUTABLE: &str = "node";

/// Supervisor configuration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Host executable used to run worker entry modules
    /// Resolved on PATH when not set
    pub executable: Option<PathBuf>,

    /// Bootstrap module every worker is launched with
    pub bootstrap_module: PathBuf,

    /// Grace period before a worker is killed on shutdown
    pub exit_timeout_ms: u64,

    /// Capacity of the host crash notification channel
    pub crash_channel_capacity: usize,

    /// Additional environment keys never handed to workers
    pub denied_env_keys: Vec<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            executable: None,
            bootstrap_module: PathBuf::from("bootstrap-fork.js"),
            exit_timeout_ms: 5000,
            crash_channel_capacity: 64,
            denied_env_keys: Vec::new(),
        }
    }
}

impl SupervisorConfig {
    /// Load configuration from the user config file, falling back to defaults
    pub fn load() -> Self {
        match Self::config_path() {
            Ok(path) if path.exists() => match Self::load_from(&path) {
                Ok(config) => {
                    info!("Loaded supervisor config from {:?}", path);
                    return config;
                }
                Err(e) => warn!("Ignoring unreadable supervisor config {:?}: {:#}", path, e),
            },
            Ok(_) => {}
            Err(e) => warn!("Failed to get config path: {:#}", e),
        }

        Self::default()
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        serde_json::from_str(&contents).with_context(|| format!("Failed to parse config {:?}", path))
    }

    /// Save configuration to the user config file
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).with_context(|| format!("Failed to write config {:?}", path))?;

        info!("Saved supervisor config to {:?}", path);
        Ok(())
    }

    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let base = dirs::config_dir().ok_or_else(|| anyhow!("Could not determine config directory"))?;
        Ok(base.join(APP_ID).join(CONFIG_FILE_NAME))
    }

    /// Configured executable, or the default one found on PATH
    pub fn resolve_executable(&self) -> Result<PathBuf> {
        if let Some(executable) = &self.executable {
            return Ok(executable.clone());
        }

        which::which(DEFAULT_EXECUTABLE)
            .with_context(|| format!("Could not find `{}` on PATH", DEFAULT_EXECUTABLE))
    }

    pub fn exit_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_timeout_ms)
    }
}
