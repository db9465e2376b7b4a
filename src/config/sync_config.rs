//! metagroup-sync configuration file handling
//!
//! Loads and saves ~/.config/metagroup-sync/config.yaml.

use crate::policy::SyncPolicy;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn config_dir() -> PathBuf {
    // Always use ~/.config for consistency across platforms (macOS, Linux)
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".config");
    path.push("metagroup-sync");
    path
}

fn default_database() -> PathBuf {
    config_dir().join("roster.db")
}

fn default_poll_interval_secs() -> u64 {
    300
}

fn default_event_channel_capacity() -> usize {
    1000
}

/// Daemon settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonSettings {
    /// Seconds between scheduled sweeps
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Capacity of the daemon's event broadcast channel
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl DaemonSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

/// metagroup-sync configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Path of the roster database
    #[serde(default = "default_database")]
    pub database: PathBuf,

    #[serde(default)]
    pub policy: SyncPolicy,

    #[serde(default)]
    pub daemon: DaemonSettings,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            policy: SyncPolicy::default(),
            daemon: DaemonSettings::default(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from the default path
    pub fn load_default() -> Result<Self> {
        Self::load(Self::default_path())
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(crate::SyncError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading metagroup-sync configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        tracing::debug!(
            database = %config.database.display(),
            enabled = config.policy.enabled,
            sync_all = config.policy.sync_all,
            unenrol_action = %config.policy.unenrol_action,
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Load `path` (or the default path); a missing file yields the defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        if path.exists() {
            Self::load(&path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Save configuration to the default path
    pub fn save_default(&self) -> Result<()> {
        self.save(Self::default_path())
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving metagroup-sync configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Get the default config path (~/.config/metagroup-sync/config.yaml)
    pub fn default_path() -> PathBuf {
        config_dir().join("config.yaml")
    }
}
