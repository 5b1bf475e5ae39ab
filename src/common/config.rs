//! Configuration file handling

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::paths::config_path;
use super::Result;

/// Main configuration structure
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    /// Defaults for test runs
    #[serde(default)]
    pub run: RunDefaults,

    /// Worker process supervision
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Timeout settings
    #[serde(default)]
    pub timeouts: Timeouts,
}

/// Default settings for test runs
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RunDefaults {
    /// Maximum number of tests running at the same time
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Where runs keep their output files and bus socket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Identifier handed to storage when a run starts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            working_dir: None,
            client_id: None,
        }
    }
}

fn default_max_concurrent() -> usize {
    1
}

/// Worker process supervision settings in milliseconds
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SupervisorConfig {
    /// How often a running worker is polled for exit
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How long a worker may take to exit on its own after teardown
    #[serde(default = "default_grace")]
    pub exit_grace_ms: u64,

    /// How long to wait after the graceful termination signal
    #[serde(default = "default_grace")]
    pub terminate_grace_ms: u64,

    /// How long to wait after the forced kill before giving up
    #[serde(default = "default_grace")]
    pub kill_grace_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            exit_grace_ms: default_grace(),
            terminate_grace_ms: default_grace(),
            kill_grace_ms: default_grace(),
        }
    }
}

impl SupervisorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

fn default_poll_interval() -> u64 {
    500
}
fn default_grace() -> u64 {
    1000
}

/// Timeout settings in seconds
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Timeouts {
    /// How long a proxy waits for a worker to acknowledge remoteStop
    #[serde(default = "default_remote_stop")]
    pub remote_stop_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            remote_stop_secs: default_remote_stop(),
        }
    }
}

impl Timeouts {
    pub fn remote_stop(&self) -> Duration {
        Duration::from_secs(self.remote_stop_secs)
    }
}

fn default_remote_stop() -> u64 {
    5
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = config_path() {
            if path.exists() {
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    super::Error::FileRead {
                        path: path.display().to_string(),
                        error: e.to_string(),
                    }
                })?;
                return Self::from_toml(&content);
            }
        }
        Ok(Self::default())
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| super::Error::ConfigParse(e.to_string()))
    }
}
