//! Persisted client configuration.

use anyhow::{Context, Result, anyhow};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const CONFIG_FILE: &str = "config.toml";

/// Project directories for config and log storage.
pub fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("org", "swupdate", "swu-upgrader")
        .ok_or_else(|| anyhow!("failed to determine project directories"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the device web interface.
    pub base_url: String,
    /// Session credential used for the RPC bus and the event stream.
    pub session_id: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://192.168.1.1".to_string(),
            session_id: String::new(),
        }
    }
}

impl ClientConfig {
    /// Path of the config file under the user configuration directory,
    /// creating the directory if needed.
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = project_dirs()?.config_dir().to_path_buf();
        if !config_dir.exists() {
            fs::create_dir_all(&config_dir).context("failed to create config directory")?;
        }

        Ok(config_dir.join(CONFIG_FILE))
    }

    /// Load the config from `path`, falling back to defaults when the
    /// file does not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("no config at {path:?}, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {path:?}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config at {path:?}"))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        fs::write(path, contents).with_context(|| format!("failed to write config to {path:?}"))?;
        debug!("saved config to {path:?}");
        Ok(())
    }
}
