use crate::error::{ModelError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub download: DownloadConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct PathsConfig {
    /// Root of the resource directory; defaults to `$XDG_DATA_HOME/modelvault`
    pub resource_dir: Option<PathBuf>,
    /// Manifest location; defaults to `<resource_dir>/manifest.json`
    pub manifest: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct DownloadConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_min_free_space_mb")]
    pub min_free_space_mb: u64,
}

// Default value functions
fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_read_timeout_secs() -> u64 {
    60
}
fn default_max_concurrent() -> usize {
    2
}
fn default_user_agent() -> String {
    format!("modelvault/{}", env!("CARGO_PKG_VERSION"))
}
fn default_min_free_space_mb() -> u64 {
    100
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            max_concurrent: default_max_concurrent(),
            user_agent: default_user_agent(),
            min_free_space_mb: default_min_free_space_mb(),
        }
    }
}

impl DownloadConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl Config {
    /// Load config from the XDG location, falling back to defaults
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load config from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ModelError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| ModelError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;

        Ok(config)
    }

    /// Reject values that would make downloads hang or never start
    pub fn validate(&self) -> Result<()> {
        if self.download.connect_timeout_secs == 0 {
            return Err(ModelError::Config(
                "download.connect_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.download.read_timeout_secs == 0 {
            return Err(ModelError::Config(
                "download.read_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.download.max_concurrent == 0 {
            return Err(ModelError::Config(
                "download.max_concurrent must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolved resource directory
    pub fn resource_dir(&self) -> Result<PathBuf> {
        match &self.paths.resource_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(data_dir()?.join("modelvault")),
        }
    }

    /// Resolved manifest path
    pub fn manifest_path(&self) -> Result<PathBuf> {
        match &self.paths.manifest {
            Some(path) => Ok(path.clone()),
            None => Ok(self.resource_dir()?.join("manifest.json")),
        }
    }
}

/// `$XDG_CONFIG_HOME/modelvault/config.toml`
pub fn config_path() -> Result<PathBuf> {
    let config_dir = if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config)
    } else {
        dirs::config_dir()
            .ok_or_else(|| ModelError::Config("Unable to determine config directory".to_string()))?
    };

    Ok(config_dir.join("modelvault").join("config.toml"))
}

fn data_dir() -> Result<PathBuf> {
    if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
        return Ok(PathBuf::from(xdg_data));
    }
    dirs::data_dir().ok_or_else(|| ModelError::Config("Unable to determine data directory".to_string()))
}
