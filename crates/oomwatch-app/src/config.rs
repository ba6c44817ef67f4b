//! Configuration management
//!
//! Handles loading and saving the oomwatch configuration file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use oomwatch_core::StateStore;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config directory not found")]
    NoConfigDir,
}

/// OOM detection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OomConfig {
    /// Run OOM detection at all (false acts like the disabled flag)
    pub enabled: bool,
    /// Directory for the state record (None = private cache directory)
    pub state_dir: Option<PathBuf>,
    /// Directory where the crash reporter leaves its crash marker
    pub crash_dir: Option<PathBuf>,
    /// Version of the running application
    pub app_version: Option<String>,
    /// Do not report a previous session written by a different version
    pub suppress_on_version_change: bool,
    /// Attributes added to every report
    pub attributes: BTreeMap<String, String>,
}

impl Default for OomConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            state_dir: None,
            crash_dir: None,
            app_version: None,
            suppress_on_version_change: false,
            attributes: BTreeMap::new(),
        }
    }
}

impl OomConfig {
    /// State store for this configuration
    pub fn store(&self) -> StateStore {
        match self.state_dir {
            Some(ref dir) => StateStore::new(dir),
            None => StateStore::default_location(),
        }
    }

    /// Directory the crash marker is looked up in
    ///
    /// Defaults to a `crashes` sibling of the state directory, so the two
    /// never share a directory.
    pub fn crash_dir(&self) -> PathBuf {
        match self.crash_dir {
            Some(ref dir) => dir.clone(),
            None => {
                let store = self.store();
                store
                    .dir()
                    .parent()
                    .map(|p| p.join("crashes"))
                    .unwrap_or_else(|| store.dir().join("crashes"))
            }
        }
    }
}

/// Get the config directory
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "oomwatch", "oomwatch").map(|p| p.config_dir().to_path_buf())
}

/// Get the config file path
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("config.toml"))
}

/// Load configuration from the default location
pub fn load_config() -> Result<OomConfig, ConfigError> {
    let path = config_path().ok_or(ConfigError::NoConfigDir)?;
    load_config_from(&path)
}

/// Load configuration from a file, returning defaults if it does not exist
pub fn load_config_from(path: &Path) -> Result<OomConfig, ConfigError> {
    if !path.exists() {
        log::debug!("No config at {}, using defaults", path.display());
        return Ok(OomConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: OomConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to the default location
pub fn save_config(config: &OomConfig) -> Result<(), ConfigError> {
    let path = config_path().ok_or(ConfigError::NoConfigDir)?;
    save_config_to(config, &path)
}

/// Save configuration to a file
pub fn save_config_to(config: &OomConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, &content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        let _ = std::fs::set_permissions(path, perms);
    }

    Ok(())
}
