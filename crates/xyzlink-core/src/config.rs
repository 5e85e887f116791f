//! Persistent settings
//!
//! Settings are stored as pretty-printed JSON. Every section falls back to its
//! defaults, so a partial file (or an empty object) is valid.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::protocol::ConnectionConfig;
use crate::upload::UploadConfig;

/// Settings file name inside the application config directory
pub const SETTINGS_FILE: &str = "settings.json";

/// Application directory name
pub const APP_DIR: &str = "xyzlink";

/// Errors reading or writing the settings file
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot access settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid settings in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Cannot serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("No configuration directory on this platform")]
    NoConfigDir,
}

/// Application settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Serial channel settings
    pub connection: ConnectionConfig,
    /// Upload session settings
    pub upload: UploadConfig,
}

impl Settings {
    /// Platform settings path (e.g. `~/.config/xyzlink/settings.json`)
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR).join(SETTINGS_FILE))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load settings from `path`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load settings from `path`, or defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Write settings to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TransferProfile;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE);

        let mut settings = Settings::default();
        settings.connection.port_name = "/dev/ttyACM0".to_string();
        settings.connection.reconnect.max_attempts = Some(5);
        settings.upload.profile = TransferProfile::acknowledged();

        settings.save(&path).unwrap();
        assert_eq!(Settings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(&path, r#"{"connection": {"port_name": "COM3"}}"#).unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.connection.port_name, "COM3");
        assert_eq!(settings.connection.baud_rate, 115200);
        assert_eq!(settings.upload, UploadConfig::default());
    }

    #[test]
    fn test_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_or_default(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings, Settings::default());
        assert!(matches!(
            Settings::load(&dir.path().join("absent.json")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            Settings::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
