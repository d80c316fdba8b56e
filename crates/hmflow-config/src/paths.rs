//! Platform-specific configuration paths and user defaults.
//!
//! # Directory Structure
//!
//! - **User config**: `~/.config/hmflow/` (Linux), `~/Library/Application Support/hmflow/` (macOS), `%APPDATA%\hmflow\` (Windows)
//! - **Defaults**: `<user config>/defaults.toml`, holding a `[params]` table
//!   with the same fields as a solve file's
//!
//! ```toml
//! [params]
//! iterations = 200
//! device_memory_fraction = 0.8
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::solve_file::ParamsConfig;

/// Application name used for directory paths.
const APP_NAME: &str = "hmflow";

/// File name of the user defaults.
const DEFAULTS_FILE: &str = "defaults.toml";

/// Returns the user-specific configuration directory.
///
/// Returns a fallback path if the config directory cannot be determined.
pub fn user_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Path of the user defaults file.
pub fn defaults_path() -> PathBuf {
    user_config_dir().join(DEFAULTS_FILE)
}

/// Ensures the user config directory exists, creating it if necessary.
pub fn ensure_user_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = user_config_dir();
    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| ConfigError::create_dir(&dir, e))?;
    }
    Ok(dir)
}

/// Contents of a defaults file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserDefaults {
    /// Parameters applied beneath every solve file.
    #[serde(default)]
    pub params: ParamsConfig,
}

impl UserDefaults {
    /// Reads defaults from `path`; a missing file yields empty defaults.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
        Ok(toml::from_str(&content)?)
    }

    /// Reads the user defaults file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(defaults_path())
    }

    /// Writes defaults to `path`.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| ConfigError::write_file(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn config_dir_ends_with_app_name() {
        assert!(user_config_dir().ends_with(APP_NAME));
        assert!(defaults_path().ends_with("hmflow/defaults.toml"));
    }

    #[test]
    fn missing_defaults_are_empty() {
        let dir = TempDir::new().unwrap();
        let d = UserDefaults::load_from(dir.path().join("none.toml")).unwrap();
        assert_eq!(d, UserDefaults::default());
    }

    #[test]
    fn defaults_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(DEFAULTS_FILE);
        let d = UserDefaults {
            params: ParamsConfig {
                iterations: Some(42),
                devices: Some(vec![1, 0]),
                ..ParamsConfig::default()
            },
        };
        d.save_to(&path).unwrap();
        assert_eq!(UserDefaults::load_from(&path).unwrap(), d);
    }

    #[test]
    fn malformed_defaults_are_parse_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(DEFAULTS_FILE);
        std::fs::write(&path, "[params]\niterations = \"many\"\n").unwrap();
        assert!(matches!(
            UserDefaults::load_from(&path),
            Err(ConfigError::TomlParse(_))
        ));
    }
}
