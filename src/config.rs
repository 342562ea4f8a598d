//! Persistent settings for the shell binary.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::LevelFilter;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    /// Byte offset of the FAT32 volume inside the image.
    pub partition_offset: u64,
    /// One of off/error/warn/info/debug/trace.
    pub log_level: String,
    /// Make a bare `ls` behave like `ls -l`.
    pub long_listing: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            partition_offset: 0,
            log_level: "warn".to_string(),
            long_listing: false,
        }
    }
}

impl AppConfig {
    /// Get the user config directory path
    pub fn user_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("rusty-fat32"))
    }

    /// Get the user config file path
    pub fn user_config_path() -> Option<PathBuf> {
        Self::user_config_dir().map(|dir| dir.join("config.json"))
    }

    /// Load configuration from config.json
    pub fn load() -> Self {
        // Try to load from user config directory first (highest priority)
        if let Some(user_config) = Self::user_config_path() {
            if let Ok(config) = Self::load_from_path(&user_config) {
                return config;
            }
        }

        // Try to load from current directory
        if let Ok(config) = Self::load_from_path("config.json") {
            return config;
        }

        Self::default()
    }

    /// Save configuration to user config directory
    pub fn save(&self) -> Result<()> {
        let config_dir =
            Self::user_config_dir().context("could not determine user config directory")?;
        fs::create_dir_all(&config_dir)
            .with_context(|| format!("cannot create {}", config_dir.display()))?;
        self.save_to_path(config_dir.join("config.json"))
    }

    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), json)
            .with_context(|| format!("cannot write {}", path.as_ref().display()))?;
        Ok(())
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("cannot read {}", path.as_ref().display()))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("invalid config {}", path.as_ref().display()))?;
        Ok(config)
    }

    /// The configured log level, `Warn` when unrecognised.
    pub fn level_filter(&self) -> LevelFilter {
        self.log_level.parse().unwrap_or(LevelFilter::Warn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = AppConfig {
            partition_offset: 1_048_576,
            log_level: "debug".into(),
            long_listing: true,
        };
        config.save_to_path(&path).unwrap();
        assert_eq!(AppConfig::load_from_path(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "long_listing": true }"#).unwrap();
        let config = AppConfig::load_from_path(&path).unwrap();
        assert!(config.long_listing);
        assert_eq!(config.partition_offset, 0);
        assert_eq!(config.level_filter(), LevelFilter::Warn);
    }

    #[test]
    fn test_level_filter() {
        let mut config = AppConfig::default();
        config.log_level = "DEBUG".into();
        assert_eq!(config.level_filter(), LevelFilter::Debug);
        config.log_level = "chatty".into();
        assert_eq!(config.level_filter(), LevelFilter::Warn);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "not json").unwrap();
        assert!(AppConfig::load_from_path(&path).is_err());
    }
}
