//! Configuration loading and defaults

use devsense_core::{CacheConfig, DetectorOptions, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to encode configuration: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub detector: DetectorOptions,
    #[serde(default)]
    pub loader: RetryPolicy,
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Readings for the static host environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_pixel_ratio")]
    pub pixel_ratio: f64,
    /// User-agent string to classify
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub max_touch_points: u32,
    /// Capability modules loaded on start
    #[serde(default = "default_modules")]
    pub modules: Vec<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            pixel_ratio: default_pixel_ratio(),
            user_agent: default_user_agent(),
            max_touch_points: 0,
            modules: default_modules(),
        }
    }
}

fn default_width() -> u32 {
    1920
}

fn default_height() -> u32 {
    1080
}

fn default_pixel_ratio() -> f64 {
    1.0
}

fn default_user_agent() -> String {
    format!(
        "devsense/{} ({})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS
    )
}

fn default_modules() -> Vec<String> {
    vec!["platform".to_string(), "network".to_string()]
}

/// Load configuration from file, or defaults when it does not exist
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(&Config::default())?;
    std::fs::write(path, content).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "Wrote default configuration");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use devsense_core::Backoff;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.cache.capacity, 100);
        assert_eq!(config.detector.debounce_delay_ms, 250);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devsense.toml");
        std::fs::write(
            &path,
            r#"
[host]
width = 390
modules = ["platform"]

[detector.breakpoints]
mobile = 600

[loader]
max_retries = 1
backoff = "exponential"
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.host.width, 390);
        assert_eq!(config.host.height, 1080);
        assert_eq!(config.host.modules, vec!["platform"]);
        assert_eq!(config.detector.breakpoints.mobile, 600);
        assert_eq!(config.detector.breakpoints.tablet, 1024);
        assert!(config.detector.enable_resize);
        assert_eq!(config.loader.max_retries, 1);
        assert_eq!(config.loader.backoff, Backoff::Exponential);
        assert_eq!(config.cache, CacheConfig::default());
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devsense.toml");
        std::fs::write(&path, "[cache]\ncapacity = \"lots\"\n").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_saved_defaults_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devsense.toml");

        save_default_config(&path).unwrap();

        assert_eq!(load_config(&path).unwrap(), Config::default());
    }
}
