//! Webpatch Configuration Module
//! Handles loading and validating webpatch.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use super::updater::codec::DEFAULT_MAX_UNPACKED_BYTES;
use super::updater::download::DEFAULT_MAX_DOWNLOAD_BYTES;
use super::updater::pipeline::os_name;

pub const CONFIG_FILE: &str = "webpatch.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid manifest URL {0:?}")]
    InvalidManifestUrl(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    pub manifest_url: String,
    /// Sent with every manifest request.
    pub installation_id: Uuid,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_download")]
    pub max_download_bytes: u64,
    #[serde(default = "default_max_unpacked")]
    pub max_unpacked_bytes: u64,
}

fn default_manifest_url() -> String {
    "https://updates.webpatch.dev/manifest.json".to_string()
}

fn default_platform() -> String {
    os_name().to_string()
}

fn default_check_interval() -> u64 {
    20 * 60
}

fn default_request_timeout() -> u64 {
    60
}

fn default_max_download() -> u64 {
    DEFAULT_MAX_DOWNLOAD_BYTES
}

fn default_max_unpacked() -> u64 {
    DEFAULT_MAX_UNPACKED_BYTES
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            manifest_url: default_manifest_url(),
            installation_id: Uuid::new_v4(),
            platform: default_platform(),
            check_interval_secs: default_check_interval(),
            request_timeout_secs: default_request_timeout(),
            max_download_bytes: default_max_download(),
            max_unpacked_bytes: default_max_unpacked(),
        }
    }
}

impl UpdaterConfig {
    pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = data_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path));
        }
        let content = std::fs::read_to_string(&config_path)?;
        let config: UpdaterConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, data_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(data_dir)?;
        let config_path = data_dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// Load the config, writing a fresh one (with a new installation id) on
    /// first run.
    pub fn load_or_create(data_dir: &Path) -> Result<Self, ConfigError> {
        match Self::load(data_dir) {
            Err(ConfigError::NotFound(_)) => {
                let config = Self::default();
                config.save(data_dir)?;
                Ok(config)
            }
            other => other,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        reqwest::Url::parse(&self.manifest_url)
            .map(|_| ())
            .map_err(|_| ConfigError::InvalidManifestUrl(self.manifest_url.clone()))
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// `--data-dir` if given, else the per-user data directory.
pub fn resolve_data_dir(explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("webpatch")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_or_create_persists_installation_id() {
        let dir = tempdir().unwrap();
        let first = UpdaterConfig::load_or_create(dir.path()).unwrap();
        assert!(dir.path().join(CONFIG_FILE).exists());

        let second = UpdaterConfig::load_or_create(dir.path()).unwrap();
        assert_eq!(first.installation_id, second.installation_id);
        assert_eq!(second.check_interval(), Duration::from_secs(1200));
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{
                "manifest_url": "https://updates.example.org/manifest.json",
                "installation_id": "0b7e6a3c-1f2d-4c5b-9a8e-7d6c5b4a3f21"
            }"#,
        )
        .unwrap();

        let config = UpdaterConfig::load(dir.path()).unwrap();
        assert_eq!(config.request_timeout_secs, 60);
        assert_eq!(config.max_download_bytes, DEFAULT_MAX_DOWNLOAD_BYTES);
        assert_eq!(config.platform, os_name());
    }

    #[test]
    fn test_invalid_manifest_url() {
        let dir = tempdir().unwrap();
        let config = UpdaterConfig {
            manifest_url: "not a url".to_string(),
            ..Default::default()
        };
        config.save(dir.path()).unwrap();

        assert!(matches!(
            UpdaterConfig::load(dir.path()),
            Err(ConfigError::InvalidManifestUrl(_))
        ));
    }

    #[test]
    fn test_load_missing() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            UpdaterConfig::load(dir.path()),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn test_explicit_data_dir_wins() {
        let dir = PathBuf::from("/srv/webpatch");
        assert_eq!(resolve_data_dir(Some(dir.clone())), dir);
    }
}
