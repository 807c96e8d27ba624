//! Configuration management for oms

mod server;
pub mod serde_utils;

pub use server::{AppConfig, DbConfig, RunMode, ServerConfig, DEFAULT_TMP_PATH, PLUGIN_PATH, UPLOAD_PATH};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Config file looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Example config compiled into the binary
pub const EMBEDDED_EXAMPLE: &str = include_str!("../../configs/config.yaml.example");

/// Where a loaded configuration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Embedded,
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = serde_yaml::to_string(config)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
        }
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

/// Resolve the server configuration.
///
/// An explicit path must exist. Without one, `./config.yaml` is read if
/// present; otherwise the embedded example is parsed and written out to
/// `./config.yaml` for the next start.
pub fn load_server_config(
    path: Option<&Path>,
) -> Result<(ServerConfig, ConfigSource), ConfigError> {
    load_server_config_in(path, Path::new("."))
}

/// Same as [`load_server_config`] with an explicit working directory.
pub fn load_server_config_in(
    path: Option<&Path>,
    cwd: &Path,
) -> Result<(ServerConfig, ConfigSource), ConfigError> {
    if let Some(path) = path.filter(|p| !p.as_os_str().is_empty()) {
        let config = load_config(path)?;
        return Ok((config, ConfigSource::File(path.to_path_buf())));
    }

    let local = cwd.join(DEFAULT_CONFIG_FILE);
    if local.exists() {
        let config = load_config(&local)?;
        return Ok((config, ConfigSource::File(local)));
    }

    let config: ServerConfig = serde_yaml::from_str(EMBEDDED_EXAMPLE)?;
    if let Err(e) = std::fs::write(&local, EMBEDDED_EXAMPLE) {
        tracing::warn!("Failed to write default config to {:?}: {}", local, e);
    }
    Ok((config, ConfigSource::Embedded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_embedded_example_parses() {
        let config: ServerConfig = serde_yaml::from_str(EMBEDDED_EXAMPLE).unwrap();
        assert_eq!(config.db.driver, "sqlite");
        assert_eq!(config.app.port, 9090);
        assert_eq!(config.app.temp_date, Duration::from_secs(168 * 3600));
    }

    #[test]
    fn test_falls_back_to_embedded_and_writes_it() {
        let dir = tempfile::tempdir().unwrap();
        let (config, source) = load_server_config_in(None, dir.path()).unwrap();
        assert_eq!(source, ConfigSource::Embedded);
        assert_eq!(config.app.name, "oms");
        assert!(dir.path().join(DEFAULT_CONFIG_FILE).exists());

        // second start picks up the written copy
        let (_, source) = load_server_config_in(None, dir.path()).unwrap();
        assert_eq!(
            source,
            ConfigSource::File(dir.path().join(DEFAULT_CONFIG_FILE))
        );
    }

    #[test]
    fn test_explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        let err = load_server_config_in(Some(&missing), dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.yaml");
        std::fs::write(&path, "app:\n  port: 8080\n  mode: dev\n").unwrap();
        let (config, _) = load_server_config_in(Some(&path), dir.path()).unwrap();
        assert_eq!(config.app.port, 8080);
        assert_eq!(config.app.mode, RunMode::Dev);
        assert_eq!(config.db.driver, "sqlite");
        assert_eq!(config.default_log_level(), "debug");
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let mut config = ServerConfig::default();
        config.app.temp_date = Duration::from_secs(3600);
        save_config(&path, &config).unwrap();
        let loaded: ServerConfig = load_config(&path).unwrap();
        assert_eq!(loaded.app.temp_date, Duration::from_secs(3600));
    }
}
