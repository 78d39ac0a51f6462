//! Configuration loading.
//!
//! Reads `~/.fleet/config.toml` unless a path is given. A missing file yields
//! defaults; a malformed file is an error.
//!
//! ```toml
//! [deployment]
//! mode = "self_managed"   # or "hosted_metered"
//!
//! [store]
//! path = "/var/lib/fleet/devices.db"
//!
//! [logging]
//! dir = "/var/log/fleet"
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{LifecycleError, Result};
use crate::quota::{DeploymentMode, QuotaGuard};

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct DeploymentConfig {
    #[serde(default)]
    pub mode: DeploymentMode,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FleetConfig {
    #[serde(default)]
    pub deployment: DeploymentConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl FleetConfig {
    pub fn quota_guard(&self) -> QuotaGuard {
        QuotaGuard::new(self.deployment.mode)
    }

    /// Configured database path, falling back to `~/.fleet/devices.db`.
    pub fn db_path(&self) -> Result<PathBuf> {
        match &self.store.path {
            Some(path) => Ok(path.clone()),
            None => default_db_path(),
        }
    }
}

/// Returns the path to the fleet directory (~/.fleet).
pub fn get_fleet_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".fleet"))
}

pub fn default_config_path() -> Result<PathBuf> {
    get_fleet_dir()
        .map(|dir| dir.join("config.toml"))
        .ok_or_else(home_not_found)
}

pub fn default_db_path() -> Result<PathBuf> {
    get_fleet_dir()
        .map(|dir| dir.join("devices.db"))
        .ok_or_else(home_not_found)
}

pub fn load_config(path: Option<PathBuf>) -> Result<FleetConfig> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(FleetConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| config_error(&config_path, err))?;
    parse_config(&config_path, &content)
}

fn parse_config(path: &Path, content: &str) -> Result<FleetConfig> {
    toml::from_str::<FleetConfig>(content).map_err(|err| config_error(path, err))
}

fn config_error(path: &Path, err: impl std::fmt::Display) -> LifecycleError {
    LifecycleError::Config {
        path: path.display().to_string(),
        details: err.to_string(),
    }
}

fn home_not_found() -> LifecycleError {
    LifecycleError::Config {
        path: "~".to_string(),
        details: "Home directory not found".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config = load_config(Some(temp_dir.path().join("absent.toml"))).expect("load");
        assert_eq!(config, FleetConfig::default());
        assert_eq!(config.deployment.mode, DeploymentMode::SelfManaged);
    }

    #[test]
    fn parses_all_sections() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(
            &path,
            "[deployment]\nmode = \"hosted_metered\"\n\n[store]\npath = \"/tmp/devices.db\"\n\n[logging]\ndir = \"/tmp/logs\"\n",
        )
        .expect("write config");

        let config = load_config(Some(path)).expect("load");
        assert_eq!(config.deployment.mode, DeploymentMode::HostedMetered);
        assert_eq!(config.db_path().expect("db path"), PathBuf::from("/tmp/devices.db"));
        assert_eq!(config.logging.dir, Some(PathBuf::from("/tmp/logs")));
        assert_eq!(config.quota_guard().mode(), DeploymentMode::HostedMetered);
    }

    #[test]
    fn rejects_unknown_mode() {
        let err = parse_config(Path::new("inline"), "[deployment]\nmode = \"cloud\"\n").unwrap_err();
        assert!(matches!(err, LifecycleError::Config { .. }));
    }
}
