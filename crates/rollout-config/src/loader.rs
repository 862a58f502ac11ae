use std::path::{Path, PathBuf};

use rollout_common::{Error, Result};
use tracing::{info, warn};

use crate::model::DeployConfig;

const ENV_DATABASE_PATH: &str = "ROLLOUT_DATABASE_PATH";
const ENV_BACKUP_DIR: &str = "ROLLOUT_BACKUP_DIR";
const ENV_MASTER_DATA_DIR: &str = "ROLLOUT_MASTER_DATA_DIR";
const ENV_ADMIN_USERNAME: &str = "ROLLOUT_ADMIN_USERNAME";
const ENV_ADMIN_PASSWORD: &str = "ROLLOUT_ADMIN_PASSWORD";

/// Loads `DeployConfig` from YAML or TOML and layers environment overrides on top.
pub struct ConfigLoader;

impl ConfigLoader {
    /// `~/.config/rollout/config.yml` (or the platform equivalent).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("rollout")
            .join("config.yml")
    }

    /// Load the config at `path`, falling back to defaults when the file does
    /// not exist, then apply process environment overrides.
    pub fn load(path: &Path) -> Result<DeployConfig> {
        let mut config = if path.exists() {
            let config = Self::parse_file(path)?;
            info!("configuration loaded from {}", path.display());
            config
        } else {
            warn!(
                "config file {} not found, using defaults",
                path.display()
            );
            DeployConfig::default()
        };

        Self::apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn parse_file(path: &Path) -> Result<DeployConfig> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "yml" | "yaml" => serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("YAML parse error: {e}"))),
            "toml" => {
                toml::from_str(&contents).map_err(|e| Error::Config(format!("TOML parse error: {e}")))
            }
            other => Err(Error::Config(format!(
                "unsupported config extension: {other}"
            ))),
        }
    }

    /// Apply overrides from `lookup`, which maps an environment variable name to its value.
    pub fn apply_env_overrides<F>(config: &mut DeployConfig, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = lookup(ENV_DATABASE_PATH) {
            config.database.path = PathBuf::from(path);
        }
        if let Some(dir) = lookup(ENV_BACKUP_DIR) {
            config.backup.dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(ENV_MASTER_DATA_DIR) {
            config.master_data.dir = PathBuf::from(dir);
        }
        if let Some(username) = lookup(ENV_ADMIN_USERNAME) {
            config.install.admin_username = Some(username);
        }
        if let Some(password) = lookup(ENV_ADMIN_PASSWORD) {
            config.install.admin_password = Some(password);
        }
    }
}
