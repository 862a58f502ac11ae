use std::fmt;
use std::path::PathBuf;

use rollout_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// Path value that opens an in-memory SQLite database.
pub const IN_MEMORY_PATH: &str = ":memory:";

/// Top-level configuration for the deployment tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    pub database: DatabaseConfig,
    pub backup: BackupConfig,
    pub master_data: MasterDataConfig,
    pub export: ExportConfig,
    pub install: InstallConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/rollout.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    pub fn is_in_memory(&self) -> bool {
        self.path.as_os_str() == IN_MEMORY_PATH
    }
}

/// How a pre-deployment snapshot is produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupMethod {
    /// Portable JSON export through the export service.
    #[default]
    Structured,
    /// The storage engine's own dump tool.
    NativeDump,
}

impl BackupMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structured => "structured",
            Self::NativeDump => "native-dump",
        }
    }

    /// File extension used for backups produced by this method.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Structured => "json",
            Self::NativeDump => "sql",
        }
    }
}

impl fmt::Display for BackupMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub dir: PathBuf,
    pub method: BackupMethod,
    pub retention_days: u32,
    pub dump_tool: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./backups"),
            method: BackupMethod::Structured,
            retention_days: 30,
            dump_tool: "sqlite3".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterDataConfig {
    pub dir: PathBuf,
    pub game_system: String,
}

impl Default for MasterDataConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./masterdata"),
            game_system: "midgard".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Default target for deployment packages.
    pub dir: PathBuf,
    /// Where the pre-migration state export lands during a full deployment.
    pub pre_deploy_dir: PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./export_temp"),
            pre_deploy_dir: PathBuf::from("./tmp"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    pub admin_username: Option<String>,
    #[serde(skip_serializing)]
    pub admin_password: Option<String>,
}

impl DeployConfig {
    /// Reject configurations that cannot work before anything touches the database.
    pub fn validate(&self) -> Result<()> {
        if self.database.path.as_os_str().is_empty() {
            return Err(Error::Config("database.path cannot be empty".into()));
        }
        if self.backup.dir.as_os_str().is_empty() {
            return Err(Error::Config("backup.dir cannot be empty".into()));
        }
        if self.backup.retention_days == 0 {
            return Err(Error::Config(
                "backup.retention_days must be at least 1".into(),
            ));
        }
        if self.backup.method == BackupMethod::NativeDump {
            if self.database.is_in_memory() {
                return Err(Error::Config(
                    "native-dump backups require a file-backed database".into(),
                ));
            }
            if self.backup.dump_tool.trim().is_empty() {
                return Err(Error::Config("backup.dump_tool cannot be empty".into()));
            }
        }
        if self.master_data.game_system.trim().is_empty() {
            return Err(Error::Config("master_data.game_system cannot be empty".into()));
        }
        Ok(())
    }
}
