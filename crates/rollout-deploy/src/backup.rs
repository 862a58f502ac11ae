//! Pre-deployment snapshots and their retention.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use rollout_common::{Error, Result};
use rollout_config::{BackupConfig, BackupMethod};
use rollout_db::Database;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::export::ExportService;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize)]
pub struct BackupMetadata {
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub migration_number: i64,
    pub method: BackupMethod,
    pub file_path: PathBuf,
    pub size_bytes: u64,
}

/// A file found in the backup directory.
#[derive(Debug, Clone, Serialize)]
pub struct BackupFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

pub struct BackupService<'a> {
    db: &'a Database,
    exporter: &'a dyn ExportService,
    dir: PathBuf,
    method: BackupMethod,
    dump_tool: String,
}

impl<'a> BackupService<'a> {
    pub fn new(db: &'a Database, exporter: &'a dyn ExportService, config: &BackupConfig) -> Self {
        Self {
            db,
            exporter,
            dir: config.dir.clone(),
            method: config.method,
            dump_tool: config.dump_tool.clone(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Back up with the configured method.
    pub fn create_backup(&self, version: &str, migration_number: i64) -> Result<BackupMetadata> {
        match self.method {
            BackupMethod::Structured => self.create_structured_backup(version, migration_number),
            BackupMethod::NativeDump => self.create_native_dump(version, migration_number),
        }
    }

    pub fn create_structured_backup(
        &self,
        version: &str,
        migration_number: i64,
    ) -> Result<BackupMetadata> {
        self.ensure_dir()?;
        let timestamp = Utc::now();

        let summary = self
            .exporter
            .export(&self.dir)
            .map_err(|e| Error::Backup(format!("export failed: {e}")))?;

        let file_path =
            self.unused_path(timestamp, version, migration_number, BackupMethod::Structured);
        std::fs::rename(&summary.path, &file_path).map_err(|e| {
            Error::Backup(format!(
                "failed to rename {} to {}: {e}",
                summary.path.display(),
                file_path.display()
            ))
        })?;

        self.finish(timestamp, version, migration_number, BackupMethod::Structured, file_path)
    }

    /// Dump the database with the engine's own tool (`<tool> <db> .dump`).
    pub fn create_native_dump(&self, version: &str, migration_number: i64) -> Result<BackupMetadata> {
        let db_path = self
            .db
            .path()
            .ok_or_else(|| Error::Backup("native dump requires a file-backed database".into()))?;

        self.ensure_dir()?;
        let timestamp = Utc::now();

        debug!("running {} on {}", self.dump_tool, db_path.display());
        let output = Command::new(&self.dump_tool)
            .arg(db_path)
            .arg(".dump")
            .output()
            .map_err(|e| Error::Backup(format!("failed to run {}: {e}", self.dump_tool)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Backup(format!(
                "{} exited with {}: {}",
                self.dump_tool,
                output.status,
                stderr.trim()
            )));
        }

        let file_path =
            self.unused_path(timestamp, version, migration_number, BackupMethod::NativeDump);
        std::fs::write(&file_path, &output.stdout)
            .map_err(|e| Error::Backup(format!("failed to write {}: {e}", file_path.display())))?;

        self.finish(timestamp, version, migration_number, BackupMethod::NativeDump, file_path)
    }

    fn finish(
        &self,
        timestamp: DateTime<Utc>,
        version: &str,
        migration_number: i64,
        method: BackupMethod,
        file_path: PathBuf,
    ) -> Result<BackupMetadata> {
        let size_bytes = std::fs::metadata(&file_path)?.len();
        info!(
            "{method} backup created: {} ({size_bytes} bytes)",
            file_path.display()
        );
        Ok(BackupMetadata {
            timestamp,
            version: version.to_string(),
            migration_number,
            method,
            file_path,
            size_bytes,
        })
    }

    /// Path for a new backup. Backups taken within the same second get a
    /// `_<n>` suffix instead of replacing each other.
    fn unused_path(
        &self,
        timestamp: DateTime<Utc>,
        version: &str,
        migration_number: i64,
        method: BackupMethod,
    ) -> PathBuf {
        let name = backup_file_name(timestamp, version, migration_number, method);
        let mut path = self.dir.join(&name);
        let stem = name
            .strip_suffix(&format!(".{}", method.extension()))
            .unwrap_or(&name)
            .to_string();
        let mut n = 2;
        while path.exists() {
            path = self.dir.join(format!("{stem}_{n}.{}", method.extension()));
            n += 1;
        }
        path
    }

    fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            Error::Backup(format!(
                "failed to create backup directory {}: {e}",
                self.dir.display()
            ))
        })
    }

    /// Delete backup files last modified more than `retention_days` ago.
    /// Returns how many were removed.
    pub fn cleanup(&self, retention_days: u32) -> Result<usize> {
        if !self.dir.exists() {
            return Ok(0);
        }

        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(u64::from(retention_days) * SECONDS_PER_DAY))
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut deleted = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                continue;
            }

            if metadata.modified()? < cutoff {
                let path = entry.path();
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        debug!("deleted old backup {}", path.display());
                        deleted += 1;
                    }
                    Err(e) => warn!("failed to delete {}: {e}", path.display()),
                }
            }
        }

        info!("backup cleanup removed {deleted} file(s) older than {retention_days} day(s)");
        Ok(deleted)
    }

    /// Backup files, newest first.
    pub fn list(&self) -> Result<Vec<BackupFile>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                continue;
            }
            files.push(BackupFile {
                path: entry.path(),
                size_bytes: metadata.len(),
                modified: DateTime::<Utc>::from(metadata.modified()?),
            });
        }

        files.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.path.cmp(&b.path)));
        Ok(files)
    }
}

/// `backup_<YYYYMMDD_HHMMSS>_v<version>_m<number>.<ext>`
pub fn backup_file_name(
    timestamp: DateTime<Utc>,
    version: &str,
    migration_number: i64,
    method: BackupMethod,
) -> String {
    format!(
        "backup_{}_v{version}_m{migration_number}.{}",
        timestamp.format("%Y%m%d_%H%M%S"),
        method.extension()
    )
}
