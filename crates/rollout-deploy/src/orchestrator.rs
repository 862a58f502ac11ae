//! Guarded deployment pipeline: backup, compatibility check, migrations,
//! validation.
//!
//! Steps run strictly in sequence. A failing mandatory step ends the run and
//! the report gathered so far comes back with the error. Nothing is rolled
//! back automatically; the backup is the recovery path.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use rollout_common::{BACKEND_VERSION, Error, PartialFailure, Result};
use rollout_db::{
    Database, MigrationRegistry, MigrationResult, MigrationRunner, REQUIRED_DB_VERSION,
    SchemaValidator, ValidationReport, VersionCompatibility,
};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::backup::{BackupMetadata, BackupService};
use crate::export::{ExportService, ExportSummary, gzip_file};

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentReport {
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub success: bool,
    pub fresh_install: bool,
    pub backup: Option<BackupMetadata>,
    pub pre_deploy_export: Option<ExportSummary>,
    pub compatibility: Option<VersionCompatibility>,
    pub migrations: Vec<MigrationResult>,
    pub records_imported: usize,
    pub validation: Option<ValidationReport>,
    pub final_version: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl DeploymentReport {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: 0,
            success: false,
            fresh_install: false,
            backup: None,
            pre_deploy_export: None,
            compatibility: None,
            migrations: Vec::new(),
            records_imported: 0,
            validation: None,
            final_version: String::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn migrations_applied(&self) -> usize {
        self.migrations.iter().filter(|m| m.success).count()
    }

    fn warn(&mut self, message: String) {
        warn!("{message}");
        self.warnings.push(message);
    }
}

/// Export bundle for shipping master data alongside a release.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentPackage {
    pub export: ExportSummary,
    pub compressed_path: PathBuf,
    pub compressed_size_bytes: u64,
    pub backend_version: String,
    pub required_db_version: String,
    pub created_at: DateTime<Utc>,
}

pub struct DeploymentOrchestrator<'a> {
    db: &'a Database,
    registry: &'a MigrationRegistry,
    backup: BackupService<'a>,
    exporter: &'a dyn ExportService,
    pre_deploy_dir: PathBuf,
    required_version: String,
    backend_version: String,
    verbose: bool,
}

impl<'a> DeploymentOrchestrator<'a> {
    pub fn new(
        db: &'a Database,
        registry: &'a MigrationRegistry,
        backup: BackupService<'a>,
        exporter: &'a dyn ExportService,
        pre_deploy_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            db,
            registry,
            backup,
            exporter,
            pre_deploy_dir: pre_deploy_dir.into(),
            required_version: REQUIRED_DB_VERSION.to_string(),
            backend_version: BACKEND_VERSION.to_string(),
            verbose: false,
        }
    }

    /// Override the database version the deployment must end at.
    pub fn required_version(mut self, version: impl Into<String>) -> Self {
        self.required_version = version.into();
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn backup_service(&self) -> &BackupService<'a> {
        &self.backup
    }

    fn runner(&self) -> MigrationRunner<'_> {
        MigrationRunner::new(self.db, self.registry)
            .verbose(self.verbose)
            .backend_version(&self.backend_version)
    }

    /// Backup, compatibility check, migrations and validation.
    pub fn deploy(&self) -> std::result::Result<DeploymentReport, PartialFailure<DeploymentReport>> {
        self.run(false, None)
    }

    /// Like [`deploy`](Self::deploy), plus a best-effort export of the current
    /// state before migrating and an optional import afterwards.
    pub fn full_deployment_with_import(
        &self,
        import_path: Option<&Path>,
    ) -> std::result::Result<DeploymentReport, PartialFailure<DeploymentReport>> {
        self.run(true, import_path)
    }

    fn run(
        &self,
        export_current: bool,
        import_path: Option<&Path>,
    ) -> std::result::Result<DeploymentReport, PartialFailure<DeploymentReport>> {
        let start = Instant::now();
        let mut report = DeploymentReport::new();
        info!("starting deployment (backend {})", self.backend_version);

        let outcome = self.run_steps(&mut report, export_current, import_path);

        report.completed_at = Some(Utc::now());
        report.duration_ms = start.elapsed().as_millis() as i64;

        match outcome {
            Ok(()) => {
                report.success = true;
                info!(
                    "deployment completed in {}ms: {} migration(s) applied, version {}",
                    report.duration_ms,
                    report.migrations_applied(),
                    report.final_version
                );
                Ok(report)
            }
            Err(e) => {
                error!("deployment failed: {e}");
                report.errors.push(e.to_string());
                Err(PartialFailure::new(report, e))
            }
        }
    }

    fn run_steps(
        &self,
        report: &mut DeploymentReport,
        export_current: bool,
        import_path: Option<&Path>,
    ) -> Result<()> {
        let runner = self.runner();

        report.fresh_install = self.db.table_names()?.is_empty();
        if report.fresh_install {
            report.warn("Fresh installation - no backup created".into());
        } else {
            let (version, number) = runner.current_version()?;
            let backup = self
                .backup
                .create_backup(&version, number)
                .map_err(|e| Error::Deploy(format!("Backup failed: {e}")))?;
            report.backup = Some(backup);
        }

        let (actual, _) = runner.current_version()?;
        let compat =
            VersionCompatibility::check(&actual, &self.required_version, &self.backend_version);
        info!("compatibility: {}", compat.reason);
        let proceed = compat.compatible || compat.is_migratable();
        let reason = compat.reason.clone();
        report.compatibility = Some(compat);
        if !proceed {
            return Err(Error::Deploy(format!("Compatibility check failed: {reason}")));
        }

        if export_current && !report.fresh_install {
            match self.exporter.export(&self.pre_deploy_dir) {
                Ok(summary) => report.pre_deploy_export = Some(summary),
                Err(e) => report.warn(format!("Current state export failed: {e}")),
            }
        }

        match runner.apply_all() {
            Ok(results) => report.migrations = results,
            Err(failure) => {
                let (results, e) = failure.into_parts();
                report.migrations = results;
                return Err(Error::Deploy(format!("Migration failed: {e}")));
            }
        }

        if let Some(path) = import_path {
            report.records_imported = self
                .exporter
                .import(path)
                .map_err(|e| Error::Deploy(format!("Master data import failed: {e}")))?;
        }

        self.validate(report)
            .map_err(|e| Error::Deploy(format!("Validation failed: {e}")))
    }

    fn validate(&self, report: &mut DeploymentReport) -> Result<()> {
        let (version, _) = self.runner().current_version()?;
        report.final_version = version.clone();
        if version != self.required_version {
            return Err(Error::Other(format!(
                "version mismatch after deployment: expected {}, got {version}",
                self.required_version
            )));
        }

        let validation = SchemaValidator::new(self.db)
            .with_registry(self.registry)
            .validate()?;
        report.warnings.extend(validation.warnings.iter().cloned());
        let errors = validation.errors.join("; ");
        let valid = validation.success;
        report.validation = Some(validation);
        if !valid {
            return Err(Error::Other(errors));
        }
        Ok(())
    }

    /// Export users, characters and master data into `dir` together with a
    /// gzip copy named after the backend version.
    pub fn prepare_deployment_package(&self, dir: &Path) -> Result<DeploymentPackage> {
        info!("preparing deployment package in {}", dir.display());
        let export = self.exporter.export(dir)?;

        let created_at = Utc::now();
        let compressed_path = dir.join(format!(
            "deployment_package_{}_{}.json.gz",
            self.backend_version,
            created_at.format("%Y%m%d-%H%M%S")
        ));
        let compressed_size_bytes = gzip_file(&export.path, &compressed_path)?;

        info!(
            "deployment package ready: {} ({} records, {compressed_size_bytes} bytes compressed)",
            compressed_path.display(),
            export.record_count
        );
        Ok(DeploymentPackage {
            export,
            compressed_path,
            compressed_size_bytes,
            backend_version: self.backend_version.clone(),
            required_db_version: self.required_version.clone(),
            created_at,
        })
    }
}
