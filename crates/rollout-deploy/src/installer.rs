//! Bootstrap of a brand-new database.
//!
//! A fresh install does not replay migrations. It creates the full schema,
//! creates the tracking tables with the first migration's step and then
//! records every known migration as already applied, so the database starts
//! at the newest version.

use std::path::PathBuf;
use std::time::Instant;

use rollout_common::{BACKEND_VERSION, Error, PartialFailure, Result};
use rollout_db::ledger::{self, NewHistoryEntry, NewSchemaVersion};
use rollout_db::{Database, MigrationRegistry, SchemaBuilder};
use rusqlite::TransactionBehavior;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::accounts::AccountStore;
use crate::masterdata::{MasterDataImporter, MasterDataSync};

const APPLIED_BY: &str = "installer";

#[derive(Debug, Clone, Default, Serialize)]
pub struct InstallationResult {
    pub success: bool,
    pub schema_created: bool,
    pub tables_created: Vec<String>,
    pub version_initialized: bool,
    pub version: String,
    pub migration_number: i64,
    pub master_data_imported: bool,
    pub master_data_records: usize,
    pub admin_created: bool,
    pub execution_time_ms: i64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

struct AdminCredentials {
    username: String,
    password: String,
}

pub struct Installer<'a> {
    db: &'a Database,
    registry: &'a MigrationRegistry,
    schema: &'a dyn SchemaBuilder,
    importer: &'a dyn MasterDataImporter,
    accounts: &'a dyn AccountStore,
    master_data_dir: PathBuf,
    admin: Option<AdminCredentials>,
    backend_version: String,
}

impl<'a> Installer<'a> {
    pub fn new(
        db: &'a Database,
        registry: &'a MigrationRegistry,
        schema: &'a dyn SchemaBuilder,
        importer: &'a dyn MasterDataImporter,
        accounts: &'a dyn AccountStore,
        master_data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            db,
            registry,
            schema,
            importer,
            accounts,
            master_data_dir: master_data_dir.into(),
            admin: None,
            backend_version: BACKEND_VERSION.to_string(),
        }
    }

    /// Also create an administrator account.
    pub fn with_admin(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.admin = Some(AdminCredentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Run every installation stage in order. A failing stage stops the
    /// install and the stages completed so far come back with the error.
    pub fn initialize(
        &self,
    ) -> std::result::Result<InstallationResult, PartialFailure<InstallationResult>> {
        let start = Instant::now();
        let mut result = InstallationResult::default();
        info!("starting fresh installation");

        let outcome = self.run_stages(&mut result);
        result.execution_time_ms = start.elapsed().as_millis() as i64;

        match outcome {
            Ok(()) => {
                result.success = true;
                info!(
                    "installation completed in {}ms at version {} (migration {})",
                    result.execution_time_ms, result.version, result.migration_number
                );
                Ok(result)
            }
            Err(e) => {
                error!("installation failed: {e}");
                result.errors.push(e.to_string());
                Err(PartialFailure::new(result, e))
            }
        }
    }

    fn run_stages(&self, result: &mut InstallationResult) -> Result<()> {
        result.tables_created = self.create_schema()?;
        result.schema_created = true;

        let (version, number) = self.initialize_version_tracking()?;
        result.version = version;
        result.migration_number = number;
        result.version_initialized = true;

        result.master_data_records = MasterDataSync::new(self.importer, &self.master_data_dir)
            .sync_all()
            .map_err(|e| Error::Install(format!("master data import failed: {e}")))?;
        result.master_data_imported = true;

        if let Some(admin) = &self.admin {
            result.admin_created = self.create_admin_user(&admin.username, &admin.password)?;
            if !result.admin_created {
                result
                    .warnings
                    .push(format!("admin user {} already exists", admin.username));
            }
        }

        Ok(())
    }

    pub fn create_schema(&self) -> Result<Vec<String>> {
        info!("creating database schema");
        let conn = self.db.connection()?;
        self.schema
            .create_schema(&conn)
            .map_err(|e| Error::Install(format!("schema creation failed: {e}")))
    }

    /// Create the tracking tables and mark every migration as applied.
    /// Returns the version and number the database now reports.
    pub fn initialize_version_tracking(&self) -> Result<(String, i64)> {
        let (Some(first), Some(latest)) = (self.registry.first(), self.registry.latest()) else {
            return Err(Error::Install("migration registry is empty".into()));
        };

        let mut conn = self.db.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;

        match first.data_step {
            Some(step) => step(&tx)?,
            None => {
                for sql in first.up {
                    tx.execute_batch(sql).map_err(|e| {
                        Error::Install(format!("failed to create version tables: {sql} - error: {e}"))
                    })?;
                }
            }
        }

        let checksum = latest.checksum();
        ledger::insert_schema_version(
            &tx,
            &NewSchemaVersion {
                version: latest.version,
                migration_number: latest.number,
                backend_version: &self.backend_version,
                description: "Initial installation",
                checksum: Some(&checksum),
            },
        )?;

        for migration in self.registry.all() {
            ledger::insert_history(
                &tx,
                &NewHistoryEntry {
                    migration_number: migration.number,
                    version: migration.version,
                    description: migration.description,
                    applied_by: APPLIED_BY,
                    execution_time_ms: 0,
                    rollback_available: migration.rollback_available(),
                },
            )?;
        }

        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit version tracking: {e}")))?;

        info!(
            "version tracking initialized at {} (migration {}), {} migration(s) marked applied",
            latest.version,
            latest.number,
            self.registry.len()
        );
        Ok((latest.version.to_string(), latest.number))
    }

    /// Returns `false` when the user already existed and nothing was created.
    pub fn create_admin_user(&self, username: &str, password: &str) -> Result<bool> {
        if username.is_empty() || password.is_empty() {
            return Err(Error::Install(
                "admin username and password are required".into(),
            ));
        }

        if self.accounts.user_exists(username)? {
            warn!("admin user {username} already exists, skipping");
            return Ok(false);
        }

        self.accounts.create_admin(username, password)?;
        info!("admin user {username} created");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::SqliteAccountStore;
    use crate::masterdata::SqliteMasterDataImporter;
    use rollout_db::{Category, CoreSchema, MigrationRunner};

    struct Fixture {
        db: Database,
        registry: MigrationRegistry,
        dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(Category::Sources.file_name()),
            r#"[{"name": "KOD", "title": "Kodex"}]"#,
        )
        .unwrap();
        Fixture {
            db: Database::in_memory().unwrap(),
            registry: MigrationRegistry::builtin().unwrap(),
            dir,
        }
    }

    #[test]
    fn fresh_install_marks_every_migration_applied() {
        let f = fixture();
        let importer = SqliteMasterDataImporter::new(&f.db, "midgard");
        let accounts = SqliteAccountStore::new(&f.db);
        let installer = Installer::new(
            &f.db,
            &f.registry,
            &CoreSchema,
            &importer,
            &accounts,
            f.dir.path(),
        );

        let result = installer.initialize().unwrap();
        assert!(result.success);
        assert!(result.schema_created && result.version_initialized);
        assert_eq!(result.master_data_records, 1);
        assert!(!result.admin_created);

        let conn = f.db.connection().unwrap();
        let versions = ledger::schema_versions(&conn).unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].description, "Initial installation");
        assert!(versions[0].migration_number > 0);
        let history = ledger::history(&conn).unwrap();
        assert_eq!(history.len(), f.registry.len());
        assert!(history.iter().all(|h| h.applied_by == "installer"));
        drop(conn);

        let runner = MigrationRunner::new(&f.db, &f.registry);
        assert!(runner.pending_migrations().unwrap().is_empty());
    }

    #[test]
    fn creates_admin_once() {
        let f = fixture();
        let importer = SqliteMasterDataImporter::new(&f.db, "midgard");
        let accounts = SqliteAccountStore::new(&f.db);
        let installer = Installer::new(
            &f.db,
            &f.registry,
            &CoreSchema,
            &importer,
            &accounts,
            f.dir.path(),
        )
        .with_admin("admin", "secret");

        let result = installer.initialize().unwrap();
        assert!(result.admin_created);
        assert!(!installer.create_admin_user("admin", "other").unwrap());
    }

    #[test]
    fn admin_requires_username_and_password() {
        let f = fixture();
        let importer = SqliteMasterDataImporter::new(&f.db, "midgard");
        let accounts = SqliteAccountStore::new(&f.db);
        let installer = Installer::new(
            &f.db,
            &f.registry,
            &CoreSchema,
            &importer,
            &accounts,
            f.dir.path(),
        )
        .with_admin("admin", "");

        let failure = installer.initialize().unwrap_err();
        assert!(failure.error.to_string().contains("required"));
        // Everything before the admin stage completed
        assert!(failure.partial.master_data_imported);
        assert!(!failure.partial.success);
        assert_eq!(failure.partial.errors.len(), 1);
    }

    #[test]
    fn missing_master_data_aborts_install() {
        let f = fixture();
        let importer = SqliteMasterDataImporter::new(&f.db, "midgard");
        let accounts = SqliteAccountStore::new(&f.db);
        let installer = Installer::new(
            &f.db,
            &f.registry,
            &CoreSchema,
            &importer,
            &accounts,
            f.dir.path().join("absent"),
        );

        let failure = installer.initialize().unwrap_err();
        assert!(failure.error.to_string().contains("master data import failed"));
        assert!(failure.partial.version_initialized);
        assert!(!failure.partial.master_data_imported);
    }

    #[test]
    fn empty_registry_cannot_initialize_tracking() {
        let f = fixture();
        let registry = MigrationRegistry::new(Vec::new()).unwrap();
        let importer = SqliteMasterDataImporter::new(&f.db, "midgard");
        let accounts = SqliteAccountStore::new(&f.db);
        let installer =
            Installer::new(&f.db, &registry, &CoreSchema, &importer, &accounts, f.dir.path());

        let err = installer.initialize_version_tracking().unwrap_err();
        assert!(err.to_string().contains("registry is empty"));
    }
}
