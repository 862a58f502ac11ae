use std::path::{Path, PathBuf};
use std::thread;

use rollout_config::{BackupConfig, BackupMethod};
use rollout_db::migrations::BUILTIN_MIGRATIONS;
use rollout_db::{
    Category, CoreSchema, Database, Migration, MigrationRegistry, MigrationRunner,
    REQUIRED_DB_VERSION, SchemaBuilder,
};
use rollout_deploy::{
    BackupService, DeploymentOrchestrator, ExportService, Installer, JsonExportService, SqliteAccountStore,
    SqliteMasterDataImporter, read_export_file,
};
use tempfile::TempDir;

const GEAR_TABLE: Migration = Migration {
    number: 2,
    version: "0.5.0",
    description: "Add gear table",
    up: &["CREATE TABLE gear (id INTEGER PRIMARY KEY, name TEXT NOT NULL)"],
    down: &["DROP TABLE gear"],
    data_step: None,
    critical: true,
};

const GEAR_WEIGHT: Migration = Migration {
    number: 3,
    version: "0.6.0",
    description: "Add gear weight",
    up: &["ALTER TABLE gear ADD COLUMN weight REAL"],
    down: &["ALTER TABLE gear DROP COLUMN weight"],
    data_step: None,
    critical: true,
};

/// Builtin migrations followed by `extra`.
fn registry_with(extra: &[Migration]) -> MigrationRegistry {
    let mut migrations = BUILTIN_MIGRATIONS.to_vec();
    migrations.extend_from_slice(extra);
    MigrationRegistry::new(migrations).unwrap()
}

struct Workspace {
    dir: TempDir,
    db: Database,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("data").join("rollout.db")).unwrap();
        Self { dir, db }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn backup_config(&self) -> BackupConfig {
        BackupConfig {
            dir: self.path("backups"),
            method: BackupMethod::Structured,
            ..BackupConfig::default()
        }
    }

    fn master_data_dir(&self) -> PathBuf {
        let dir = self.path("masterdata");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(Category::Sources.file_name()),
            r#"[{"name": "KOD", "title": "Kodex"}]"#,
        )
        .unwrap();
        std::fs::write(
            dir.join(Category::Skills.file_name()),
            r#"[{"name": "Schwimmen", "difficulty": "leicht"}]"#,
        )
        .unwrap();
        dir
    }

    fn install(&self, registry: &MigrationRegistry) {
        let importer = SqliteMasterDataImporter::new(&self.db, "midgard");
        let accounts = SqliteAccountStore::new(&self.db);
        Installer::new(
            &self.db,
            registry,
            &CoreSchema,
            &importer,
            &accounts,
            self.master_data_dir(),
        )
        .with_admin("admin", "secret")
        .initialize()
        .unwrap();
    }

    fn current_version(&self, registry: &MigrationRegistry) -> (String, i64) {
        MigrationRunner::new(&self.db, registry)
            .current_version()
            .unwrap()
    }
}

fn backup_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

#[test]
fn deploy_on_empty_database_skips_backup() {
    let ws = Workspace::new();
    let registry = MigrationRegistry::builtin().unwrap();
    let exporter = JsonExportService::new(&ws.db, "midgard");
    let backup = BackupService::new(&ws.db, &exporter, &ws.backup_config());
    let orchestrator =
        DeploymentOrchestrator::new(&ws.db, &registry, backup, &exporter, ws.path("tmp"));

    let report = orchestrator.deploy().unwrap();
    assert!(report.success);
    assert!(report.fresh_install);
    assert!(report.backup.is_none());
    assert!(report.warnings.iter().any(|w| w.contains("Fresh installation")));
    assert_eq!(report.migrations_applied(), 1);
    assert_eq!(report.final_version, REQUIRED_DB_VERSION);
    assert_eq!(backup_count(&ws.path("backups")), 0);
}

#[test]
fn deploy_after_install_only_backs_up_and_validates() {
    let ws = Workspace::new();
    let registry = MigrationRegistry::builtin().unwrap();
    ws.install(&registry);

    let exporter = JsonExportService::new(&ws.db, "midgard");
    let backup = BackupService::new(&ws.db, &exporter, &ws.backup_config());
    let orchestrator =
        DeploymentOrchestrator::new(&ws.db, &registry, backup, &exporter, ws.path("tmp"));

    let report = orchestrator.deploy().unwrap();
    assert!(!report.fresh_install);
    assert!(report.migrations.is_empty());
    let backup = report.backup.unwrap();
    assert_eq!(backup.version, REQUIRED_DB_VERSION);
    assert_eq!(backup.migration_number, 1);
    assert!(backup.file_path.exists());
    assert!(report.compatibility.unwrap().compatible);
    assert!(report.validation.unwrap().success);
}

#[test]
fn update_deployment_applies_new_migrations() {
    let ws = Workspace::new();
    ws.install(&MigrationRegistry::builtin().unwrap());

    let registry = registry_with(&[GEAR_TABLE, GEAR_WEIGHT]);
    let exporter = JsonExportService::new(&ws.db, "midgard");
    let backup = BackupService::new(&ws.db, &exporter, &ws.backup_config());
    let orchestrator =
        DeploymentOrchestrator::new(&ws.db, &registry, backup, &exporter, ws.path("tmp"))
            .required_version("0.6.0");

    let report = orchestrator.deploy().unwrap();
    assert_eq!(report.migrations_applied(), 2);
    assert!(report.compatibility.unwrap().is_migratable());
    assert_eq!(report.final_version, "0.6.0");
    assert!(ws.db.table_exists("gear").unwrap());
    assert_eq!(ws.current_version(&registry), ("0.6.0".to_string(), 3));
}

#[test]
fn newer_database_stops_before_migrating() {
    let ws = Workspace::new();
    let newer = registry_with(&[GEAR_TABLE]);
    ws.install(&newer);

    let registry = MigrationRegistry::builtin().unwrap();
    let exporter = JsonExportService::new(&ws.db, "midgard");
    let backup = BackupService::new(&ws.db, &exporter, &ws.backup_config());
    let orchestrator =
        DeploymentOrchestrator::new(&ws.db, &registry, backup, &exporter, ws.path("tmp"));

    let failure = orchestrator.deploy().unwrap_err();
    assert!(failure.error.to_string().contains("Compatibility check failed"));
    let report = failure.partial;
    assert!(!report.success);
    assert!(report.backup.is_some());
    assert!(report.migrations.is_empty());
    assert_eq!(report.errors.len(), 1);
}

#[test]
fn unparsable_database_version_aborts_as_backend_too_old() {
    let ws = Workspace::new();
    let registry = MigrationRegistry::builtin().unwrap();
    ws.install(&registry);
    ws.db
        .connection()
        .unwrap()
        .execute(
            "INSERT INTO schema_version
                (version, migration_number, applied_at, backend_version, description)
             VALUES ('banana', 1, '2024-01-01T00:00:00+00:00', '0.0.1', 'hand edited')",
            [],
        )
        .unwrap();

    let exporter = JsonExportService::new(&ws.db, "midgard");
    let backup = BackupService::new(&ws.db, &exporter, &ws.backup_config());
    let orchestrator =
        DeploymentOrchestrator::new(&ws.db, &registry, backup, &exporter, ws.path("tmp"));

    let failure = orchestrator.deploy().unwrap_err();
    let message = failure.error.to_string();
    assert!(message.contains("Compatibility check failed"), "{message}");
    assert!(message.contains("Backend too old"), "{message}");
    assert!(failure.partial.migrations.is_empty());
}

#[test]
fn failed_migration_is_not_rolled_back_automatically() {
    let ws = Workspace::new();
    ws.install(&MigrationRegistry::builtin().unwrap());

    let broken = Migration {
        up: &["CREATE TABLE gear (id INTEGER PRIMARY KEY", "this is not sql"],
        ..GEAR_TABLE
    };
    let registry = registry_with(&[broken]);
    let exporter = JsonExportService::new(&ws.db, "midgard");
    let backup = BackupService::new(&ws.db, &exporter, &ws.backup_config());
    let orchestrator =
        DeploymentOrchestrator::new(&ws.db, &registry, backup, &exporter, ws.path("tmp"))
            .required_version("0.5.0");

    let failure = orchestrator.deploy().unwrap_err();
    assert!(failure.error.to_string().contains("Migration failed"));
    assert_eq!(failure.partial.migrations.len(), 1);
    assert!(!failure.partial.migrations[0].success);
    assert!(failure.partial.backup.is_some());
    assert_eq!(ws.current_version(&registry), (REQUIRED_DB_VERSION.to_string(), 1));
}

#[test]
fn rollback_then_reapply_restores_the_same_version() {
    let ws = Workspace::new();
    let registry = registry_with(&[GEAR_TABLE, GEAR_WEIGHT]);
    let runner = MigrationRunner::new(&ws.db, &registry);
    runner.apply_all().unwrap();
    let before = runner.current_version().unwrap();

    assert_eq!(runner.rollback(2).unwrap(), vec![3, 2]);
    assert_eq!(runner.current_version().unwrap().1, 1);

    let reapplied = runner.apply_all().unwrap();
    assert_eq!(reapplied.len(), 2);
    assert_eq!(runner.current_version().unwrap(), before);
}

#[test]
fn full_deployment_imports_legacy_export() {
    let ws = Workspace::new();
    let registry = MigrationRegistry::builtin().unwrap();
    ws.install(&registry);

    let legacy = ws.path("legacy_export.json");
    std::fs::write(
        &legacy,
        r#"{
            "backend_version": "0.1.0",
            "timestamp": "2023-01-01T00:00:00Z",
            "game_system": "midgard",
            "data": {
                "skills": [{"name": "Klettern", "difficulty": "normal"}],
                "spells": [{"name": "Heilen"}]
            }
        }"#,
    )
    .unwrap();

    let exporter = JsonExportService::new(&ws.db, "midgard");
    let backup = BackupService::new(&ws.db, &exporter, &ws.backup_config());
    let orchestrator =
        DeploymentOrchestrator::new(&ws.db, &registry, backup, &exporter, ws.path("tmp"));

    let report = orchestrator.full_deployment_with_import(Some(&legacy)).unwrap();
    assert_eq!(report.records_imported, 2);
    assert!(report.pre_deploy_export.unwrap().path.exists());

    let snapshot = exporter.snapshot().unwrap();
    let skills = &snapshot.data[&Category::Skills];
    assert!(
        skills
            .iter()
            .any(|s| s.name == "Klettern" && s.game_system.as_deref() == Some("midgard"))
    );
    assert_eq!(snapshot.data[&Category::Spells].len(), 1);
}

#[test]
fn failed_import_fails_the_deployment() {
    let ws = Workspace::new();
    let registry = MigrationRegistry::builtin().unwrap();
    ws.install(&registry);

    let exporter = JsonExportService::new(&ws.db, "midgard");
    let backup = BackupService::new(&ws.db, &exporter, &ws.backup_config());
    let orchestrator =
        DeploymentOrchestrator::new(&ws.db, &registry, backup, &exporter, ws.path("tmp"));

    let failure = orchestrator
        .full_deployment_with_import(Some(&ws.path("missing.json")))
        .unwrap_err();
    assert!(failure.error.to_string().contains("Master data import failed"));
}

#[test]
fn structured_backup_restores_accounts_and_characters() {
    let ws = Workspace::new();
    let registry = MigrationRegistry::builtin().unwrap();
    ws.install(&registry);
    ws.db
        .connection()
        .unwrap()
        .execute(
            "INSERT INTO characters (name, owner_id, game_system, data, created_at)
             SELECT 'Bjarnfinnur', id, 'midgard', '{}', '2024-01-01T00:00:00+00:00'
             FROM users WHERE username = 'admin'",
            [],
        )
        .unwrap();

    let exporter = JsonExportService::new(&ws.db, "midgard");
    let backup = BackupService::new(&ws.db, &exporter, &ws.backup_config());
    let (version, number) = ws.current_version(&registry);
    let meta = backup.create_backup(&version, number).unwrap();

    let contents = read_export_file(&meta.file_path).unwrap();
    assert!(contents.users.iter().any(|u| u.username == "admin"));
    assert!(contents.characters.iter().any(|c| c.name == "Bjarnfinnur"));

    let restored = Database::open(&ws.path("restored.db")).unwrap();
    CoreSchema
        .create_schema(&restored.connection().unwrap())
        .unwrap();
    let imported = JsonExportService::new(&restored, "midgard")
        .import(&meta.file_path)
        .unwrap();
    assert_eq!(imported, contents.record_count());

    let owner: String = restored
        .connection()
        .unwrap()
        .query_row(
            "SELECT u.username FROM characters c JOIN users u ON u.id = c.owner_id
             WHERE c.name = 'Bjarnfinnur'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(owner, "admin");
}

#[test]
fn deployment_package_has_a_readable_gzip_copy() {
    let ws = Workspace::new();
    let registry = MigrationRegistry::builtin().unwrap();
    ws.install(&registry);

    let exporter = JsonExportService::new(&ws.db, "midgard");
    let backup = BackupService::new(&ws.db, &exporter, &ws.backup_config());
    let orchestrator =
        DeploymentOrchestrator::new(&ws.db, &registry, backup, &exporter, ws.path("tmp"));

    let package = orchestrator
        .prepare_deployment_package(&ws.path("package"))
        .unwrap();
    // Two master-data records plus the admin account
    assert_eq!(package.export.record_count, 3);
    let name = package
        .compressed_path
        .file_name()
        .unwrap()
        .to_string_lossy()
        .into_owned();
    assert!(name.starts_with("deployment_package_") && name.ends_with(".json.gz"));

    let unpacked = read_export_file(&package.compressed_path).unwrap();
    assert_eq!(unpacked.record_count(), package.export.record_count);
}

#[test]
fn concurrent_runners_apply_each_migration_once() {
    let ws = Workspace::new();
    let db_path = ws.path("data").join("rollout.db");

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let path = db_path.clone();
            thread::spawn(move || {
                let db = Database::open(&path).unwrap();
                let registry = registry_with(&[GEAR_TABLE, GEAR_WEIGHT]);
                MigrationRunner::new(&db, &registry)
                    .apply_all()
                    .map(|results| results.len())
            })
        })
        .collect();

    let applied: usize = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .sum();
    assert_eq!(applied, 3);

    let registry = registry_with(&[GEAR_TABLE, GEAR_WEIGHT]);
    assert_eq!(ws.current_version(&registry), ("0.6.0".to_string(), 3));
    let history: i64 = ws
        .db
        .connection()
        .unwrap()
        .query_row("SELECT COUNT(*) FROM migration_history", [], |row| row.get(0))
        .unwrap();
    assert_eq!(history, 3);
}
