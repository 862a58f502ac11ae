//! Reference data import in dependency order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rollout_common::{Error, Result};
use rollout_db::database::table_exists;
use rollout_db::{Category, Database};
use rusqlite::{Connection, TransactionBehavior, params};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::export::MasterRecord;

/// Imports one master-data category from a directory.
pub trait MasterDataImporter: Send + Sync {
    /// Returns the number of records imported.
    fn import_category(&self, category: Category, dir: &Path) -> Result<usize>;
}

/// Reads `<category>.json` arrays of records and upserts them into the
/// category's table, keyed by name and game system.
pub struct SqliteMasterDataImporter<'a> {
    db: &'a Database,
    game_system: String,
}

impl<'a> SqliteMasterDataImporter<'a> {
    pub fn new(db: &'a Database, game_system: impl Into<String>) -> Self {
        Self {
            db,
            game_system: game_system.into(),
        }
    }
}

impl MasterDataImporter for SqliteMasterDataImporter<'_> {
    fn import_category(&self, category: Category, dir: &Path) -> Result<usize> {
        if !dir.is_dir() {
            return Err(Error::MasterData(format!(
                "master data directory {} does not exist",
                dir.display()
            )));
        }

        let path = dir.join(category.file_name());
        if !path.is_file() {
            warn!("no {} in {}, skipping", category.file_name(), dir.display());
            return Ok(0);
        }

        let raw = std::fs::read_to_string(&path)?;
        let records: Vec<MasterRecord> = serde_json::from_str(&raw)
            .map_err(|e| Error::MasterData(format!("invalid {}: {e}", path.display())))?;

        let mut conn = self.db.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;
        let count = upsert_records(&tx, category, &records, &self.game_system)?;
        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit {category}: {e}")))?;
        Ok(count)
    }
}

/// Insert or update records by `(name, game_system)`. Records without a game
/// system get `default_game_system`.
pub fn upsert_records(
    conn: &Connection,
    category: Category,
    records: &[MasterRecord],
    default_game_system: &str,
) -> Result<usize> {
    let table = category.table();
    let sql = format!(
        "INSERT INTO {table} (name, game_system, fields, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(name, game_system) DO UPDATE SET
             fields = excluded.fields,
             updated_at = excluded.updated_at"
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| Error::Database(format!("failed to prepare upsert into {table}: {e}")))?;

    let now = Utc::now().to_rfc3339();
    for record in records {
        if record.name.trim().is_empty() {
            return Err(Error::MasterData(format!("{category} record without a name")));
        }
        let game_system = record
            .game_system
            .as_deref()
            .unwrap_or(default_game_system);
        let fields = serde_json::to_string(&record.fields)?;
        stmt.execute(params![record.name, game_system, fields, now])
            .map_err(|e| {
                Error::Database(format!("failed to upsert {} into {table}: {e}", record.name))
            })?;
    }

    debug!("upserted {} record(s) into {table}", records.len());
    Ok(records.len())
}

/// All records of `category`, `None` when its table does not exist.
pub fn read_records(conn: &Connection, category: Category) -> Result<Option<Vec<MasterRecord>>> {
    let table = category.table();
    if !table_exists(conn, &table)? {
        return Ok(None);
    }

    let mut stmt = conn
        .prepare(&format!(
            "SELECT name, game_system, fields FROM {table} ORDER BY name, game_system"
        ))
        .map_err(|e| Error::Database(format!("failed to read {table}: {e}")))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })
        .map_err(|e| Error::Database(format!("failed to read {table}: {e}")))?;

    let mut records = Vec::new();
    for row in rows {
        let (name, game_system, fields) =
            row.map_err(|e| Error::Database(format!("failed to read {table} row: {e}")))?;
        let fields: BTreeMap<String, Value> = serde_json::from_str(&fields)?;
        records.push(MasterRecord {
            name,
            game_system: Some(game_system),
            fields,
        });
    }
    Ok(Some(records))
}

/// Runs every category import in dependency order, stopping at the first
/// failure.
pub struct MasterDataSync<'a> {
    importer: &'a dyn MasterDataImporter,
    dir: PathBuf,
    dry_run: bool,
    verbose: bool,
}

impl<'a> MasterDataSync<'a> {
    pub fn new(importer: &'a dyn MasterDataImporter, dir: impl Into<PathBuf>) -> Self {
        Self {
            importer,
            dir: dir.into(),
            dry_run: false,
            verbose: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Returns the total number of imported records.
    pub fn sync_all(&self) -> Result<usize> {
        info!("starting master data sync from {}", self.dir.display());

        if self.dry_run {
            for category in Category::ALL {
                info!("[dry run] would import {}", category.label());
            }
            return Ok(0);
        }

        let mut total = 0;
        for category in Category::ALL {
            if self.verbose {
                info!("importing {}", category.label());
            }
            let count = self
                .importer
                .import_category(category, &self.dir)
                .map_err(|e| {
                    Error::MasterData(format!("failed to import {}: {e}", category.label()))
                })?;
            debug!("imported {count} {}", category.label());
            total += count;
        }

        info!("master data sync completed: {total} record(s)");
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollout_db::{CoreSchema, SchemaBuilder};
    use std::sync::Mutex;

    /// Records the categories it was asked for, failing on one of them.
    struct Recording {
        calls: Mutex<Vec<Category>>,
        fail_on: Option<Category>,
    }

    impl Recording {
        fn new(fail_on: Option<Category>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_on,
            }
        }
    }

    impl MasterDataImporter for Recording {
        fn import_category(&self, category: Category, _dir: &Path) -> Result<usize> {
            self.calls.lock().unwrap().push(category);
            if self.fail_on == Some(category) {
                return Err(Error::Other("bad file".into()));
            }
            Ok(1)
        }
    }

    #[test]
    fn imports_in_dependency_order() {
        let importer = Recording::new(None);
        let total = MasterDataSync::new(&importer, "unused").sync_all().unwrap();
        assert_eq!(total, 10);
        assert_eq!(*importer.calls.lock().unwrap(), Category::ALL.to_vec());
    }

    #[test]
    fn first_failure_aborts_remaining_steps() {
        let importer = Recording::new(Some(Category::SpellSchools));
        let err = MasterDataSync::new(&importer, "unused").sync_all().unwrap_err();
        assert!(err.to_string().contains("failed to import Spell Schools"));
        assert_eq!(importer.calls.lock().unwrap().len(), 5);
    }

    #[test]
    fn dry_run_imports_nothing() {
        let importer = Recording::new(Some(Category::Sources));
        let total = MasterDataSync::new(&importer, "/nonexistent/masterdata")
            .dry_run(true)
            .sync_all()
            .unwrap();
        assert_eq!(total, 0);
        assert!(importer.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn missing_directory_fails_without_dry_run() {
        let db = Database::in_memory().unwrap();
        let importer = SqliteMasterDataImporter::new(&db, "midgard");
        let err = MasterDataSync::new(&importer, "/nonexistent/masterdata")
            .sync_all()
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn sqlite_importer_upserts_by_name_and_game_system() {
        let db = Database::in_memory().unwrap();
        CoreSchema.create_schema(&db.connection().unwrap()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("skills.json"),
            r#"[{"name": "Klettern", "difficulty": "normal"},
                {"name": "Klettern", "game_system": "other"}]"#,
        )
        .unwrap();

        let importer = SqliteMasterDataImporter::new(&db, "midgard");
        assert_eq!(importer.import_category(Category::Skills, dir.path()).unwrap(), 2);

        std::fs::write(
            dir.path().join("skills.json"),
            r#"[{"name": "Klettern", "difficulty": "schwer"}]"#,
        )
        .unwrap();
        importer.import_category(Category::Skills, dir.path()).unwrap();

        let records = read_records(&db.connection().unwrap(), Category::Skills)
            .unwrap()
            .unwrap();
        assert_eq!(records.len(), 2);
        let midgard = records
            .iter()
            .find(|r| r.game_system.as_deref() == Some("midgard"))
            .unwrap();
        assert_eq!(midgard.fields["difficulty"], "schwer");
    }

    #[test]
    fn missing_category_file_is_skipped() {
        let db = Database::in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let importer = SqliteMasterDataImporter::new(&db, "midgard");
        assert_eq!(importer.import_category(Category::Spells, dir.path()).unwrap(), 0);
    }

    #[test]
    fn record_without_name_is_rejected() {
        let db = Database::in_memory().unwrap();
        CoreSchema.create_schema(&db.connection().unwrap()).unwrap();
        let err = upsert_records(
            &db.connection().unwrap(),
            Category::Sources,
            &[MasterRecord::new(" ", "midgard")],
            "midgard",
        )
        .unwrap_err();
        assert!(err.to_string().contains("without a name"));
    }
}
