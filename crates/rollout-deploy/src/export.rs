//! Structured export files and the service that reads and writes them.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use rollout_common::{BACKEND_VERSION, Error, Result};
use rollout_db::{Category, Database};
use rusqlite::TransactionBehavior;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::entities::{self, CharacterRecord, UserRecord};
use crate::masterdata;
use crate::transformers::TransformerRegistry;

/// Payload version written by this build.
pub const CURRENT_EXPORT_VERSION: &str = "1.1";

/// Version assumed for payloads that do not declare one.
pub const LEGACY_EXPORT_VERSION: &str = "1.0";

/// One master-data row. Category specific attributes live in `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_system: Option<String>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl MasterRecord {
    pub fn new(name: impl Into<String>, game_system: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            game_system: Some(game_system.into()),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

fn legacy_export_version() -> String {
    LEGACY_EXPORT_VERSION.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportData {
    #[serde(default = "legacy_export_version")]
    pub export_version: String,
    #[serde(default)]
    pub backend_version: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub game_system: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<UserRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub characters: Vec<CharacterRecord>,
    #[serde(default)]
    pub data: BTreeMap<Category, Vec<MasterRecord>>,
}

impl ExportData {
    pub fn new(game_system: impl Into<String>) -> Self {
        Self {
            export_version: CURRENT_EXPORT_VERSION.to_string(),
            backend_version: BACKEND_VERSION.to_string(),
            timestamp: Utc::now(),
            game_system: game_system.into(),
            users: Vec::new(),
            characters: Vec::new(),
            data: BTreeMap::new(),
        }
    }

    /// Users, characters and master-data records together.
    pub fn record_count(&self) -> usize {
        self.users.len() + self.characters.len() + self.data.values().map(Vec::len).sum::<usize>()
    }
}

/// Read an export file, transparently decompressing `.gz` files.
pub fn read_export_file(path: &Path) -> Result<ExportData> {
    let file = File::open(path)
        .map_err(|e| Error::Export(format!("failed to open {}: {e}", path.display())))?;

    let reader: Box<dyn Read> = if is_gzip(path) {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    let mut data: ExportData = serde_json::from_reader(reader)
        .map_err(|e| Error::Export(format!("failed to parse {}: {e}", path.display())))?;
    if data.export_version.trim().is_empty() {
        data.export_version = legacy_export_version();
    }
    Ok(data)
}

pub fn write_export_file(path: &Path, data: &ExportData) -> Result<()> {
    let file = File::create(path)
        .map_err(|e| Error::Export(format!("failed to create {}: {e}", path.display())))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, data)?;
    writer.flush()?;
    Ok(())
}

/// Write a gzip-compressed copy of `src` to `dst`, returning its size.
pub fn gzip_file(src: &Path, dst: &Path) -> Result<u64> {
    let mut input = BufReader::new(File::open(src)?);
    let output = File::create(dst)
        .map_err(|e| Error::Export(format!("failed to create {}: {e}", dst.display())))?;
    let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());
    std::io::copy(&mut input, &mut encoder)?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    Ok(std::fs::metadata(dst)?.len())
}

fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub record_count: usize,
}

/// Whole-database export and import.
pub trait ExportService: Send + Sync {
    /// Write an export file into `dir`.
    fn export(&self, dir: &Path) -> Result<ExportSummary>;

    /// Load an export file, returning the number of records written.
    fn import(&self, path: &Path) -> Result<usize>;
}

/// Exports users, characters and every master-data table to a JSON payload
/// and imports such payloads (of any supported version) back.
pub struct JsonExportService<'a> {
    db: &'a Database,
    game_system: String,
    transformers: TransformerRegistry,
}

impl<'a> JsonExportService<'a> {
    pub fn new(db: &'a Database, game_system: impl Into<String>) -> Self {
        Self {
            db,
            game_system: game_system.into(),
            transformers: TransformerRegistry::builtin(),
        }
    }

    pub fn with_transformers(mut self, transformers: TransformerRegistry) -> Self {
        self.transformers = transformers;
        self
    }

    /// Snapshot users, characters and the master-data tables. Tables that
    /// do not exist yet are left out.
    pub fn snapshot(&self) -> Result<ExportData> {
        let conn = self.db.connection()?;
        let mut data = ExportData::new(&self.game_system);
        data.users = entities::read_users(&conn)?.unwrap_or_default();
        data.characters = entities::read_characters(&conn)?.unwrap_or_default();
        for category in Category::ALL {
            if let Some(records) = masterdata::read_records(&conn, category)? {
                data.data.insert(category, records);
            }
        }
        Ok(data)
    }
}

impl ExportService for JsonExportService<'_> {
    fn export(&self, dir: &Path) -> Result<ExportSummary> {
        std::fs::create_dir_all(dir).map_err(|e| {
            Error::Export(format!("failed to create export directory {}: {e}", dir.display()))
        })?;

        let data = self.snapshot()?;
        let file_name = format!("export_{}.json", data.timestamp.format("%Y%m%d_%H%M%S"));
        let path = dir.join(file_name);
        write_export_file(&path, &data)?;

        let record_count = data.record_count();
        info!("exported {record_count} record(s) to {}", path.display());
        Ok(ExportSummary { path, record_count })
    }

    fn import(&self, path: &Path) -> Result<usize> {
        let data = read_export_file(path)?;
        debug!(
            "importing export version {} from {}",
            data.export_version,
            path.display()
        );
        let data = self.transformers.transform_to_current(data)?;

        let default_game_system = if data.game_system.is_empty() {
            self.game_system.as_str()
        } else {
            data.game_system.as_str()
        };

        let mut conn = self.db.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;

        let mut imported = entities::upsert_users(&tx, &data.users)?;
        imported += entities::upsert_characters(&tx, &data.characters)?;
        for (category, records) in &data.data {
            imported += masterdata::upsert_records(&tx, *category, records, default_game_system)?;
        }

        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit import: {e}")))?;
        info!("imported {imported} record(s) from {}", path.display());
        Ok(imported)
    }
}
