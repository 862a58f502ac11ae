//! The `schema_version` and `migration_history` tracking tables.
//!
//! `schema_version` is an append-only ledger: the row with the highest `id`
//! is the database's current version. `migration_history` holds one audit row
//! per applied migration; rolling a migration back deletes its row.

use chrono::{DateTime, Utc};
use rollout_common::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use tracing::debug;

use crate::database::table_exists;

pub const SCHEMA_VERSION_TABLE: &str = "schema_version";
pub const MIGRATION_HISTORY_TABLE: &str = "migration_history";

/// Every column read back from each tracking table, in select order.
pub const SCHEMA_VERSION_COLUMNS: &[&str] = &[
    "id",
    "version",
    "migration_number",
    "applied_at",
    "backend_version",
    "description",
    "checksum",
];
pub const MIGRATION_HISTORY_COLUMNS: &[&str] = &[
    "id",
    "migration_number",
    "version",
    "description",
    "applied_at",
    "applied_by",
    "execution_time_ms",
    "success",
    "error_message",
    "rollback_available",
];

#[derive(Debug, Clone, Serialize)]
pub struct SchemaVersionRecord {
    pub id: i64,
    pub version: String,
    pub migration_number: i64,
    pub applied_at: DateTime<Utc>,
    pub backend_version: String,
    pub description: String,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationHistoryRecord {
    pub id: i64,
    pub migration_number: i64,
    pub version: String,
    pub description: String,
    pub applied_at: DateTime<Utc>,
    pub applied_by: String,
    pub execution_time_ms: i64,
    pub success: bool,
    pub error_message: Option<String>,
    pub rollback_available: bool,
}

/// A `schema_version` row about to be written.
#[derive(Debug, Clone)]
pub struct NewSchemaVersion<'a> {
    pub version: &'a str,
    pub migration_number: i64,
    pub backend_version: &'a str,
    pub description: &'a str,
    pub checksum: Option<&'a str>,
}

/// A `migration_history` row about to be written.
#[derive(Debug, Clone)]
pub struct NewHistoryEntry<'a> {
    pub migration_number: i64,
    pub version: &'a str,
    pub description: &'a str,
    pub applied_by: &'a str,
    pub execution_time_ms: i64,
    pub rollback_available: bool,
}

/// Create both tracking tables if missing. Also used as the data step of the
/// first built-in migration.
pub fn create_tables(conn: &Connection) -> Result<()> {
    debug!("creating schema_version and migration_history tables");
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            version TEXT NOT NULL,
            migration_number INTEGER NOT NULL,
            applied_at TEXT NOT NULL,
            backend_version TEXT NOT NULL,
            description TEXT,
            checksum TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_schema_version_version
            ON schema_version(version);
        CREATE INDEX IF NOT EXISTS idx_schema_version_migration_number
            ON schema_version(migration_number);

        CREATE TABLE IF NOT EXISTS migration_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            migration_number INTEGER NOT NULL UNIQUE,
            version TEXT NOT NULL,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL,
            applied_by TEXT,
            execution_time_ms INTEGER NOT NULL DEFAULT 0,
            success INTEGER NOT NULL DEFAULT 1,
            error_message TEXT,
            rollback_available INTEGER NOT NULL DEFAULT 1
        );

        CREATE INDEX IF NOT EXISTS idx_migration_history_version
            ON migration_history(version);",
    )
    .map_err(|e| Error::Database(format!("failed to create tracking tables: {e}")))?;
    Ok(())
}

/// Version and migration number of the newest `schema_version` row. `None`
/// when the table is missing or empty.
pub fn current_version(conn: &Connection) -> Result<Option<(String, i64)>> {
    if !table_exists(conn, SCHEMA_VERSION_TABLE)? {
        return Ok(None);
    }

    conn.query_row(
        "SELECT version, migration_number FROM schema_version ORDER BY id DESC LIMIT 1",
        [],
        |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
    )
    .optional()
    .map_err(|e| Error::Database(format!("failed to read current version: {e}")))
}

pub fn insert_schema_version(conn: &Connection, entry: &NewSchemaVersion<'_>) -> Result<i64> {
    conn.execute(
        "INSERT INTO schema_version
            (version, migration_number, applied_at, backend_version, description, checksum)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.version,
            entry.migration_number,
            Utc::now().to_rfc3339(),
            entry.backend_version,
            entry.description,
            entry.checksum,
        ],
    )
    .map_err(|e| Error::Database(format!("failed to update version: {e}")))?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_history(conn: &Connection, entry: &NewHistoryEntry<'_>) -> Result<i64> {
    conn.execute(
        "INSERT INTO migration_history
            (migration_number, version, description, applied_at, applied_by,
             execution_time_ms, success, rollback_available)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
        params![
            entry.migration_number,
            entry.version,
            entry.description,
            Utc::now().to_rfc3339(),
            entry.applied_by,
            entry.execution_time_ms,
            entry.rollback_available,
        ],
    )
    .map_err(|e| Error::Database(format!("failed to record migration: {e}")))?;
    Ok(conn.last_insert_rowid())
}

pub fn delete_history(conn: &Connection, migration_number: i64) -> Result<usize> {
    conn.execute(
        "DELETE FROM migration_history WHERE migration_number = ?1",
        params![migration_number],
    )
    .map_err(|e| Error::Database(format!("failed to remove from history: {e}")))
}

pub fn delete_schema_versions(conn: &Connection, migration_number: i64) -> Result<usize> {
    conn.execute(
        "DELETE FROM schema_version WHERE migration_number = ?1",
        params![migration_number],
    )
    .map_err(|e| Error::Database(format!("failed to update version: {e}")))
}

/// All `schema_version` rows, oldest first. Empty when the table is missing.
pub fn schema_versions(conn: &Connection) -> Result<Vec<SchemaVersionRecord>> {
    if !table_exists(conn, SCHEMA_VERSION_TABLE)? {
        return Ok(Vec::new());
    }

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM schema_version ORDER BY id ASC",
            SCHEMA_VERSION_COLUMNS.join(", ")
        ))
        .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

    let rows = stmt
        .query_map([], |row| {
            Ok(SchemaVersionRecord {
                id: row.get(0)?,
                version: row.get(1)?,
                migration_number: row.get(2)?,
                applied_at: parse_datetime(row.get::<_, String>(3)?),
                backend_version: row.get(4)?,
                description: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                checksum: row.get(6)?,
            })
        })
        .map_err(|e| Error::Database(format!("failed to query schema versions: {e}")))?;

    collect_rows(rows)
}

/// All `migration_history` rows by ascending migration number. Empty when
/// the table is missing.
pub fn history(conn: &Connection) -> Result<Vec<MigrationHistoryRecord>> {
    if !table_exists(conn, MIGRATION_HISTORY_TABLE)? {
        return Ok(Vec::new());
    }

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM migration_history ORDER BY migration_number ASC",
            MIGRATION_HISTORY_COLUMNS.join(", ")
        ))
        .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

    let rows = stmt
        .query_map([], history_from_row)
        .map_err(|e| Error::Database(format!("failed to query migration history: {e}")))?;

    collect_rows(rows)
}

/// The newest `limit` successful history rows, highest migration number first.
pub fn latest_successful(conn: &Connection, limit: usize) -> Result<Vec<MigrationHistoryRecord>> {
    if !table_exists(conn, MIGRATION_HISTORY_TABLE)? {
        return Ok(Vec::new());
    }

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM migration_history
             WHERE success = 1
             ORDER BY migration_number DESC
             LIMIT ?1",
            MIGRATION_HISTORY_COLUMNS.join(", ")
        ))
        .map_err(|e| Error::Database(format!("failed to get migration history: {e}")))?;

    let rows = stmt
        .query_map(params![limit as i64], history_from_row)
        .map_err(|e| Error::Database(format!("failed to get migration history: {e}")))?;

    collect_rows(rows)
}

fn history_from_row(row: &Row<'_>) -> rusqlite::Result<MigrationHistoryRecord> {
    Ok(MigrationHistoryRecord {
        id: row.get(0)?,
        migration_number: row.get(1)?,
        version: row.get(2)?,
        description: row.get(3)?,
        applied_at: parse_datetime(row.get::<_, String>(4)?),
        applied_by: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        execution_time_ms: row.get(6)?,
        success: row.get(7)?,
        error_message: row.get(8)?,
        rollback_available: row.get(9)?,
    })
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| Error::Database(format!("failed to read ledger row: {e}")))?);
    }
    Ok(out)
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            // Rows written by hand or by SQLite's datetime('now')
            chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
                .unwrap_or_else(|_| Utc::now())
        })
}
