use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rollout_common::{Error, Result};
use rusqlite::{Connection, params};
use tracing::info;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handle to the relational store being migrated.
///
/// All access goes through one connection guarded by a mutex; callers that
/// need a unit of work open a transaction on the guard.
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Database {
    pub fn open(db_path: &Path) -> Result<Self> {
        Self::open_with_timeout(db_path, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open_with_timeout(db_path: &Path, busy_timeout: Duration) -> Result<Self> {
        info!("opening database at {}", db_path.display());
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Database(format!(
                    "failed to create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;
        Self::configure(&conn, busy_timeout)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(db_path.to_path_buf()),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
        Self::configure(&conn, DEFAULT_BUSY_TIMEOUT)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    fn configure(conn: &Connection, busy_timeout: Duration) -> Result<()> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;
        conn.busy_timeout(busy_timeout)
            .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;
        Ok(())
    }

    /// File backing this database, `None` when in-memory.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("database lock poisoned".into()))
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let conn = self.connection()?;
        table_exists(&conn, table)
    }

    /// Names of all user tables, sorted.
    pub fn table_names(&self) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )
            .map_err(|e| Error::Database(format!("failed to prepare table listing: {e}")))?;

        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| Error::Database(format!("failed to list tables: {e}")))?;

        let mut names = Vec::new();
        for row in rows {
            names.push(row.map_err(|e| Error::Database(format!("failed to read table name: {e}")))?);
        }
        Ok(names)
    }
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )
        .map_err(|e| Error::Database(format!("failed to check table {table}: {e}")))?;
    Ok(count > 0)
}
