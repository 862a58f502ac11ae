//! Migration catalogue for tracking and applying database schema changes.
//!
//! Each migration has a number, the schema version it produces, forward and
//! backward SQL statements and an optional data step. Migrations are applied
//! in ascending number order and tracked in the `schema_version` and
//! `migration_history` tables.

use std::fmt;

use ring::digest;
use rollout_common::{Error, Result};
use rusqlite::Connection;

use crate::compat::parse_version;
use crate::ledger;

/// Extra work run inside the migration's transaction after its SQL statements.
pub type DataStep = fn(&Connection) -> Result<()>;

#[derive(Clone)]
pub struct Migration {
    pub number: i64,
    /// Schema version the database is at once this migration is applied.
    pub version: &'static str,
    pub description: &'static str,
    pub up: &'static [&'static str],
    pub down: &'static [&'static str],
    pub data_step: Option<DataStep>,
    /// A failing critical migration stops the batch; others only warn.
    pub critical: bool,
}

impl Migration {
    pub fn rollback_available(&self) -> bool {
        !self.down.is_empty()
    }

    /// Hex SHA-256 over the description and forward statements.
    pub fn checksum(&self) -> String {
        let mut ctx = digest::Context::new(&digest::SHA256);
        ctx.update(self.description.as_bytes());
        for statement in self.up {
            ctx.update(b"\n");
            ctx.update(statement.as_bytes());
        }
        ctx.finish()
            .as_ref()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("number", &self.number)
            .field("version", &self.version)
            .field("description", &self.description)
            .field("up", &self.up.len())
            .field("down", &self.down.len())
            .field("data_step", &self.data_step.is_some())
            .field("critical", &self.critical)
            .finish()
    }
}

pub const SCHEMA_VERSION_TRACKING: Migration = Migration {
    number: 1,
    version: "0.4.0",
    description: "Initial schema version tracking",
    up: &[],
    down: &[
        "DROP TABLE IF EXISTS migration_history",
        "DROP TABLE IF EXISTS schema_version",
    ],
    data_step: Some(ledger::create_tables),
    critical: true,
};

/// Every migration this build knows about, in order.
pub const BUILTIN_MIGRATIONS: &[Migration] = &[SCHEMA_VERSION_TRACKING];

/// Ordered, validated collection of migrations.
///
/// Numbers are strictly increasing and unique, and every target version is a
/// well-formed `MAJOR.MINOR.PATCH` triplet.
#[derive(Debug, Clone)]
pub struct MigrationRegistry {
    migrations: Vec<Migration>,
}

impl MigrationRegistry {
    pub fn new(migrations: Vec<Migration>) -> Result<Self> {
        let mut previous: Option<i64> = None;
        for migration in &migrations {
            if migration.number <= 0 {
                return Err(Error::Migration(format!(
                    "migration number must be positive, got {}",
                    migration.number
                )));
            }
            if let Some(prev) = previous
                && migration.number <= prev
            {
                return Err(Error::Migration(format!(
                    "migration {} is out of order or duplicated (follows {prev})",
                    migration.number
                )));
            }
            parse_version(migration.version).map_err(|e| {
                Error::Migration(format!("migration {}: {e}", migration.number))
            })?;
            previous = Some(migration.number);
        }

        Ok(Self { migrations })
    }

    /// Registry holding the migrations compiled into this build.
    pub fn builtin() -> Result<Self> {
        Self::new(BUILTIN_MIGRATIONS.to_vec())
    }

    pub fn all(&self) -> &[Migration] {
        &self.migrations
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn by_number(&self, number: i64) -> Option<&Migration> {
        self.migrations
            .binary_search_by_key(&number, |m| m.number)
            .ok()
            .map(|idx| &self.migrations[idx])
    }

    pub fn first(&self) -> Option<&Migration> {
        self.migrations.first()
    }

    pub fn latest(&self) -> Option<&Migration> {
        self.migrations.last()
    }

    /// Migrations numbered above `number`, ascending.
    pub fn after(&self, number: i64) -> Vec<&Migration> {
        self.migrations
            .iter()
            .filter(|m| m.number > number)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migration(number: i64, version: &'static str) -> Migration {
        Migration {
            number,
            version,
            description: "test",
            up: &[],
            down: &[],
            data_step: None,
            critical: true,
        }
    }

    #[test]
    fn builtin_registry_starts_with_tracking_tables() {
        let registry = MigrationRegistry::builtin().unwrap();
        let first = registry.first().unwrap();
        assert_eq!(first.number, 1);
        assert!(first.data_step.is_some());
        assert!(first.rollback_available());
    }

    #[test]
    fn lookup_by_number_and_latest() {
        let registry = MigrationRegistry::new(vec![
            migration(1, "0.4.0"),
            migration(3, "0.5.0"),
            migration(7, "0.6.0"),
        ])
        .unwrap();

        assert_eq!(registry.by_number(3).unwrap().version, "0.5.0");
        assert!(registry.by_number(2).is_none());
        assert_eq!(registry.latest().unwrap().number, 7);
        let pending: Vec<i64> = registry.after(1).iter().map(|m| m.number).collect();
        assert_eq!(pending, vec![3, 7]);
    }

    #[test]
    fn empty_registry_has_no_latest() {
        let registry = MigrationRegistry::new(Vec::new()).unwrap();
        assert!(registry.is_empty());
        assert!(registry.latest().is_none());
        assert!(registry.first().is_none());
    }

    #[test]
    fn rejects_duplicate_numbers() {
        let err = MigrationRegistry::new(vec![migration(1, "0.4.0"), migration(1, "0.4.1")])
            .unwrap_err();
        assert!(err.to_string().contains("out of order or duplicated"));
    }

    #[test]
    fn rejects_decreasing_numbers() {
        assert!(
            MigrationRegistry::new(vec![migration(2, "0.4.0"), migration(1, "0.4.1")]).is_err()
        );
    }

    #[test]
    fn rejects_malformed_target_version() {
        let err = MigrationRegistry::new(vec![migration(1, "0.4")]).unwrap_err();
        assert!(err.to_string().contains("migration 1"));
    }

    #[test]
    fn checksum_is_stable_and_sensitive_to_statements() {
        let mut a = migration(1, "0.4.0");
        a.up = &["CREATE TABLE t (id INTEGER)"];
        let mut b = a.clone();
        assert_eq!(a.checksum(), b.checksum());
        assert_eq!(a.checksum().len(), 64);

        b.up = &["CREATE TABLE t (id INTEGER, name TEXT)"];
        assert_ne!(a.checksum(), b.checksum());
    }
}
