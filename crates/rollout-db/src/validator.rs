//! Post-migration schema checks.

use rollout_common::{Error, Result};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

use crate::database::{self, Database};
use crate::ledger::{
    self, MIGRATION_HISTORY_COLUMNS, MIGRATION_HISTORY_TABLE, SCHEMA_VERSION_COLUMNS,
    SCHEMA_VERSION_TABLE,
};
use crate::migrations::MigrationRegistry;
use crate::schema::SchemaBuilder;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub success: bool,
    pub tables_checked: usize,
    pub tables_valid: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub missing_tables: Vec<String>,
    /// `table.column` entries.
    pub missing_columns: Vec<String>,
}

impl ValidationReport {
    fn error(&mut self, message: String) {
        self.errors.push(message);
    }

    fn warning(&mut self, message: String) {
        self.warnings.push(message);
    }
}

/// Checks that the tracking tables (and optionally the entity schema) are in
/// place and that the ledger agrees with the registry.
pub struct SchemaValidator<'a> {
    db: &'a Database,
    registry: Option<&'a MigrationRegistry>,
    entity_tables: Vec<String>,
}

impl<'a> SchemaValidator<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self {
            db,
            registry: None,
            entity_tables: Vec::new(),
        }
    }

    /// Compare recorded checksums against these migrations.
    pub fn with_registry(mut self, registry: &'a MigrationRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Also require every table of `schema`.
    pub fn with_schema(mut self, schema: &dyn SchemaBuilder) -> Self {
        self.entity_tables = schema.required_tables();
        self
    }

    pub fn validate(&self) -> Result<ValidationReport> {
        let conn = self.db.connection()?;
        let mut report = ValidationReport::default();

        let versions_readable =
            self.check_table(&conn, &mut report, SCHEMA_VERSION_TABLE, SCHEMA_VERSION_COLUMNS)?;
        self.check_table(
            &conn,
            &mut report,
            MIGRATION_HISTORY_TABLE,
            MIGRATION_HISTORY_COLUMNS,
        )?;
        for table in &self.entity_tables {
            self.check_table(&conn, &mut report, table, &[])?;
        }

        if versions_readable {
            let versions = ledger::schema_versions(&conn)?;
            if versions.is_empty() {
                report.warning("schema_version table is empty".into());
            }

            if let Some(registry) = self.registry {
                for record in &versions {
                    let Some(expected) = record.checksum.as_deref() else {
                        continue;
                    };
                    match registry.by_number(record.migration_number) {
                        Some(migration) if migration.checksum() != expected => {
                            report.warning(format!(
                                "checksum mismatch for migration {}: recorded statements differ from this build",
                                record.migration_number
                            ));
                        }
                        Some(_) => {}
                        None => report.warning(format!(
                            "migration {} is recorded but unknown to this build",
                            record.migration_number
                        )),
                    }
                }
            }
        }

        report.success = report.errors.is_empty();
        for warning in &report.warnings {
            warn!("validation warning: {warning}");
        }
        info!(
            "schema validation: {}/{} tables valid, {} error(s), {} warning(s)",
            report.tables_valid,
            report.tables_checked,
            report.errors.len(),
            report.warnings.len()
        );
        Ok(report)
    }

    /// Validate and fail when any error was found.
    pub fn validate_post_migration(&self) -> Result<ValidationReport> {
        let report = self.validate()?;
        if !report.success {
            return Err(Error::Migration(format!(
                "schema validation failed: {}",
                report.errors.join("; ")
            )));
        }
        Ok(report)
    }

    fn check_table(
        &self,
        conn: &Connection,
        report: &mut ValidationReport,
        table: &str,
        required_columns: &[&str],
    ) -> Result<bool> {
        report.tables_checked += 1;

        if !database::table_exists(conn, table)? {
            report.missing_tables.push(table.to_string());
            report.error(format!("required table {table} does not exist"));
            return Ok(false);
        }

        let columns = table_columns(conn, table)?;
        let mut valid = true;
        for column in required_columns {
            if !columns.iter().any(|c| c == column) {
                valid = false;
                report.missing_columns.push(format!("{table}.{column}"));
                report.error(format!("required column {table}.{column} does not exist"));
            }
        }

        if valid {
            report.tables_valid += 1;
        }
        Ok(valid)
    }
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(|e| Error::Database(format!("failed to inspect {table}: {e}")))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| Error::Database(format!("failed to inspect {table}: {e}")))?;

    let mut columns = Vec::new();
    for row in rows {
        columns.push(row.map_err(|e| Error::Database(format!("failed to read column: {e}")))?);
    }
    Ok(columns)
}
