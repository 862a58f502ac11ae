use std::time::Instant;

use rollout_common::{BACKEND_VERSION, Error, PartialFailure, Result};
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::database::Database;
use crate::ledger::{self, NewHistoryEntry, NewSchemaVersion};
use crate::migrations::{Migration, MigrationRegistry};

const APPLIED_BY: &str = "migration-runner";

/// Outcome of applying one migration.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationResult {
    pub number: i64,
    pub description: String,
    pub success: bool,
    pub execution_time_ms: i64,
    pub error: Option<String>,
    /// Statements executed (or, in dry-run mode, that would have been).
    pub statements: Vec<String>,
    /// Another runner had already committed this migration.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
}

impl MigrationResult {
    fn started(migration: &Migration) -> Self {
        Self {
            number: migration.number,
            description: migration.description.to_string(),
            success: false,
            execution_time_ms: 0,
            error: None,
            statements: Vec::new(),
            skipped: false,
        }
    }
}

/// Applies and rolls back registry migrations against a database, recording
/// every change in the tracking tables.
pub struct MigrationRunner<'a> {
    db: &'a Database,
    registry: &'a MigrationRegistry,
    dry_run: bool,
    verbose: bool,
    backend_version: String,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(db: &'a Database, registry: &'a MigrationRegistry) -> Self {
        Self {
            db,
            registry,
            dry_run: false,
            verbose: false,
            backend_version: BACKEND_VERSION.to_string(),
        }
    }

    /// Record statements instead of executing them; no ledger rows are written.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn backend_version(mut self, version: impl Into<String>) -> Self {
        self.backend_version = version.into();
        self
    }

    /// Current schema version and migration number, `("", 0)` when nothing
    /// has been recorded yet.
    pub fn current_version(&self) -> Result<(String, i64)> {
        let conn = self.db.connection()?;
        Ok(ledger::current_version(&conn)?.unwrap_or_default())
    }

    pub fn pending_migrations(&self) -> Result<Vec<&'a Migration>> {
        let (_, current) = self.current_version()?;
        Ok(self.registry.after(current))
    }

    /// Apply one migration in its own transaction. Statements, data step and
    /// ledger rows commit together or not at all.
    pub fn apply_migration(
        &self,
        migration: &Migration,
    ) -> std::result::Result<MigrationResult, PartialFailure<MigrationResult>> {
        self.run(migration, false)
    }

    /// Apply every pending migration in order.
    ///
    /// A failing critical migration stops the batch and the results gathered
    /// so far come back with the error. Non-critical failures are logged and
    /// the batch moves on. Migrations another runner committed in the
    /// meantime are skipped.
    pub fn apply_all(
        &self,
    ) -> std::result::Result<Vec<MigrationResult>, PartialFailure<Vec<MigrationResult>>> {
        let pending = self
            .pending_migrations()
            .map_err(|e| PartialFailure::new(Vec::new(), e))?;

        if pending.is_empty() {
            info!("no pending migrations");
            return Ok(Vec::new());
        }

        info!("found {} pending migration(s)", pending.len());

        let mut results = Vec::with_capacity(pending.len());
        for migration in pending {
            info!(
                migration = migration.number,
                "applying migration {}: {}", migration.number, migration.description
            );

            match self.run(migration, true) {
                Ok(result) if result.skipped => {
                    info!(
                        migration = migration.number,
                        "migration already applied by another runner, skipping"
                    );
                }
                Ok(result) => results.push(result),
                Err(failure) => {
                    let (result, err) = failure.into_parts();
                    results.push(result);
                    if migration.critical {
                        error!("critical migration failed, stopping: {err}");
                        return Err(PartialFailure::new(results, err));
                    }
                    warn!("non-critical migration failed: {err}");
                }
            }
        }

        info!("all pending migrations completed");
        Ok(results)
    }

    fn run(
        &self,
        migration: &Migration,
        skip_if_applied: bool,
    ) -> std::result::Result<MigrationResult, PartialFailure<MigrationResult>> {
        let start = Instant::now();
        let mut result = MigrationResult::started(migration);

        if self.verbose {
            info!("applying migration {}: {}", migration.number, migration.description);
        }

        let outcome = self.db.connection().and_then(|mut conn| {
            self.run_in_transaction(&mut conn, migration, skip_if_applied, start, &mut result)
        });

        result.execution_time_ms = start.elapsed().as_millis() as i64;

        match outcome {
            Ok(false) => {
                result.skipped = true;
                result.success = true;
                Ok(result)
            }
            Ok(true) => {
                result.success = true;
                if self.verbose {
                    info!(
                        "migration {} completed in {}ms",
                        migration.number, result.execution_time_ms
                    );
                }
                Ok(result)
            }
            Err(err) => {
                result.error = Some(err.to_string());
                Err(PartialFailure::new(result, err))
            }
        }
    }

    /// Returns `false` when the migration was skipped because the ledger
    /// already records it.
    fn run_in_transaction(
        &self,
        conn: &mut Connection,
        migration: &Migration,
        skip_if_applied: bool,
        start: Instant,
        result: &mut MigrationResult,
    ) -> Result<bool> {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;

        if skip_if_applied
            && let Some((_, current)) = ledger::current_version(&tx)?
            && current >= migration.number
        {
            return Ok(false);
        }

        for sql in migration.up {
            if self.verbose {
                debug!("executing SQL: {sql}");
            }

            if self.dry_run {
                info!("[dry run] would execute: {sql}");
                result.statements.push(sql.to_string());
                continue;
            }

            tx.execute_batch(sql)
                .map_err(|e| Error::Migration(format!("SQL failed: {sql} - error: {e}")))?;
            result.statements.push(sql.to_string());
        }

        if self.dry_run {
            return Ok(true);
        }

        if let Some(step) = migration.data_step {
            if self.verbose {
                debug!("executing data migration step");
            }
            step(&tx).map_err(|e| Error::Migration(format!("data migration failed: {e}")))?;
        }

        ledger::insert_history(
            &tx,
            &NewHistoryEntry {
                migration_number: migration.number,
                version: migration.version,
                description: migration.description,
                applied_by: APPLIED_BY,
                execution_time_ms: start.elapsed().as_millis() as i64,
                rollback_available: migration.rollback_available(),
            },
        )?;

        let checksum = migration.checksum();
        ledger::insert_schema_version(
            &tx,
            &NewSchemaVersion {
                version: migration.version,
                migration_number: migration.number,
                backend_version: &self.backend_version,
                description: migration.description,
                checksum: Some(&checksum),
            },
        )?;

        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit migration: {e}")))?;
        Ok(true)
    }

    /// Roll back the newest `steps` successfully applied migrations, highest
    /// number first, each in its own transaction.
    ///
    /// Every target is resolved and checked for down statements before
    /// anything is touched. Returns the rolled back migration numbers.
    pub fn rollback(&self, steps: i64) -> Result<Vec<i64>> {
        if steps <= 0 {
            return Err(Error::Rollback("steps must be positive".into()));
        }

        let mut conn = self.db.connection()?;
        let targets = ledger::latest_successful(&conn, steps as usize)?;
        if targets.is_empty() {
            return Err(Error::Rollback("no migrations to rollback".into()));
        }

        let mut plan = Vec::with_capacity(targets.len());
        for entry in &targets {
            let migration = self
                .registry
                .by_number(entry.migration_number)
                .ok_or_else(|| {
                    Error::Rollback(format!("migration {} not found", entry.migration_number))
                })?;
            if !migration.rollback_available() {
                return Err(Error::Rollback(format!(
                    "migration {} has no rollback SQL",
                    migration.number
                )));
            }
            plan.push(migration);
        }

        info!("rolling back {} migration(s)", plan.len());

        let mut rolled_back = Vec::with_capacity(plan.len());
        for migration in plan {
            info!(
                migration = migration.number,
                "rolling back migration {}: {}", migration.number, migration.description
            );

            if self.dry_run {
                for sql in migration.down {
                    info!("[dry run] would execute rollback: {sql}");
                }
                rolled_back.push(migration.number);
                continue;
            }

            self.rollback_in_transaction(&mut conn, migration)?;
            info!("migration {} rolled back successfully", migration.number);
            rolled_back.push(migration.number);
        }

        info!("rollback completed");
        Ok(rolled_back)
    }

    fn rollback_in_transaction(&self, conn: &mut Connection, migration: &Migration) -> Result<()> {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;

        // Ledger rows go first: the down statements may drop the ledger itself
        ledger::delete_history(&tx, migration.number)?;
        ledger::delete_schema_versions(&tx, migration.number)?;
        self.restore_previous_version(&tx, migration.number)?;

        for sql in migration.down {
            if self.verbose {
                debug!("executing rollback SQL: {sql}");
            }
            tx.execute_batch(sql)
                .map_err(|e| Error::Rollback(format!("rollback SQL failed: {sql} - error: {e}")))?;
        }

        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit rollback: {e}")))
    }

    /// Make the newest `schema_version` row point at the highest migration
    /// still in history. Installs record a single version row for the latest
    /// migration, so removing it would otherwise leave no version at all.
    fn restore_previous_version(&self, conn: &Connection, rolled_back: i64) -> Result<()> {
        let remaining = ledger::latest_successful(conn, 1)?;
        let Some(previous) = remaining.first() else {
            return Ok(());
        };
        if previous.migration_number >= rolled_back {
            return Ok(());
        }

        let current = ledger::current_version(conn)?;
        if current.as_ref().map(|(_, n)| *n) == Some(previous.migration_number) {
            return Ok(());
        }

        let checksum = self
            .registry
            .by_number(previous.migration_number)
            .map(Migration::checksum);
        let description = format!("Restored after rollback of migration {rolled_back}");
        ledger::insert_schema_version(
            conn,
            &NewSchemaVersion {
                version: &previous.version,
                migration_number: previous.migration_number,
                backend_version: &self.backend_version,
                description: &description,
                checksum: checksum.as_deref(),
            },
        )?;
        debug!(
            "schema version restored to {} (migration {})",
            previous.version, previous.migration_number
        );
        Ok(())
    }
}
