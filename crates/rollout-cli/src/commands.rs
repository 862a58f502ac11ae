use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use dialoguer::Confirm;
use rollout_common::BACKEND_VERSION;
use rollout_config::DeployConfig;
use rollout_db::{
    CoreSchema, Database, MigrationRegistry, MigrationRunner, REQUIRED_DB_VERSION,
    SchemaValidator, check_compatibility,
};
use rollout_deploy::{
    BackupService, DeploymentOrchestrator, DeploymentReport, Installer, JsonExportService,
    SqliteAccountStore, SqliteMasterDataImporter,
};
use tracing::info;

fn open_database(config: &DeployConfig) -> Result<Database> {
    let db = if config.database.is_in_memory() {
        Database::in_memory()
    } else {
        Database::open_with_timeout(
            &config.database.path,
            Duration::from_millis(config.database.busy_timeout_ms),
        )
    };
    db.context("failed to open database")
}

fn registry() -> Result<MigrationRegistry> {
    MigrationRegistry::builtin().context("invalid built-in migrations")
}

pub fn version() {
    println!("rollout {BACKEND_VERSION}");
    println!("  Backend version:     {BACKEND_VERSION}");
    println!("  Required DB version: {REQUIRED_DB_VERSION}");
}

pub fn status(config: &DeployConfig) -> Result<()> {
    let db = open_database(config)?;
    let registry = registry()?;
    let runner = MigrationRunner::new(&db, &registry);

    let (version, number) = runner.current_version()?;
    let compat = check_compatibility(&version);
    let pending = runner.pending_migrations()?;

    println!();
    println!("  Database:            {}", config.database.path.display());
    println!("  Backend version:     {BACKEND_VERSION}");
    println!("  Required DB version: {REQUIRED_DB_VERSION}");
    if version.is_empty() {
        println!("  Current DB version:  (none)");
    } else {
        println!("  Current DB version:  {version} (migration {number})");
    }
    println!(
        "  Compatible:          {}",
        if compat.compatible { "yes" } else { "no" }
    );
    println!("  {}", compat.reason);

    if pending.is_empty() {
        println!("  No pending migrations.");
    } else {
        println!("  Pending migrations:  {}", pending.len());
        for migration in pending {
            println!(
                "    {:>4}  {:<8} {}",
                migration.number, migration.version, migration.description
            );
        }
    }
    println!();
    Ok(())
}

pub fn validate(config: &DeployConfig) -> Result<()> {
    let db = open_database(config)?;
    let registry = registry()?;
    let report = SchemaValidator::new(&db).with_registry(&registry).validate()?;

    println!(
        "  Tables valid: {}/{}",
        report.tables_valid, report.tables_checked
    );
    for warning in &report.warnings {
        println!("  Warning: {warning}");
    }
    for error in &report.errors {
        println!("  Error: {error}");
    }

    if !report.success {
        bail!("schema validation failed with {} error(s)", report.errors.len());
    }
    println!("  Schema is valid.");
    Ok(())
}

fn confirm(prompt: &str, yes: bool) -> Result<bool> {
    if yes {
        return Ok(true);
    }
    if !std::io::stdin().is_terminal() {
        bail!("non-interactive environment detected, pass --yes to continue");
    }
    Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .context("confirmation cancelled")
}

pub fn deploy(config: &DeployConfig, import: Option<&Path>, yes: bool, verbose: bool) -> Result<()> {
    let prompt = format!("Deploy to {}?", config.database.path.display());
    if !confirm(&prompt, yes)? {
        println!("  Deployment cancelled.");
        return Ok(());
    }

    let db = open_database(config)?;
    let registry = registry()?;
    let exporter = JsonExportService::new(&db, &config.master_data.game_system);
    let backup = BackupService::new(&db, &exporter, &config.backup);
    let orchestrator = DeploymentOrchestrator::new(
        &db,
        &registry,
        backup,
        &exporter,
        &config.export.pre_deploy_dir,
    )
    .verbose(verbose);

    let outcome = match import {
        Some(path) => orchestrator.full_deployment_with_import(Some(path)),
        None => orchestrator.deploy(),
    };

    match outcome {
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(failure) => {
            print_report(&failure.partial);
            if let Some(backup) = &failure.partial.backup {
                println!("  Restore from {} if needed.", backup.file_path.display());
            }
            Err(failure.into())
        }
    }
}

fn print_report(report: &DeploymentReport) {
    println!();
    println!(
        "  Deployment {} in {}ms",
        if report.success { "succeeded" } else { "FAILED" },
        report.duration_ms
    );
    if let Some(backup) = &report.backup {
        println!(
            "  Backup:     {} ({} bytes)",
            backup.file_path.display(),
            backup.size_bytes
        );
    }
    if let Some(export) = &report.pre_deploy_export {
        println!(
            "  Export:     {} ({} records)",
            export.path.display(),
            export.record_count
        );
    }
    for result in &report.migrations {
        let status = if result.success { "ok" } else { "failed" };
        println!(
            "  Migration {:>4}: {status} ({}ms) {}",
            result.number, result.execution_time_ms, result.description
        );
    }
    if report.records_imported > 0 {
        println!("  Imported:   {} records", report.records_imported);
    }
    if !report.final_version.is_empty() {
        println!("  Version:    {}", report.final_version);
    }
    for warning in &report.warnings {
        println!("  Warning: {warning}");
    }
    for error in &report.errors {
        println!("  Error: {error}");
    }
    println!();
}

pub fn prepare(config: &DeployConfig, dir: Option<PathBuf>) -> Result<()> {
    let dir = dir.unwrap_or_else(|| config.export.dir.clone());
    let db = open_database(config)?;
    let registry = registry()?;
    let exporter = JsonExportService::new(&db, &config.master_data.game_system);
    let backup = BackupService::new(&db, &exporter, &config.backup);
    let orchestrator = DeploymentOrchestrator::new(
        &db,
        &registry,
        backup,
        &exporter,
        &config.export.pre_deploy_dir,
    );

    let package = orchestrator.prepare_deployment_package(&dir)?;
    println!("  Export:  {} ({} records)", package.export.path.display(), package.export.record_count);
    println!(
        "  Package: {} ({} bytes)",
        package.compressed_path.display(),
        package.compressed_size_bytes
    );
    Ok(())
}

pub fn install(
    config: &DeployConfig,
    master_data: Option<PathBuf>,
    admin_user: Option<String>,
    admin_password: Option<String>,
) -> Result<()> {
    let db = open_database(config)?;
    let tables = db.table_names()?;
    if !tables.is_empty() {
        bail!(
            "database already has {} table(s); use `rollout deploy` to update it",
            tables.len()
        );
    }

    let registry = registry()?;
    let master_data = master_data.unwrap_or_else(|| config.master_data.dir.clone());
    let importer = SqliteMasterDataImporter::new(&db, &config.master_data.game_system);
    let accounts = SqliteAccountStore::new(&db);
    let mut installer =
        Installer::new(&db, &registry, &CoreSchema, &importer, &accounts, master_data);

    let username = admin_user.or_else(|| config.install.admin_username.clone());
    let password = admin_password.or_else(|| config.install.admin_password.clone());
    match (username, password) {
        (Some(username), Some(password)) => installer = installer.with_admin(username, password),
        (Some(_), None) | (None, Some(_)) => {
            bail!("admin username and password must be given together")
        }
        (None, None) => info!("no admin account configured"),
    }

    let result = installer.initialize().map_err(|failure| {
        for error in &failure.partial.errors {
            println!("  Error: {error}");
        }
        anyhow::Error::from(failure)
    })?;

    println!();
    println!("  Installation completed in {}ms", result.execution_time_ms);
    println!("  Tables:      {}", result.tables_created.len());
    println!(
        "  Version:     {} (migration {})",
        result.version, result.migration_number
    );
    println!("  Master data: {} records", result.master_data_records);
    if result.admin_created {
        println!("  Admin user created.");
    }
    for warning in &result.warnings {
        println!("  Warning: {warning}");
    }
    println!();
    Ok(())
}

pub fn rollback(config: &DeployConfig, steps: i64, dry_run: bool, verbose: bool) -> Result<()> {
    let db = open_database(config)?;
    let registry = registry()?;
    let runner = MigrationRunner::new(&db, &registry)
        .dry_run(dry_run)
        .verbose(verbose);

    let rolled_back = runner.rollback(steps)?;
    let (version, number) = runner.current_version()?;
    let verb = if dry_run { "Would roll back" } else { "Rolled back" };
    println!("  {verb} migration(s): {rolled_back:?}");
    if version.is_empty() {
        println!("  Database has no recorded version.");
    } else {
        println!("  Current version: {version} (migration {number})");
    }
    Ok(())
}

pub fn list_backups(config: &DeployConfig) -> Result<()> {
    let db = open_database(config)?;
    let exporter = JsonExportService::new(&db, &config.master_data.game_system);
    let service = BackupService::new(&db, &exporter, &config.backup);

    let files = service.list()?;
    if files.is_empty() {
        println!("  No backups in {}", service.dir().display());
        return Ok(());
    }
    for file in files {
        println!(
            "  {}  {:>10} bytes  {}",
            file.modified.format("%Y-%m-%d %H:%M:%S"),
            file.size_bytes,
            file.path.display()
        );
    }
    Ok(())
}

pub fn cleanup_backups(config: &DeployConfig, retention_days: Option<u32>) -> Result<()> {
    let retention_days = retention_days.unwrap_or(config.backup.retention_days);
    if retention_days == 0 {
        bail!("retention days must be positive");
    }

    let db = open_database(config)?;
    let exporter = JsonExportService::new(&db, &config.master_data.game_system);
    let service = BackupService::new(&db, &exporter, &config.backup);
    let deleted = service.cleanup(retention_days)?;
    println!("  Deleted {deleted} backup(s) older than {retention_days} day(s).");
    Ok(())
}
