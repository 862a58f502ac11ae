mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollout_config::ConfigLoader;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "rollout",
    version,
    about = "Schema migrations, backups and deployments for the character backend"
)]
struct Cli {
    /// Config file (YAML or TOML)
    #[arg(short, long, global = true, env = "ROLLOUT_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging and per-statement output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "ROLLOUT_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show database version, compatibility and pending migrations
    Status,
    /// Show backend and required database version
    Version,
    /// Check tracking tables and recorded checksums
    Validate,
    /// Back up, migrate and validate the database
    Deploy {
        /// Export file to import after migrating
        #[arg(long)]
        import: Option<PathBuf>,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Export master data into a deployment package
    Prepare {
        /// Output directory (defaults to the configured export dir)
        dir: Option<PathBuf>,
    },
    /// Bootstrap an empty database at the newest version
    Install {
        /// Master data directory
        #[arg(long)]
        master_data: Option<PathBuf>,
        #[arg(long)]
        admin_user: Option<String>,
        #[arg(long)]
        admin_password: Option<String>,
    },
    /// Roll back the most recent migrations
    Rollback {
        #[arg(long, allow_negative_numbers = true)]
        steps: i64,
        /// Only show what would be rolled back
        #[arg(long)]
        dry_run: bool,
    },
    /// Manage backup files
    Backups {
        #[command(subcommand)]
        action: BackupCommands,
    },
}

#[derive(Subcommand)]
enum BackupCommands {
    /// List backup files, newest first
    List,
    /// Delete backups older than the retention period
    Cleanup {
        #[arg(long)]
        retention_days: Option<u32>,
    },
}

fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> Result<()> {
    // Missing .env is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    if let Commands::Version = cli.command {
        commands::version();
        return Ok(());
    }

    let config_path = cli.config.unwrap_or_else(ConfigLoader::default_path);
    let config = ConfigLoader::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    config.validate().context("invalid configuration")?;

    let verbose = cli.verbose;
    match cli.command {
        Commands::Version => Ok(()),
        Commands::Status => commands::status(&config),
        Commands::Validate => commands::validate(&config),
        Commands::Deploy { import, yes } => {
            commands::deploy(&config, import.as_deref(), yes, verbose)
        }
        Commands::Prepare { dir } => commands::prepare(&config, dir),
        Commands::Install {
            master_data,
            admin_user,
            admin_password,
        } => commands::install(&config, master_data, admin_user, admin_password),
        Commands::Rollback { steps, dry_run } => {
            commands::rollback(&config, steps, dry_run, verbose)
        }
        Commands::Backups { action } => match action {
            BackupCommands::List => commands::list_backups(&config),
            BackupCommands::Cleanup { retention_days } => {
                commands::cleanup_backups(&config, retention_days)
            }
        },
    }
}
