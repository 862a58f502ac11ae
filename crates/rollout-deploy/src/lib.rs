pub mod accounts;
pub mod backup;
pub mod entities;
pub mod export;
pub mod installer;
pub mod masterdata;
pub mod orchestrator;
pub mod transformers;

pub use accounts::{AccountStore, SqliteAccountStore, hash_password, verify_password};
pub use backup::{BackupFile, BackupMetadata, BackupService, backup_file_name};
pub use entities::{CharacterRecord, UserRecord};
pub use export::{
    CURRENT_EXPORT_VERSION, ExportData, ExportService, ExportSummary, JsonExportService,
    LEGACY_EXPORT_VERSION, MasterRecord, read_export_file, write_export_file,
};
pub use installer::{InstallationResult, Installer};
pub use masterdata::{MasterDataImporter, MasterDataSync, SqliteMasterDataImporter};
pub use orchestrator::{DeploymentOrchestrator, DeploymentPackage, DeploymentReport};
pub use transformers::{ExportTransformer, GameSystemStampTransformer, TransformerRegistry};
