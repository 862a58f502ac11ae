pub mod loader;
pub mod model;

pub use loader::ConfigLoader;
pub use model::{
    BackupConfig, BackupMethod, DatabaseConfig, DeployConfig, ExportConfig, InstallConfig,
    MasterDataConfig,
};
