pub mod compat;
pub mod database;
pub mod ledger;
pub mod migrations;
pub mod runner;
pub mod schema;
pub mod validator;

pub use compat::{
    CompatibilityStatus, REQUIRED_DB_VERSION, SemVer, VersionCompatibility, check_compatibility,
    compare_versions, parse_version,
};
pub use database::Database;
pub use ledger::{MigrationHistoryRecord, SchemaVersionRecord};
pub use migrations::{DataStep, Migration, MigrationRegistry};
pub use runner::{MigrationResult, MigrationRunner};
pub use schema::{Category, CoreSchema, SchemaBuilder};
pub use validator::{SchemaValidator, ValidationReport};
