use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("rollback error: {0}")]
    Rollback(String),

    #[error("version error: {0}")]
    Version(String),

    #[error("backup error: {0}")]
    Backup(String),

    #[error("master data error: {0}")]
    MasterData(String),

    #[error("export error: {0}")]
    Export(String),

    #[error("installation error: {0}")]
    Install(String),

    #[error("deployment error: {0}")]
    Deploy(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

/// An operation that stopped partway, carrying whatever it had accumulated
/// (run records, reports) alongside the error that stopped it.
pub struct PartialFailure<T> {
    pub partial: T,
    pub error: Error,
}

impl<T> PartialFailure<T> {
    pub fn new(partial: T, error: Error) -> Self {
        Self { partial, error }
    }

    pub fn into_parts(self) -> (T, Error) {
        (self.partial, self.error)
    }
}

impl<T> fmt::Debug for PartialFailure<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialFailure")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for PartialFailure<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl<T> std::error::Error for PartialFailure<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.error)
    }
}

impl<T> From<PartialFailure<T>> for Error {
    fn from(failure: PartialFailure<T>) -> Self {
        failure.error
    }
}
