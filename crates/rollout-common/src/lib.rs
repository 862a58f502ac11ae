pub mod error;

pub use error::{Error, PartialFailure, Result};

/// Version of the backend build this tool ships with.
pub const BACKEND_VERSION: &str = env!("CARGO_PKG_VERSION");
