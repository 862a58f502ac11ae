//! Backend/database version compatibility.
//!
//! The backend demands one exact database schema version. Any other version
//! is incompatible; the ordering between the two decides whether migrating
//! the database can fix it or whether the backend itself is too old.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use rollout_common::{BACKEND_VERSION, Error, Result};
use serde::Serialize;

/// Database schema version this backend build requires. Bump together with
/// the migration that produces it.
pub const REQUIRED_DB_VERSION: &str = "0.4.0";

/// A strict `MAJOR.MINOR.PATCH` version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SemVer {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl SemVer {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for SemVer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return Err(Error::Version(format!("invalid version format: {s}")));
        }

        let component = |name: &str, raw: &str| -> Result<u64> {
            // u64::from_str accepts a leading '+', which is not a valid component
            if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
                return Err(Error::Version(format!("invalid {name} version: {raw}")));
            }
            raw.parse()
                .map_err(|_| Error::Version(format!("invalid {name} version: {raw}")))
        };

        Ok(Self {
            major: component("major", parts[0])?,
            minor: component("minor", parts[1])?,
            patch: component("patch", parts[2])?,
        })
    }
}

pub fn parse_version(version: &str) -> Result<SemVer> {
    version.parse()
}

/// Compare two version strings by major, then minor, then patch.
pub fn compare_versions(a: &str, b: &str) -> Result<Ordering> {
    Ok(parse_version(a)?.cmp(&parse_version(b)?))
}

/// Why the database and backend versions do (not) line up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompatibilityStatus {
    Compatible,
    /// Database is older (or has no version yet); migrating fixes it.
    MigrationRequired,
    /// Database is newer than this backend understands, or its version
    /// cannot be ordered against the required one.
    BackendTooOld,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionCompatibility {
    pub backend_version: String,
    pub required_db_version: String,
    pub actual_db_version: String,
    pub compatible: bool,
    /// Set whenever the versions differ, including when the backend is too
    /// old. Use `status` to tell the cases apart.
    pub migration_needed: bool,
    pub status: CompatibilityStatus,
    pub reason: String,
}

impl VersionCompatibility {
    pub fn check(actual: &str, required: &str, backend_version: &str) -> Self {
        let compatible = actual == required;
        let status = if compatible {
            CompatibilityStatus::Compatible
        } else if actual.is_empty() {
            CompatibilityStatus::MigrationRequired
        } else {
            match compare_versions(actual, required) {
                Ok(Ordering::Less) => CompatibilityStatus::MigrationRequired,
                _ => CompatibilityStatus::BackendTooOld,
            }
        };

        let reason = match status {
            CompatibilityStatus::Compatible => {
                "Database version matches required version".to_string()
            }
            CompatibilityStatus::MigrationRequired if actual.is_empty() => {
                format!("Database has no recorded version, migration required: none → {required}")
            }
            CompatibilityStatus::MigrationRequired => {
                format!("Database migration required: {actual} → {required}")
            }
            CompatibilityStatus::BackendTooOld => format!(
                "Backend too old for database version. Backend requires {required}, database is {actual}"
            ),
        };

        Self {
            backend_version: backend_version.to_string(),
            required_db_version: required.to_string(),
            actual_db_version: actual.to_string(),
            compatible,
            migration_needed: !compatible,
            status,
            reason,
        }
    }

    /// Whether applying pending migrations can make the database compatible.
    pub fn is_migratable(&self) -> bool {
        self.status == CompatibilityStatus::MigrationRequired
    }
}

/// Check `actual` against this build's required database version.
pub fn check_compatibility(actual: &str) -> VersionCompatibility {
    VersionCompatibility::check(actual, REQUIRED_DB_VERSION, BACKEND_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_triplets() {
        assert_eq!(parse_version("0.4.0").unwrap(), SemVer::new(0, 4, 0));
        assert_eq!(parse_version("10.20.30").unwrap(), SemVer::new(10, 20, 30));
    }

    #[test]
    fn rejects_malformed_versions() {
        for bad in ["1.2", "1.2.3.4", "1.a.3", "", "1..3", "-1.2.3", "+1.2.3", "1.2.3 "] {
            assert!(parse_version(bad).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn compare_orders_by_major_minor_patch() {
        assert_eq!(compare_versions("0.4.0", "0.5.0").unwrap(), Ordering::Less);
        assert_eq!(compare_versions("1.0.0", "0.9.9").unwrap(), Ordering::Greater);
        assert_eq!(compare_versions("0.4.1", "0.4.0").unwrap(), Ordering::Greater);
        assert_eq!(compare_versions("2.3.4", "2.3.4").unwrap(), Ordering::Equal);
        assert!(compare_versions("2.3", "2.3.4").is_err());
    }

    #[test]
    fn compare_is_antisymmetric() {
        let versions = ["0.0.0", "0.4.0", "0.4.1", "0.10.0", "1.0.0", "1.2.3", "3.0.9"];
        for a in versions {
            assert_eq!(compare_versions(a, a).unwrap(), Ordering::Equal);
            for b in versions {
                assert_eq!(
                    compare_versions(a, b).unwrap(),
                    compare_versions(b, a).unwrap().reverse(),
                    "{a} vs {b}"
                );
            }
        }
    }

    #[test]
    fn matching_version_is_compatible() {
        let compat = check_compatibility(REQUIRED_DB_VERSION);
        assert!(compat.compatible);
        assert!(!compat.migration_needed);
        assert_eq!(compat.status, CompatibilityStatus::Compatible);
        assert_eq!(compat.backend_version, BACKEND_VERSION);
    }

    #[test]
    fn older_database_needs_migration() {
        let compat = VersionCompatibility::check("0.3.9", "0.4.0", "0.1.30");
        assert!(!compat.compatible);
        assert!(compat.migration_needed);
        assert!(compat.is_migratable());
        assert!(compat.reason.contains("migration required"));
        assert!(compat.reason.contains("0.3.9 → 0.4.0"));
    }

    #[test]
    fn newer_database_means_backend_too_old() {
        let compat = VersionCompatibility::check("0.5.0", "0.4.0", "0.1.30");
        assert!(!compat.compatible);
        // The flag is set for both mismatch directions
        assert!(compat.migration_needed);
        assert!(!compat.is_migratable());
        assert_eq!(compat.status, CompatibilityStatus::BackendTooOld);
        assert!(compat.reason.contains("Backend too old"));
    }

    #[test]
    fn empty_database_version_is_migratable() {
        let compat = VersionCompatibility::check("", "0.4.0", "0.1.30");
        assert!(!compat.compatible);
        assert!(compat.is_migratable());
    }

    #[test]
    fn unparsable_database_version_means_backend_too_old() {
        let compat = VersionCompatibility::check("banana", "0.4.0", "0.1.30");
        assert_eq!(compat.status, CompatibilityStatus::BackendTooOld);
        assert!(!compat.is_migratable());
        assert!(compat.reason.starts_with("Backend too old for database version"));
    }
}
