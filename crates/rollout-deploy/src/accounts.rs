use std::num::NonZeroU32;

use chrono::Utc;
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use rollout_common::{Error, Result};
use rollout_db::Database;
use rusqlite::params;

/// Account storage used to seed the administrator on install.
pub trait AccountStore: Send + Sync {
    fn user_exists(&self, username: &str) -> Result<bool>;

    /// Create an administrator account, returning its id.
    fn create_admin(&self, username: &str, password: &str) -> Result<i64>;
}

const HASH_SCHEME: &str = "pbkdf2-sha256";
const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

/// Salted PBKDF2-HMAC-SHA256 hash, stored as
/// `pbkdf2-sha256$<iterations>$<salt hex>$<hash hex>`.
pub fn hash_password(password: &str) -> Result<String> {
    let mut salt = [0u8; SALT_LEN];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| Error::Install("failed to generate password salt".into()))?;

    let iterations = NonZeroU32::new(PBKDF2_ITERATIONS).unwrap_or(NonZeroU32::MIN);
    let mut hash = [0u8; HASH_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        &salt,
        password.as_bytes(),
        &mut hash,
    );
    Ok(format!(
        "{HASH_SCHEME}${iterations}${}${}",
        to_hex(&salt),
        to_hex(&hash)
    ))
}

/// Check `password` against a value produced by [`hash_password`].
/// Malformed stored values never match.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(HASH_SCHEME), Some(iterations), Some(salt), Some(hash), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };
    let Some(iterations) = iterations.parse().ok().and_then(NonZeroU32::new) else {
        return false;
    };
    let (Some(salt), Some(hash)) = (from_hex(salt), from_hex(hash)) else {
        return false;
    };
    pbkdf2::verify(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        &salt,
        password.as_bytes(),
        &hash,
    )
    .is_ok()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn from_hex(s: &str) -> Option<Vec<u8>> {
    if s.is_empty() || s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| s.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}

/// Accounts in the `users` table.
pub struct SqliteAccountStore<'a> {
    db: &'a Database,
}

impl<'a> SqliteAccountStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }
}

impl AccountStore for SqliteAccountStore<'_> {
    fn user_exists(&self, username: &str) -> Result<bool> {
        let conn = self.db.connection()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(format!("failed to check user {username}: {e}")))?;
        Ok(count > 0)
    }

    fn create_admin(&self, username: &str, password: &str) -> Result<i64> {
        let password_hash = hash_password(password)?;
        let conn = self.db.connection()?;
        conn.execute(
            "INSERT INTO users (username, email, password_hash, role, created_at)
             VALUES (?1, ?2, ?3, 'admin', ?4)",
            params![
                username,
                format!("{username}@localhost"),
                password_hash,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| Error::Database(format!("failed to create admin user {username}: {e}")))?;
        Ok(conn.last_insert_rowid())
    }
}
