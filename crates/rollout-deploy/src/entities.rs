//! Account and character rows carried by exports and structured backups.

use rollout_common::{Error, Result};
use rollout_db::database::table_exists;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterRecord {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub owner_id: Option<i64>,
    pub game_system: String,
    /// The stored character sheet.
    #[serde(default)]
    pub data: Value,
    pub created_at: String,
}

/// All users by id, `None` when the table does not exist.
pub fn read_users(conn: &Connection) -> Result<Option<Vec<UserRecord>>> {
    if !table_exists(conn, "users")? {
        return Ok(None);
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, username, email, password_hash, role, created_at
             FROM users ORDER BY id",
        )
        .map_err(|e| Error::Database(format!("failed to read users: {e}")))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(UserRecord {
                id: row.get(0)?,
                username: row.get(1)?,
                email: row.get(2)?,
                password_hash: row.get(3)?,
                role: row.get(4)?,
                created_at: row.get(5)?,
            })
        })
        .map_err(|e| Error::Database(format!("failed to read users: {e}")))?;

    let mut users = Vec::new();
    for row in rows {
        users.push(row.map_err(|e| Error::Database(format!("failed to read users row: {e}")))?);
    }
    Ok(Some(users))
}

/// All characters by id, `None` when the table does not exist.
pub fn read_characters(conn: &Connection) -> Result<Option<Vec<CharacterRecord>>> {
    if !table_exists(conn, "characters")? {
        return Ok(None);
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, name, owner_id, game_system, data, created_at
             FROM characters ORDER BY id",
        )
        .map_err(|e| Error::Database(format!("failed to read characters: {e}")))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })
        .map_err(|e| Error::Database(format!("failed to read characters: {e}")))?;

    let mut characters = Vec::new();
    for row in rows {
        let (id, name, owner_id, game_system, raw, created_at) =
            row.map_err(|e| Error::Database(format!("failed to read characters row: {e}")))?;
        // Sheets that are not JSON are kept verbatim as a string
        let data = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
        characters.push(CharacterRecord {
            id,
            name,
            owner_id,
            game_system,
            data,
            created_at,
        });
    }
    Ok(Some(characters))
}

/// Insert or replace users by id.
pub fn upsert_users(conn: &Connection, users: &[UserRecord]) -> Result<usize> {
    let mut stmt = conn
        .prepare(
            "INSERT INTO users (id, username, email, password_hash, role, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 username = excluded.username,
                 email = excluded.email,
                 password_hash = excluded.password_hash,
                 role = excluded.role,
                 created_at = excluded.created_at",
        )
        .map_err(|e| Error::Database(format!("failed to prepare user import: {e}")))?;

    for user in users {
        stmt.execute(params![
            user.id,
            user.username,
            user.email,
            user.password_hash,
            user.role,
            user.created_at,
        ])
        .map_err(|e| Error::Database(format!("failed to import user {}: {e}", user.username)))?;
    }

    debug!("upserted {} user(s)", users.len());
    Ok(users.len())
}

/// Insert or replace characters by id. Owners must already exist.
pub fn upsert_characters(conn: &Connection, characters: &[CharacterRecord]) -> Result<usize> {
    let mut stmt = conn
        .prepare(
            "INSERT INTO characters (id, name, owner_id, game_system, data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 owner_id = excluded.owner_id,
                 game_system = excluded.game_system,
                 data = excluded.data,
                 created_at = excluded.created_at",
        )
        .map_err(|e| Error::Database(format!("failed to prepare character import: {e}")))?;

    for character in characters {
        let data = serde_json::to_string(&character.data)?;
        stmt.execute(params![
            character.id,
            character.name,
            character.owner_id,
            character.game_system,
            data,
            character.created_at,
        ])
        .map_err(|e| {
            Error::Database(format!("failed to import character {}: {e}", character.name))
        })?;
    }

    debug!("upserted {} character(s)", characters.len());
    Ok(characters.len())
}
