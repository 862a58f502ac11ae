//! Core entity tables created on a fresh install.

use std::fmt;
use std::str::FromStr;

use rollout_common::{Error, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Master-data categories, declared in import dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Sources,
    CharacterClasses,
    SkillCategories,
    SkillDifficulties,
    SpellSchools,
    Skills,
    WeaponSkills,
    Spells,
    Equipment,
    LearningCosts,
}

impl Category {
    pub const ALL: [Category; 10] = [
        Category::Sources,
        Category::CharacterClasses,
        Category::SkillCategories,
        Category::SkillDifficulties,
        Category::SpellSchools,
        Category::Skills,
        Category::WeaponSkills,
        Category::Spells,
        Category::Equipment,
        Category::LearningCosts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Sources => "sources",
            Category::CharacterClasses => "character_classes",
            Category::SkillCategories => "skill_categories",
            Category::SkillDifficulties => "skill_difficulties",
            Category::SpellSchools => "spell_schools",
            Category::Skills => "skills",
            Category::WeaponSkills => "weapon_skills",
            Category::Spells => "spells",
            Category::Equipment => "equipment",
            Category::LearningCosts => "learning_costs",
        }
    }

    /// Human readable name used in progress logs.
    pub fn label(&self) -> &'static str {
        match self {
            Category::Sources => "Sources",
            Category::CharacterClasses => "Character Classes",
            Category::SkillCategories => "Skill Categories",
            Category::SkillDifficulties => "Skill Difficulties",
            Category::SpellSchools => "Spell Schools",
            Category::Skills => "Skills",
            Category::WeaponSkills => "Weapon Skills",
            Category::Spells => "Spells",
            Category::Equipment => "Equipment",
            Category::LearningCosts => "Learning Costs",
        }
    }

    pub fn table(&self) -> String {
        format!("gsm_{}", self.as_str())
    }

    /// Source file for this category inside a master-data directory.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.as_str())
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| Error::NotFound(format!("master data category {s}")))
    }
}

/// Creates the entity schema of a brand-new database.
pub trait SchemaBuilder: Send + Sync {
    /// Tables that must exist once `create_schema` has run.
    fn required_tables(&self) -> Vec<String>;

    /// Create every table, returning their names. Must be safe to run on a
    /// database that already has some of them.
    fn create_schema(&self, conn: &Connection) -> Result<Vec<String>>;
}

/// Accounts, characters and one table per master-data category.
#[derive(Debug, Default, Clone, Copy)]
pub struct CoreSchema;

const USERS_DDL: &str = "CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    email TEXT NOT NULL,
    password_hash TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'user',
    created_at TEXT NOT NULL
)";

const CHARACTERS_DDL: &str = "CREATE TABLE IF NOT EXISTS characters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    owner_id INTEGER REFERENCES users(id) ON DELETE CASCADE,
    game_system TEXT NOT NULL,
    data TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
)";

fn master_data_ddl(category: Category) -> String {
    let table = category.table();
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            game_system TEXT NOT NULL,
            fields TEXT NOT NULL DEFAULT '{{}}',
            updated_at TEXT NOT NULL,
            UNIQUE(name, game_system)
        )"
    )
}

impl SchemaBuilder for CoreSchema {
    fn required_tables(&self) -> Vec<String> {
        let mut tables = vec!["users".to_string(), "characters".to_string()];
        tables.extend(Category::ALL.iter().map(Category::table));
        tables
    }

    fn create_schema(&self, conn: &Connection) -> Result<Vec<String>> {
        let mut statements = vec![USERS_DDL.to_string(), CHARACTERS_DDL.to_string()];
        statements.extend(Category::ALL.into_iter().map(master_data_ddl));

        for sql in &statements {
            conn.execute_batch(sql)
                .map_err(|e| Error::Database(format!("failed to create schema: {sql} - error: {e}")))?;
        }

        let tables = self.required_tables();
        debug!("created {} core tables", tables.len());
        Ok(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    #[test]
    fn categories_follow_dependency_order() {
        assert_eq!(Category::ALL.first(), Some(&Category::Sources));
        assert_eq!(Category::ALL.last(), Some(&Category::LearningCosts));
        let skills = Category::ALL.iter().position(|c| *c == Category::Skills);
        let weapon = Category::ALL.iter().position(|c| *c == Category::WeaponSkills);
        assert!(skills < weapon);
        let mut sorted = Category::ALL;
        sorted.sort();
        assert_eq!(sorted, Category::ALL);
    }

    #[test]
    fn category_names_round_trip() {
        for category in Category::ALL {
            assert_eq!(category.as_str().parse::<Category>().unwrap(), category);
        }
        assert!("potions".parse::<Category>().is_err());
        assert_eq!(Category::WeaponSkills.table(), "gsm_weapon_skills");
        assert_eq!(Category::Spells.file_name(), "spells.json");
    }

    #[test]
    fn core_schema_creates_every_required_table() {
        let db = Database::in_memory().unwrap();
        let created = CoreSchema.create_schema(&db.connection().unwrap()).unwrap();

        assert_eq!(created.len(), 12);
        for table in CoreSchema.required_tables() {
            assert!(db.table_exists(&table).unwrap(), "{table} missing");
        }
    }

    #[test]
    fn core_schema_is_rerunnable() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection().unwrap();
        CoreSchema.create_schema(&conn).unwrap();
        CoreSchema.create_schema(&conn).unwrap();
    }
}
