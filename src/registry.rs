//! Model Default Registry
//!
//! Per-guild default model names. Two interchangeable variants: a volatile
//! in-memory map and a SQLite table that survives restarts.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use crate::db::{self, StoreError};

/// Guild id to default model name
pub trait ModelRegistry: Send + Sync {
    fn get(&self, guild_id: &str) -> Result<Option<String>, StoreError>;

    /// Set or overwrite the default for a guild
    fn set(&self, guild_id: &str, model: &str) -> Result<(), StoreError>;
}

/// Which registry variant to run with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistryKind {
    Memory,
    #[default]
    Sqlite,
}

impl FromStr for RegistryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown model registry '{}'", other)),
        }
    }
}

/// Lost on restart
#[derive(Default)]
pub struct InMemoryModelRegistry {
    models: RwLock<HashMap<String, String>>,
}

impl InMemoryModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ModelRegistry for InMemoryModelRegistry {
    fn get(&self, guild_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.models.read().get(guild_id).cloned())
    }

    fn set(&self, guild_id: &str, model: &str) -> Result<(), StoreError> {
        self.models
            .write()
            .insert(guild_id.to_string(), model.to_string());
        Ok(())
    }
}

/// Persistent registry stored next to the conversations
pub struct SqliteModelRegistry {
    conn: Mutex<Connection>,
}

impl SqliteModelRegistry {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::with_connection(db::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS guild_models (
                guild_id TEXT PRIMARY KEY,
                model TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl ModelRegistry for SqliteModelRegistry {
    fn get(&self, guild_id: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock();
        let model = conn
            .query_row(
                "SELECT model FROM guild_models WHERE guild_id = ?1",
                params![guild_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(model)
    }

    fn set(&self, guild_id: &str, model: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO guild_models (guild_id, model, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (guild_id) DO UPDATE SET model = excluded.model, updated_at = excluded.updated_at",
            params![guild_id, model, Utc::now().timestamp_millis()],
        )?;
        info!("Default model for guild {} set to {}", guild_id, model);
        Ok(())
    }
}

/// Open the registry variant selected by configuration
pub fn open_registry(kind: RegistryKind, path: &Path) -> Result<Box<dyn ModelRegistry>, StoreError> {
    Ok(match kind {
        RegistryKind::Memory => Box::new(InMemoryModelRegistry::new()),
        RegistryKind::Sqlite => Box::new(SqliteModelRegistry::open(path)?),
    })
}
