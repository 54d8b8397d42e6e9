//! Consent Gate
//!
//! Durable record of which users accepted the usage terms. A user id is
//! recorded at most once; agreeing again keeps the original timestamp.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::info;

use crate::db::{self, StoreError};

/// A stored agreement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentRecord {
    pub user_id: String,
    pub display_name: String,
    pub agreed_at: DateTime<Utc>,
}

pub struct ConsentGate {
    conn: Mutex<Connection>,
}

impl ConsentGate {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::with_connection(db::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS eula_agreements (
                user_id TEXT PRIMARY KEY,
                username TEXT NOT NULL,
                agreed_at INTEGER NOT NULL
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn has_agreed(&self, user_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT 1 FROM eula_agreements WHERE user_id = ?1",
                params![user_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Record an agreement. Returns `false` if the user had already agreed.
    pub fn record_agreement(&self, user_id: &str, display_name: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "INSERT OR IGNORE INTO eula_agreements (user_id, username, agreed_at) VALUES (?1, ?2, ?3)",
            params![user_id, display_name, Utc::now().timestamp_millis()],
        )?;

        if rows > 0 {
            info!("User {} ({}) accepted the terms", display_name, user_id);
        }
        Ok(rows > 0)
    }

    pub fn get(&self, user_id: &str) -> Result<Option<ConsentRecord>, StoreError> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT user_id, username, agreed_at FROM eula_agreements WHERE user_id = ?1",
                params![user_id],
                |row| {
                    let ms: i64 = row.get(2)?;
                    Ok(ConsentRecord {
                        user_id: row.get(0)?,
                        display_name: row.get(1)?,
                        agreed_at: DateTime::from_timestamp_millis(ms).unwrap_or_default(),
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}
