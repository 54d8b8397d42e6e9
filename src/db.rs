//! SQLite plumbing shared by the stores

use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

/// Errors from the durable stores
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Open (or create) a database file, creating parent directories as needed.
///
/// Several stores may open the same file; the busy timeout lets their
/// writes queue instead of failing with SQLITE_BUSY.
pub fn open(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}
