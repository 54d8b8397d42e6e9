//! Conversation Store
//!
//! Stores one transcript blob per (guild, channel).
//! Writes replace the whole blob, so a failed request never leaves half a
//! turn behind. Reads never fail for a missing key, and a blob that no
//! longer parses is treated as an empty transcript.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::db::{self, StoreError};
use crate::transcript::{ChannelKey, Transcript};

/// Conversation store with SQLite backend
pub struct ConversationStore {
    conn: Mutex<Connection>,
}

impl ConversationStore {
    /// Open or create conversation database
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let store = Self::with_connection(db::open(path)?)?;
        info!("Conversation store opened: {}", path.display());
        Ok(store)
    }

    /// Private in-memory database, mostly for tests
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                guild_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                conversation TEXT NOT NULL,
                PRIMARY KEY (guild_id, channel_id)
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Stored blob for a channel, byte for byte
    pub fn load_raw(&self, key: &ChannelKey) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock();
        let blob = conn
            .query_row(
                "SELECT conversation FROM conversations WHERE guild_id = ?1 AND channel_id = ?2",
                params![key.guild_id, key.channel_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(blob)
    }

    /// Transcript for a channel; empty when absent or unreadable
    pub fn load(&self, key: &ChannelKey) -> Result<Transcript, StoreError> {
        let Some(blob) = self.load_raw(key)? else {
            return Ok(Transcript::new());
        };

        match Transcript::from_json(&blob) {
            Ok(transcript) => Ok(transcript),
            Err(e) => {
                warn!("Discarding unreadable transcript for {}: {}", key, e);
                Ok(Transcript::new())
            }
        }
    }

    /// Upsert the whole transcript. Last write wins; there is no version check.
    pub fn replace(&self, key: &ChannelKey, transcript: &Transcript) -> Result<(), StoreError> {
        let blob = transcript.to_json()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO conversations (guild_id, channel_id, conversation)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (guild_id, channel_id) DO UPDATE SET conversation = excluded.conversation",
            params![key.guild_id, key.channel_id, blob],
        )?;

        debug!("Stored {} turns for {}", transcript.len(), key);
        Ok(())
    }

    /// Delete a channel's transcript. Returns whether one existed.
    pub fn clear(&self, key: &ChannelKey) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM conversations WHERE guild_id = ?1 AND channel_id = ?2",
            params![key.guild_id, key.channel_id],
        )?;
        info!("Cleared conversation {} ({} rows)", key, rows);
        Ok(rows > 0)
    }

    /// Get total stats
    pub fn stats(&self) -> Result<ConversationStats, StoreError> {
        let conn = self.conn.lock();
        let total_channels: i64 =
            conn.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?;
        let total_guilds: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT guild_id) FROM conversations",
            [],
            |row| row.get(0),
        )?;

        Ok(ConversationStats {
            total_channels: total_channels as usize,
            total_guilds: total_guilds as usize,
        })
    }

    /// Write a raw blob, bypassing serialization
    #[cfg(test)]
    pub(crate) fn put_raw(&self, key: &ChannelKey, blob: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO conversations (guild_id, channel_id, conversation) VALUES (?1, ?2, ?3)",
            params![key.guild_id, key.channel_id, blob],
        )?;
        Ok(())
    }
}

/// Global conversation statistics
#[derive(Debug, Clone)]
pub struct ConversationStats {
    pub total_channels: usize,
    pub total_guilds: usize,
}
