//! Named JSON snapshots of hub state.

use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::StoreError;

pub const USERS: &str = "users";
pub const MESSAGE_LOG: &str = "message_log";
pub const HISTORY: &str = "history";
pub const ROOMS: &str = "rooms";
pub const BANDWIDTH: &str = "bandwidth";

/// One blob waiting to be written.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub name: &'static str,
    pub body: String,
}

impl SnapshotEntry {
    pub fn encode<T: Serialize>(name: &'static str, value: &T) -> Result<Self, StoreError> {
        Ok(Self {
            name,
            body: serde_json::to_string(value)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    pool: SqlitePool,
}

impl SnapshotStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Replace every named blob in one transaction.
    pub async fn save_all(&self, sequence: i64, entries: &[SnapshotEntry]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(
                "INSERT INTO snapshots (name, body, sequence, saved_at) \
                 VALUES (?, ?, ?, datetime('now')) \
                 ON CONFLICT(name) DO UPDATE SET \
                 body = excluded.body, sequence = excluded.sequence, saved_at = excluded.saved_at",
            )
            .bind(entry.name)
            .bind(&entry.body)
            .bind(sequence)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(sequence, blobs = entries.len(), "snapshots written");
        Ok(())
    }

    /// `Ok(None)` when nothing was ever saved under `name`.
    pub async fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StoreError> {
        let body: Option<String> = sqlx::query_scalar("SELECT body FROM snapshots WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    pub async fn last_sequence(&self) -> Result<i64, StoreError> {
        let seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(sequence), 0) FROM snapshots")
            .fetch_one(&self.pool)
            .await?;
        Ok(seq)
    }
}
