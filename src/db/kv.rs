use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::db::Database;
use crate::models::{HeartbeatState, PendingAction};
use crate::ports::{HeartbeatStateStorage, PendingActionStorage};

const PENDING_ACTION_KEY: &str = "pending_action";
const HEARTBEAT_STATE_KEY: &str = "heartbeat_state";

impl Database {
    async fn kv_get(&self, key: &'static str) -> Result<Option<String>> {
        self.execute(move |conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM kv_state WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn kv_set(&self, key: &'static str, value: String) -> Result<()> {
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO kv_state (key, value, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
                params![key, value, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    async fn kv_delete(&self, key: &'static str) -> Result<()> {
        self.execute(move |conn| {
            conn.execute("DELETE FROM kv_state WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl PendingActionStorage for Database {
    async fn save(&self, action: &PendingAction) -> Result<()> {
        let json = serde_json::to_string(action).context("failed to serialize pending action")?;
        self.kv_set(PENDING_ACTION_KEY, json).await
    }

    async fn load(&self) -> Result<Option<PendingAction>> {
        match self.kv_get(PENDING_ACTION_KEY).await? {
            Some(json) => serde_json::from_str(&json)
                .context("failed to deserialize pending action")
                .map(Some),
            None => Ok(None),
        }
    }

    async fn clear(&self) -> Result<()> {
        self.kv_delete(PENDING_ACTION_KEY).await
    }
}

#[async_trait]
impl HeartbeatStateStorage for Database {
    async fn save(&self, state: &HeartbeatState) -> Result<()> {
        let json = serde_json::to_string(state).context("failed to serialize heartbeat state")?;
        self.kv_set(HEARTBEAT_STATE_KEY, json).await
    }

    async fn load(&self) -> Result<Option<HeartbeatState>> {
        match self.kv_get(HEARTBEAT_STATE_KEY).await? {
            Some(json) => serde_json::from_str(&json)
                .context("failed to deserialize heartbeat state")
                .map(Some),
            None => Ok(None),
        }
    }
}
