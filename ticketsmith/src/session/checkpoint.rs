//! Persisted per-thread session state.
//!
//! One checkpoint row per conversation thread, overwritten after every
//! successful state-machine step. Reloading it is what makes multi-turn
//! extraction survive process restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use super::MessageEnvelope;
use crate::draft::TicketDraft;
use crate::errors::{TicketError, TicketResult};
use crate::flow::{PendingQuestion, TurnOutcome};

/// Snapshot of one conversation thread's session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    pub messages: Vec<MessageEnvelope>,
    pub draft: TicketDraft,
    pub step_count: u32,
    pub pending_questions: Vec<PendingQuestion>,
    pub last_outcome: Option<TurnOutcome>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            messages: Vec::new(),
            draft: TicketDraft::new(),
            step_count: 0,
            pending_questions: Vec::new(),
            last_outcome: None,
            updated_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist the checkpoint, replacing any previous snapshot for the
    /// thread. All-or-nothing: a failed save leaves the prior snapshot.
    async fn save(&self, checkpoint: &Checkpoint) -> TicketResult<()>;

    async fn load(&self, thread_id: &str) -> TicketResult<Option<Checkpoint>>;
}

pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            checkpoints: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> TicketResult<()> {
        let mut checkpoints = self
            .checkpoints
            .write()
            .map_err(|_| TicketError::Storage("checkpoint lock poisoned".to_string()))?;
        checkpoints.insert(checkpoint.thread_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> TicketResult<Option<Checkpoint>> {
        let checkpoints = self
            .checkpoints
            .read()
            .map_err(|_| TicketError::Storage("checkpoint lock poisoned".to_string()))?;
        Ok(checkpoints.get(thread_id).cloned())
    }
}

pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<Connection>>,
    #[allow(dead_code)]
    db_path: PathBuf,
}

impl SqliteCheckpointStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> TicketResult<Self> {
        let db_path = path.into();
        let conn = Connection::open(&db_path)?;
        conn.execute_batch(
            "BEGIN;CREATE TABLE IF NOT EXISTS checkpoints(
                thread_id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );COMMIT;",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
        })
    }

    fn lock_conn(&self) -> TicketResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| TicketError::Storage("connection lock poisoned".to_string()))
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> TicketResult<()> {
        let payload = serde_json::to_string(checkpoint)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO checkpoints(thread_id, payload, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(thread_id) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at",
            params![
                checkpoint.thread_id,
                payload,
                checkpoint.updated_at.timestamp()
            ],
        )?;
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> TicketResult<Option<Checkpoint>> {
        let conn = self.lock_conn()?;
        let payload: Option<String> = conn
            .prepare("SELECT payload FROM checkpoints WHERE thread_id = ?1")?
            .query_row(params![thread_id], |row| row.get(0))
            .optional()?;
        match payload {
            Some(p) => Ok(Some(serde_json::from_str(&p)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::DraftPatch;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn sqlite_roundtrip_overwrites_per_thread() {
        let tmp = NamedTempFile::new().unwrap();
        let store = SqliteCheckpointStore::new(tmp.path().to_path_buf()).unwrap();

        let mut checkpoint = Checkpoint::new("thread-1");
        checkpoint
            .draft
            .apply(&[DraftPatch::Title("T".to_string())], "m1")
            .unwrap();
        store.save(&checkpoint).await.unwrap();

        checkpoint.step_count = 3;
        store.save(&checkpoint).await.unwrap();

        let loaded = store.load("thread-1").await.unwrap().unwrap();
        assert_eq!(loaded.step_count, 3);
        assert_eq!(loaded.draft.title, "T");
        assert!(store.load("thread-2").await.unwrap().is_none());
    }
}
