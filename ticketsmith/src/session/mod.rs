//! Session runner: one serialized state-machine instance per thread.
//!
//! Concurrency model: calls for the *same* thread queue on a per-thread
//! async mutex (held for the whole turn, nested model calls included);
//! calls for different threads proceed fully in parallel. The only state
//! shared across threads lives in the idempotency stores, which need no
//! locks at all.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::errors::TicketResult;
use crate::flow::{ConversationFlow, TurnOutcome};

pub mod checkpoint;

pub use checkpoint::{Checkpoint, CheckpointStore, InMemoryCheckpointStore, SqliteCheckpointStore};

/// Inbound message as delivered by the messaging collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: String,
    pub thread_id: String,
    pub sender_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl MessageEnvelope {
    pub fn new(
        thread_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("msg-{}", uuid::Uuid::new_v4()),
            thread_id: thread_id.into(),
            sender_id: sender_id.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Registry of per-thread locks. Shared between the session runner and the
/// commit orchestrator: every read-modify-write of a thread's checkpoint
/// (turn processing and the commit-time freeze alike) goes through the same
/// lock, so a turn can never overwrite a freeze that landed mid-flight.
#[derive(Clone, Default)]
pub struct ThreadLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ThreadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock handle for one thread, created on first use.
    pub fn for_thread(&self, thread_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Owns the state machine instances and their checkpoints.
pub struct SessionRunner {
    flow: ConversationFlow,
    checkpoints: Arc<dyn CheckpointStore>,
    locks: ThreadLocks,
}

impl SessionRunner {
    pub fn new(flow: ConversationFlow, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            flow,
            checkpoints,
            locks: ThreadLocks::new(),
        }
    }

    /// Handle to the lock registry, for collaborators that also write
    /// checkpoints (the commit orchestrator).
    pub fn thread_locks(&self) -> ThreadLocks {
        self.locks.clone()
    }

    fn thread_lock(&self, thread_id: &str) -> Arc<Mutex<()>> {
        self.locks.for_thread(thread_id)
    }

    /// Process one inbound message: lock the thread, load or initialise the
    /// session, drive the state machine to a terminal outcome, persist, and
    /// return the outcome. The checkpoint write is the commit point; a
    /// failed write surfaces as an error and leaves the previous snapshot.
    pub async fn handle_message(&self, message: MessageEnvelope) -> TicketResult<TurnOutcome> {
        let thread_id = message.thread_id.clone();
        let lock = self.thread_lock(&thread_id);
        let _guard = lock.lock().await;

        let mut session = self
            .checkpoints
            .load(&thread_id)
            .await?
            .unwrap_or_else(|| Checkpoint::new(thread_id.clone()));
        session.messages.push(message);

        let outcome = self.flow.run_turn(&mut session).await;

        session.last_outcome = Some(outcome.clone());
        session.updated_at = Utc::now();
        self.checkpoints.save(&session).await?;
        tracing::debug!(thread_id = %thread_id, step_count = session.step_count, "turn persisted");
        Ok(outcome)
    }

    /// Current content hash of a thread's draft, if the session exists.
    pub async fn current_content_hash(&self, thread_id: &str) -> TicketResult<Option<String>> {
        Ok(self
            .checkpoints
            .load(thread_id)
            .await?
            .map(|s| s.draft.content_hash()))
    }
}
