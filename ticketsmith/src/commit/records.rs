//! Idempotency stores: approval records and commit-operation records.
//!
//! Both tables arbitrate concurrent writers through a uniqueness constraint
//! alone: "first wins". Any number of processes may race to insert; the
//! loser observes the existing record and must not re-invoke the external
//! API. No application-level locking is involved.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::errors::{TicketError, TicketResult};

/// Operation kind for the external tracker create call.
pub const OP_TRACKER_CREATE: &str = "tracker_create";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

/// One row per (session, content hash): who approved which exact draft.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub session_id: String,
    pub content_hash: String,
    pub approver_id: String,
    pub decision: ApprovalDecision,
    pub recorded_at: DateTime<Utc>,
}

impl ApprovalRecord {
    pub fn approved(session_id: &str, content_hash: &str, approver_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            content_hash: content_hash.to_string(),
            approver_id: approver_id.to_string(),
            decision: ApprovalDecision::Approved,
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Success { external_key: String },
    Failed { detail: String },
}

/// One row per (session, content hash, operation kind). Exactly one record
/// transitions to success per key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitOperationRecord {
    pub session_id: String,
    pub content_hash: String,
    pub operation: String,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of an approval insert.
#[derive(Debug, Clone)]
pub enum ApprovalInsert {
    Inserted,
    /// The uniqueness constraint rejected the insert; here is who won.
    Existing(ApprovalRecord),
}

/// Outcome of a commit-operation claim.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// This caller won the claim and is the only one allowed to invoke the
    /// external API for this key.
    Claimed,
    Existing(CommitOperationRecord),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert_approval(&self, record: ApprovalRecord) -> TicketResult<ApprovalInsert>;

    async fn get_approval(
        &self,
        session_id: &str,
        content_hash: &str,
    ) -> TicketResult<Option<ApprovalRecord>>;

    /// First-wins insert of a pending operation record.
    async fn claim_operation(
        &self,
        session_id: &str,
        content_hash: &str,
        operation: &str,
    ) -> TicketResult<ClaimOutcome>;

    async fn complete_operation(
        &self,
        session_id: &str,
        content_hash: &str,
        operation: &str,
        external_key: &str,
    ) -> TicketResult<()>;

    async fn fail_operation(
        &self,
        session_id: &str,
        content_hash: &str,
        operation: &str,
        detail: &str,
    ) -> TicketResult<()>;

    async fn get_operation(
        &self,
        session_id: &str,
        content_hash: &str,
        operation: &str,
    ) -> TicketResult<Option<CommitOperationRecord>>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

type ApprovalKey = (String, String);
type OperationKey = (String, String, String);

/// In-memory twin for tests and ephemeral runs. A single mutexed map per
/// table gives the same first-wins behavior the SQL constraints provide.
pub struct InMemoryRecordStore {
    approvals: Mutex<HashMap<ApprovalKey, ApprovalRecord>>,
    operations: Mutex<HashMap<OperationKey, CommitOperationRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self {
            approvals: Mutex::new(HashMap::new()),
            operations: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> TicketError {
    TicketError::Storage("record store lock poisoned".to_string())
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn insert_approval(&self, record: ApprovalRecord) -> TicketResult<ApprovalInsert> {
        let mut approvals = self.approvals.lock().map_err(|_| poisoned())?;
        let key = (record.session_id.clone(), record.content_hash.clone());
        match approvals.get(&key) {
            Some(existing) => Ok(ApprovalInsert::Existing(existing.clone())),
            None => {
                approvals.insert(key, record);
                Ok(ApprovalInsert::Inserted)
            }
        }
    }

    async fn get_approval(
        &self,
        session_id: &str,
        content_hash: &str,
    ) -> TicketResult<Option<ApprovalRecord>> {
        let approvals = self.approvals.lock().map_err(|_| poisoned())?;
        Ok(approvals
            .get(&(session_id.to_string(), content_hash.to_string()))
            .cloned())
    }

    async fn claim_operation(
        &self,
        session_id: &str,
        content_hash: &str,
        operation: &str,
    ) -> TicketResult<ClaimOutcome> {
        let mut operations = self.operations.lock().map_err(|_| poisoned())?;
        let key = (
            session_id.to_string(),
            content_hash.to_string(),
            operation.to_string(),
        );
        match operations.get(&key) {
            Some(existing) => Ok(ClaimOutcome::Existing(existing.clone())),
            None => {
                let now = Utc::now();
                operations.insert(
                    key,
                    CommitOperationRecord {
                        session_id: session_id.to_string(),
                        content_hash: content_hash.to_string(),
                        operation: operation.to_string(),
                        status: OperationStatus::Pending,
                        created_at: now,
                        updated_at: now,
                    },
                );
                Ok(ClaimOutcome::Claimed)
            }
        }
    }

    async fn complete_operation(
        &self,
        session_id: &str,
        content_hash: &str,
        operation: &str,
        external_key: &str,
    ) -> TicketResult<()> {
        let mut operations = self.operations.lock().map_err(|_| poisoned())?;
        let key = (
            session_id.to_string(),
            content_hash.to_string(),
            operation.to_string(),
        );
        if let Some(record) = operations.get_mut(&key) {
            record.status = OperationStatus::Success {
                external_key: external_key.to_string(),
            };
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn fail_operation(
        &self,
        session_id: &str,
        content_hash: &str,
        operation: &str,
        detail: &str,
    ) -> TicketResult<()> {
        let mut operations = self.operations.lock().map_err(|_| poisoned())?;
        let key = (
            session_id.to_string(),
            content_hash.to_string(),
            operation.to_string(),
        );
        if let Some(record) = operations.get_mut(&key) {
            record.status = OperationStatus::Failed {
                detail: detail.to_string(),
            };
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get_operation(
        &self,
        session_id: &str,
        content_hash: &str,
        operation: &str,
    ) -> TicketResult<Option<CommitOperationRecord>> {
        let operations = self.operations.lock().map_err(|_| poisoned())?;
        Ok(operations
            .get(&(
                session_id.to_string(),
                content_hash.to_string(),
                operation.to_string(),
            ))
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// Sqlite store
// ---------------------------------------------------------------------------

/// Durable store. First-wins arbitration is the composite primary key plus
/// `INSERT OR IGNORE`: the insert that changes zero rows lost the race.
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
    #[allow(dead_code)]
    db_path: PathBuf,
}

impl SqliteRecordStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> TicketResult<Self> {
        let db_path = path.into();
        let conn = Connection::open(&db_path)?;
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS approvals(
                session_id TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                approver_id TEXT NOT NULL,
                decision TEXT NOT NULL,
                recorded_at INTEGER NOT NULL,
                PRIMARY KEY (session_id, content_hash)
            );
            CREATE TABLE IF NOT EXISTS commit_operations(
                session_id TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                operation TEXT NOT NULL,
                status TEXT NOT NULL,
                external_key TEXT,
                error_detail TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (session_id, content_hash, operation)
            );
            COMMIT;",
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

    fn row_to_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<CommitOperationRecord> {
        let status_text: String = row.get(3)?;
        let external_key: Option<String> = row.get(4)?;
        let error_detail: Option<String> = row.get(5)?;
        let status = match status_text.as_str() {
            "success" => OperationStatus::Success {
                external_key: external_key.unwrap_or_default(),
            },
            "failed" => OperationStatus::Failed {
                detail: error_detail.unwrap_or_default(),
            },
            _ => OperationStatus::Pending,
        };
        Ok(CommitOperationRecord {
            session_id: row.get(0)?,
            content_hash: row.get(1)?,
            operation: row.get(2)?,
            status,
            created_at: timestamp_to_datetime(row.get(6)?),
            updated_at: timestamp_to_datetime(row.get(7)?),
        })
    }
}

fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_else(Utc::now)
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn insert_approval(&self, record: ApprovalRecord) -> TicketResult<ApprovalInsert> {
        let conn = self.lock_conn()?;
        let decision = match record.decision {
            ApprovalDecision::Approved => "approved",
            ApprovalDecision::Rejected => "rejected",
        };
        let changed = conn.execute(
            "INSERT OR IGNORE INTO approvals(session_id, content_hash, approver_id, decision, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.session_id,
                record.content_hash,
                record.approver_id,
                decision,
                record.recorded_at.timestamp()
            ],
        )?;
        if changed > 0 {
            return Ok(ApprovalInsert::Inserted);
        }
        // Lost the race: report the winner.
        let existing = conn
            .prepare(
                "SELECT approver_id, decision, recorded_at FROM approvals
                 WHERE session_id = ?1 AND content_hash = ?2",
            )?
            .query_row(params![record.session_id, record.content_hash], |row| {
                let decision: String = row.get(1)?;
                Ok(ApprovalRecord {
                    session_id: record.session_id.clone(),
                    content_hash: record.content_hash.clone(),
                    approver_id: row.get(0)?,
                    decision: if decision == "rejected" {
                        ApprovalDecision::Rejected
                    } else {
                        ApprovalDecision::Approved
                    },
                    recorded_at: timestamp_to_datetime(row.get(2)?),
                })
            })?;
        Ok(ApprovalInsert::Existing(existing))
    }

    async fn get_approval(
        &self,
        session_id: &str,
        content_hash: &str,
    ) -> TicketResult<Option<ApprovalRecord>> {
        let conn = self.lock_conn()?;
        let record = conn
            .prepare(
                "SELECT approver_id, decision, recorded_at FROM approvals
                 WHERE session_id = ?1 AND content_hash = ?2",
            )?
            .query_row(params![session_id, content_hash], |row| {
                let decision: String = row.get(1)?;
                Ok(ApprovalRecord {
                    session_id: session_id.to_string(),
                    content_hash: content_hash.to_string(),
                    approver_id: row.get(0)?,
                    decision: if decision == "rejected" {
                        ApprovalDecision::Rejected
                    } else {
                        ApprovalDecision::Approved
                    },
                    recorded_at: timestamp_to_datetime(row.get(2)?),
                })
            })
            .optional()?;
        Ok(record)
    }

    async fn claim_operation(
        &self,
        session_id: &str,
        content_hash: &str,
        operation: &str,
    ) -> TicketResult<ClaimOutcome> {
        let now = Utc::now().timestamp();
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO commit_operations
                (session_id, content_hash, operation, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?4)",
            params![session_id, content_hash, operation, now],
        )?;
        if changed > 0 {
            return Ok(ClaimOutcome::Claimed);
        }
        let existing = conn
            .prepare(
                "SELECT session_id, content_hash, operation, status, external_key, error_detail,
                        created_at, updated_at
                 FROM commit_operations
                 WHERE session_id = ?1 AND content_hash = ?2 AND operation = ?3",
            )?
            .query_row(params![session_id, content_hash, operation], Self::row_to_operation)?;
        Ok(ClaimOutcome::Existing(existing))
    }

    async fn complete_operation(
        &self,
        session_id: &str,
        content_hash: &str,
        operation: &str,
        external_key: &str,
    ) -> TicketResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE commit_operations
             SET status = 'success', external_key = ?4, updated_at = ?5
             WHERE session_id = ?1 AND content_hash = ?2 AND operation = ?3",
            params![
                session_id,
                content_hash,
                operation,
                external_key,
                Utc::now().timestamp()
            ],
        )?;
        Ok(())
    }

    async fn fail_operation(
        &self,
        session_id: &str,
        content_hash: &str,
        operation: &str,
        detail: &str,
    ) -> TicketResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE commit_operations
             SET status = 'failed', error_detail = ?4, updated_at = ?5
             WHERE session_id = ?1 AND content_hash = ?2 AND operation = ?3",
            params![
                session_id,
                content_hash,
                operation,
                detail,
                Utc::now().timestamp()
            ],
        )?;
        Ok(())
    }

    async fn get_operation(
        &self,
        session_id: &str,
        content_hash: &str,
        operation: &str,
    ) -> TicketResult<Option<CommitOperationRecord>> {
        let conn = self.lock_conn()?;
        let record = conn
            .prepare(
                "SELECT session_id, content_hash, operation, status, external_key, error_detail,
                        created_at, updated_at
                 FROM commit_operations
                 WHERE session_id = ?1 AND content_hash = ?2 AND operation = ?3",
            )?
            .query_row(params![session_id, content_hash, operation], Self::row_to_operation)
            .optional()?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    async fn first_wins_suite(store: &dyn RecordStore) {
        // Approval: first insert wins, second observes the winner.
        let first = ApprovalRecord::approved("s1", "h1", "alice");
        assert!(matches!(
            store.insert_approval(first).await.unwrap(),
            ApprovalInsert::Inserted
        ));
        let second = ApprovalRecord::approved("s1", "h1", "bob");
        match store.insert_approval(second).await.unwrap() {
            ApprovalInsert::Existing(existing) => assert_eq!(existing.approver_id, "alice"),
            ApprovalInsert::Inserted => panic!("duplicate approval insert should lose"),
        }
        // A different hash is a different key.
        assert!(matches!(
            store
                .insert_approval(ApprovalRecord::approved("s1", "h2", "bob"))
                .await
                .unwrap(),
            ApprovalInsert::Inserted
        ));

        // Operation: exactly one claim.
        assert!(matches!(
            store.claim_operation("s1", "h1", OP_TRACKER_CREATE).await.unwrap(),
            ClaimOutcome::Claimed
        ));
        match store.claim_operation("s1", "h1", OP_TRACKER_CREATE).await.unwrap() {
            ClaimOutcome::Existing(record) => {
                assert_eq!(record.status, OperationStatus::Pending)
            }
            ClaimOutcome::Claimed => panic!("second claim should lose"),
        }

        // pending -> success transition is visible to later claimers.
        store
            .complete_operation("s1", "h1", OP_TRACKER_CREATE, "PROJ-7")
            .await
            .unwrap();
        match store.claim_operation("s1", "h1", OP_TRACKER_CREATE).await.unwrap() {
            ClaimOutcome::Existing(record) => assert_eq!(
                record.status,
                OperationStatus::Success {
                    external_key: "PROJ-7".to_string()
                }
            ),
            ClaimOutcome::Claimed => panic!("claim after success should lose"),
        }

        // Failure path on a separate key.
        assert!(matches!(
            store.claim_operation("s1", "h2", OP_TRACKER_CREATE).await.unwrap(),
            ClaimOutcome::Claimed
        ));
        store
            .fail_operation("s1", "h2", OP_TRACKER_CREATE, "project missing")
            .await
            .unwrap();
        let failed = store
            .get_operation("s1", "h2", OP_TRACKER_CREATE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            failed.status,
            OperationStatus::Failed {
                detail: "project missing".to_string()
            }
        );
    }

    #[tokio::test]
    async fn memory_store_first_wins() {
        let store = InMemoryRecordStore::new();
        first_wins_suite(&store).await;
    }

    #[tokio::test]
    async fn sqlite_store_first_wins() {
        let tmp = NamedTempFile::new().unwrap();
        let store = SqliteRecordStore::new(tmp.path().to_path_buf()).unwrap();
        first_wins_suite(&store).await;
    }
}
