//! Idempotent two-phase commit: approval record, then external create.
//!
//! Ordering is the whole design: approval before claim, claim before
//! external call. The two uniqueness constraints provide "first wins"
//! under at-least-once delivery and double-clicks, with no distributed
//! lock anywhere.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{RetryConfig, TrackerConfig};
use crate::errors::{TicketError, TicketResult};
use crate::session::{Checkpoint, CheckpointStore, ThreadLocks};

use super::records::{
    ApprovalInsert, ApprovalRecord, ClaimOutcome, CommitOperationRecord, OperationStatus,
    RecordStore, OP_TRACKER_CREATE,
};
use super::tracker::{with_retry, IssueCreateRequest, IssueTracker};

/// Outcome of an approval request. Duplicates and prior failures are
/// informational conditions, not errors.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Committed { external_key: String },
    AlreadyApproved { approver_id: String },
    /// The submitted hash no longer matches the draft: re-render the
    /// preview and request approval again.
    StalePreview,
    InProgress,
    PreviousFailure { detail: String },
}

/// How long a duplicate caller waits for a pending claim to resolve before
/// reporting `InProgress`. Near-simultaneous approvals converge on the same
/// external key inside this window.
const POLL_ATTEMPTS: u32 = 20;
const POLL_INTERVAL_MS: u64 = 25;

pub struct CommitOrchestrator {
    records: Arc<dyn RecordStore>,
    tracker: Arc<dyn IssueTracker>,
    checkpoints: Arc<dyn CheckpointStore>,
    locks: ThreadLocks,
    tracker_config: TrackerConfig,
    retry: RetryConfig,
}

impl CommitOrchestrator {
    /// `locks` must be the same registry the session runner uses
    /// ([`crate::session::SessionRunner::thread_locks`]), so commits and
    /// turns for one thread serialize on one lock.
    pub fn new(
        records: Arc<dyn RecordStore>,
        tracker: Arc<dyn IssueTracker>,
        checkpoints: Arc<dyn CheckpointStore>,
        locks: ThreadLocks,
        tracker_config: TrackerConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            records,
            tracker,
            checkpoints,
            locks,
            tracker_config,
            retry,
        }
    }

    /// Validate the approval against the idempotency stores, invoke the
    /// external tracker at most effectively once, and record the outcome.
    ///
    /// Holds the thread's lock for the whole sequence: an in-flight turn
    /// finishes (and persists) before the commit reads the draft, and the
    /// freeze is persisted before the next turn can load the checkpoint.
    pub async fn approve_and_commit(
        &self,
        session_id: &str,
        submitted_hash: &str,
        approver_id: &str,
    ) -> TicketResult<ApprovalOutcome> {
        let lock = self.locks.for_thread(session_id);
        let _guard = lock.lock().await;

        let mut session = self
            .checkpoints
            .load(session_id)
            .await?
            .ok_or_else(|| TicketError::UnknownSession(session_id.to_string()))?;

        // Step 1: durably record the approval. The uniqueness constraint
        // resolves concurrent duplicates deterministically.
        let insert = self
            .records
            .insert_approval(ApprovalRecord::approved(
                session_id,
                submitted_hash,
                approver_id,
            ))
            .await?;

        // Step 2: never commit a draft the approver did not see.
        if session.draft.content_hash() != submitted_hash {
            log::info!(
                "stale approval for session {}: submitted {} != current draft",
                session_id,
                submitted_hash
            );
            return Ok(ApprovalOutcome::StalePreview);
        }

        // Step 3: claim the external operation.
        match insert {
            ApprovalInsert::Inserted => {
                match self
                    .records
                    .claim_operation(session_id, submitted_hash, OP_TRACKER_CREATE)
                    .await?
                {
                    ClaimOutcome::Claimed => {
                        // Step 4: only the claim winner talks to the tracker.
                        self.perform_commit(&mut session, session_id, submitted_hash)
                            .await
                    }
                    ClaimOutcome::Existing(record) => {
                        self.resolve_existing(session_id, submitted_hash, record)
                            .await
                    }
                }
            }
            ApprovalInsert::Existing(existing) => {
                match self
                    .records
                    .get_operation(session_id, submitted_hash, OP_TRACKER_CREATE)
                    .await?
                {
                    Some(record) => {
                        self.resolve_existing(session_id, submitted_hash, record)
                            .await
                    }
                    None => {
                        // Approved, but the winner has not claimed yet (or
                        // died before claiming). Give the claim a moment to
                        // appear, then report who already approved.
                        match self.poll_operation(session_id, submitted_hash).await? {
                            Some(record) => {
                                self.resolve_existing(session_id, submitted_hash, record)
                                    .await
                            }
                            None => Ok(ApprovalOutcome::AlreadyApproved {
                                approver_id: existing.approver_id,
                            }),
                        }
                    }
                }
            }
        }
    }

    /// Map an existing operation record to an outcome without touching the
    /// external API.
    async fn resolve_existing(
        &self,
        session_id: &str,
        content_hash: &str,
        record: CommitOperationRecord,
    ) -> TicketResult<ApprovalOutcome> {
        match record.status {
            OperationStatus::Success { external_key } => {
                // Idempotent replay: same key for every caller.
                Ok(ApprovalOutcome::Committed { external_key })
            }
            OperationStatus::Failed { detail } => {
                Ok(ApprovalOutcome::PreviousFailure { detail })
            }
            OperationStatus::Pending => {
                match self.poll_operation(session_id, content_hash).await? {
                    Some(CommitOperationRecord {
                        status: OperationStatus::Success { external_key },
                        ..
                    }) => Ok(ApprovalOutcome::Committed { external_key }),
                    Some(CommitOperationRecord {
                        status: OperationStatus::Failed { detail },
                        ..
                    }) => Ok(ApprovalOutcome::PreviousFailure { detail }),
                    _ => Ok(ApprovalOutcome::InProgress),
                }
            }
        }
    }

    /// Bounded wait for the operation record to leave `pending`.
    async fn poll_operation(
        &self,
        session_id: &str,
        content_hash: &str,
    ) -> TicketResult<Option<CommitOperationRecord>> {
        let mut last = None;
        for _ in 0..POLL_ATTEMPTS {
            let record = self
                .records
                .get_operation(session_id, content_hash, OP_TRACKER_CREATE)
                .await?;
            match &record {
                Some(r) if r.status != OperationStatus::Pending => return Ok(record),
                _ => last = record,
            }
            tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        }
        Ok(last)
    }

    async fn perform_commit(
        &self,
        session: &mut Checkpoint,
        session_id: &str,
        content_hash: &str,
    ) -> TicketResult<ApprovalOutcome> {
        let request = IssueCreateRequest::from_draft(&session.draft, &self.tracker_config);
        let result = with_retry(&self.retry, OP_TRACKER_CREATE, || {
            self.tracker.create_issue(&request)
        })
        .await;

        match result {
            Ok(external_key) => {
                self.records
                    .complete_operation(session_id, content_hash, OP_TRACKER_CREATE, &external_key)
                    .await?;
                session.draft.freeze();
                session.updated_at = chrono::Utc::now();
                if let Err(e) = self.checkpoints.save(session).await {
                    // The operation record stays authoritative: a repeated
                    // approval replays the same key even if this write is
                    // lost.
                    log::warn!("failed to persist frozen draft: {}", e);
                }
                log::info!(
                    "committed session {} as {} (hash {})",
                    session_id,
                    external_key,
                    content_hash
                );
                Ok(ApprovalOutcome::Committed { external_key })
            }
            Err(e) => {
                let detail = e.to_string();
                self.records
                    .fail_operation(session_id, content_hash, OP_TRACKER_CREATE, &detail)
                    .await?;
                log::warn!("commit failed for session {}: {}", session_id, detail);
                // The draft stays editable; a fresh approval is required
                // before another attempt.
                Ok(ApprovalOutcome::PreviousFailure { detail })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::records::InMemoryRecordStore;
    use crate::commit::tracker::RecordingTracker;
    use crate::draft::DraftPatch;
    use crate::session::InMemoryCheckpointStore;

    async fn seeded_checkpoints() -> (Arc<InMemoryCheckpointStore>, String) {
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let mut session = Checkpoint::new("s1");
        session
            .draft
            .apply(
                &[
                    DraftPatch::Title("Slow search".to_string()),
                    DraftPatch::Problem("p95 over 500ms".to_string()),
                    DraftPatch::AcceptanceCriterion("p95 < 500ms".to_string()),
                ],
                "m1",
            )
            .unwrap();
        let hash = session.draft.content_hash();
        checkpoints.save(&session).await.unwrap();
        (checkpoints, hash)
    }

    fn orchestrator(
        checkpoints: Arc<InMemoryCheckpointStore>,
        tracker: Arc<RecordingTracker>,
    ) -> CommitOrchestrator {
        orchestrator_with_locks(checkpoints, tracker, ThreadLocks::new())
    }

    fn orchestrator_with_locks(
        checkpoints: Arc<InMemoryCheckpointStore>,
        tracker: Arc<RecordingTracker>,
        locks: ThreadLocks,
    ) -> CommitOrchestrator {
        CommitOrchestrator::new(
            Arc::new(InMemoryRecordStore::new()),
            tracker,
            checkpoints,
            locks,
            TrackerConfig::default(),
            RetryConfig {
                max_attempts: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 4,
            },
        )
    }

    #[tokio::test]
    async fn double_click_returns_the_same_key_once_created() {
        let (checkpoints, hash) = seeded_checkpoints().await;
        let tracker = Arc::new(RecordingTracker::new());
        let orch = orchestrator(checkpoints, tracker.clone());

        let first = orch.approve_and_commit("s1", &hash, "alice").await.unwrap();
        let key = match first {
            ApprovalOutcome::Committed { external_key } => external_key,
            other => panic!("expected committed, got {:?}", other),
        };

        let second = orch.approve_and_commit("s1", &hash, "alice").await.unwrap();
        assert_eq!(
            second,
            ApprovalOutcome::Committed {
                external_key: key.clone()
            }
        );
        assert_eq!(tracker.create_calls(), 1);
    }

    #[tokio::test]
    async fn stale_hash_is_rejected_without_commit() {
        let (checkpoints, _hash) = seeded_checkpoints().await;
        let tracker = Arc::new(RecordingTracker::new());
        let orch = orchestrator(checkpoints, tracker.clone());

        let outcome = orch
            .approve_and_commit("s1", "not-the-current-hash", "alice")
            .await
            .unwrap();
        assert_eq!(outcome, ApprovalOutcome::StalePreview);
        assert_eq!(tracker.create_calls(), 0);
    }

    #[tokio::test]
    async fn successful_commit_freezes_the_draft() {
        let (checkpoints, hash) = seeded_checkpoints().await;
        let tracker = Arc::new(RecordingTracker::new());
        let orch = orchestrator(checkpoints.clone(), tracker);

        orch.approve_and_commit("s1", &hash, "alice").await.unwrap();
        let session = checkpoints.load("s1").await.unwrap().unwrap();
        assert!(session.draft.frozen);
    }

    #[tokio::test]
    async fn permanent_failure_requires_fresh_approval() {
        let (checkpoints, hash) = seeded_checkpoints().await;
        let tracker = Arc::new(RecordingTracker::new().with_permanent_failure());
        let orch = orchestrator(checkpoints.clone(), tracker.clone());

        let first = orch.approve_and_commit("s1", &hash, "alice").await.unwrap();
        assert!(matches!(first, ApprovalOutcome::PreviousFailure { .. }));
        assert_eq!(tracker.create_calls(), 1);

        // Same approval again: the prior failure is reported, the tracker
        // is not called a second time.
        let second = orch.approve_and_commit("s1", &hash, "bob").await.unwrap();
        assert!(matches!(second, ApprovalOutcome::PreviousFailure { .. }));
        assert_eq!(tracker.create_calls(), 1);

        // Draft stays editable after a failed commit.
        let session = checkpoints.load("s1").await.unwrap().unwrap();
        assert!(!session.draft.frozen);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_within_one_claim() {
        let (checkpoints, hash) = seeded_checkpoints().await;
        let tracker = Arc::new(RecordingTracker::new().with_transient_failures(2));
        let orch = orchestrator(checkpoints, tracker.clone());

        let outcome = orch.approve_and_commit("s1", &hash, "alice").await.unwrap();
        assert!(matches!(outcome, ApprovalOutcome::Committed { .. }));
        assert_eq!(tracker.create_calls(), 3);
    }

    #[tokio::test]
    async fn commit_waits_for_the_thread_lock() {
        let (checkpoints, hash) = seeded_checkpoints().await;
        let tracker = Arc::new(RecordingTracker::new());
        let locks = ThreadLocks::new();
        let orch = Arc::new(orchestrator_with_locks(
            checkpoints,
            tracker.clone(),
            locks.clone(),
        ));

        // Simulate an in-flight turn holding the thread's lock.
        let lock = locks.for_thread("s1");
        let guard = lock.lock().await;

        let handle = tokio::spawn({
            let orch = orch.clone();
            let hash = hash.clone();
            async move { orch.approve_and_commit("s1", &hash, "alice").await.unwrap() }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        assert_eq!(tracker.create_calls(), 0);

        drop(guard);
        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, ApprovalOutcome::Committed { .. }));
        assert_eq!(tracker.create_calls(), 1);
    }

    #[tokio::test]
    async fn unknown_session_is_an_error() {
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let tracker = Arc::new(RecordingTracker::new());
        let orch = orchestrator(checkpoints, tracker);
        let err = orch
            .approve_and_commit("missing", "h", "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, TicketError::UnknownSession(_)));
    }
}
