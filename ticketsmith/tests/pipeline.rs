//! End-to-end pipeline tests: conversation capture through idempotent
//! commit, against both in-memory and sqlite storage.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use tempfile::NamedTempFile;

use ticketsmith::commit::{
    ApprovalOutcome, CommitOrchestrator, InMemoryRecordStore, NoopDuplicateSearch,
    RecordingTracker, SqliteRecordStore,
};
use ticketsmith::config::{FlowConfig, RetryConfig, TrackerConfig};
use ticketsmith::flow::ConversationFlow;
use ticketsmith::llm::StubLlmProvider;
use ticketsmith::session::{
    CheckpointStore, InMemoryCheckpointStore, MessageEnvelope, SessionRunner,
    SqliteCheckpointStore,
};
use ticketsmith::TurnOutcome;

const COMPLETE_REQUEST: &str =
    "create a story: search is slow, fix p95 under 500ms, done when p95<500ms";

fn flow() -> ConversationFlow {
    ConversationFlow::new(
        Arc::new(StubLlmProvider::new()),
        Arc::new(NoopDuplicateSearch),
        FlowConfig::default(),
    )
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 4,
    }
}

struct Pipeline {
    runner: SessionRunner,
    orchestrator: Arc<CommitOrchestrator>,
    tracker: Arc<RecordingTracker>,
}

fn memory_pipeline(tracker: RecordingTracker) -> Pipeline {
    let checkpoints: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let tracker = Arc::new(tracker);
    let runner = SessionRunner::new(flow(), checkpoints.clone());
    let orchestrator = Arc::new(CommitOrchestrator::new(
        Arc::new(InMemoryRecordStore::new()),
        tracker.clone(),
        checkpoints,
        runner.thread_locks(),
        TrackerConfig::default(),
        fast_retry(),
    ));
    Pipeline {
        runner,
        orchestrator,
        tracker,
    }
}

async fn drive_to_preview(pipeline: &Pipeline, thread_id: &str) -> String {
    let outcome = pipeline
        .runner
        .handle_message(MessageEnvelope::new(thread_id, "user-1", COMPLETE_REQUEST))
        .await
        .unwrap();
    match outcome {
        TurnOutcome::Preview { content_hash, .. } => content_hash,
        other => panic!("expected preview, got {:?}", other),
    }
}

#[tokio::test]
async fn capture_approve_commit_happy_path() {
    let pipeline = memory_pipeline(RecordingTracker::new());
    let hash = drive_to_preview(&pipeline, "t1").await;

    let outcome = pipeline
        .orchestrator
        .approve_and_commit("t1", &hash, "alice")
        .await
        .unwrap();
    let key = match outcome {
        ApprovalOutcome::Committed { external_key } => external_key,
        other => panic!("expected committed, got {:?}", other),
    };
    assert_eq!(key, "PROJ-1");

    // A retried approval replays the recorded result.
    let replay = pipeline
        .orchestrator
        .approve_and_commit("t1", &hash, "alice")
        .await
        .unwrap();
    assert_eq!(
        replay,
        ApprovalOutcome::Committed {
            external_key: key.clone()
        }
    );
    assert_eq!(pipeline.tracker.create_calls(), 1);
}

#[tokio::test]
async fn concurrent_approvals_create_exactly_one_issue() {
    let pipeline = memory_pipeline(RecordingTracker::new());
    let hash = drive_to_preview(&pipeline, "t1").await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let orchestrator = pipeline.orchestrator.clone();
        let hash = hash.clone();
        handles.push(tokio::spawn(async move {
            orchestrator
                .approve_and_commit("t1", &hash, &format!("user-{}", i))
                .await
                .unwrap()
        }));
    }

    let mut keys = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            ApprovalOutcome::Committed { external_key } => keys.push(external_key),
            other => panic!("expected committed, got {:?}", other),
        }
    }
    assert_eq!(keys.len(), 8);
    assert!(keys.iter().all(|k| k == &keys[0]));
    assert_eq!(pipeline.tracker.create_calls(), 1);
}

#[tokio::test]
async fn stale_hash_requires_a_fresh_preview() {
    let pipeline = memory_pipeline(RecordingTracker::new());
    let first_hash = drive_to_preview(&pipeline, "t1").await;

    // The draft changes after the preview the approver saw.
    pipeline
        .runner
        .handle_message(MessageEnvelope::new(
            "t1",
            "user-1",
            "problem: actually the index is missing entirely",
        ))
        .await
        .unwrap();
    let current_hash = pipeline
        .runner
        .current_content_hash("t1")
        .await
        .unwrap()
        .unwrap();
    assert_ne!(first_hash, current_hash);

    let stale = pipeline
        .orchestrator
        .approve_and_commit("t1", &first_hash, "alice")
        .await
        .unwrap();
    assert_eq!(stale, ApprovalOutcome::StalePreview);
    assert_eq!(pipeline.tracker.create_calls(), 0);

    // Approving the hash that matches the current draft commits.
    let fresh = pipeline
        .orchestrator
        .approve_and_commit("t1", &current_hash, "alice")
        .await
        .unwrap();
    assert!(matches!(fresh, ApprovalOutcome::Committed { .. }));
    assert_eq!(pipeline.tracker.create_calls(), 1);
}

#[tokio::test]
async fn failed_commit_allows_retry_after_changes() {
    let pipeline = memory_pipeline(RecordingTracker::new().with_permanent_failure());
    let hash = drive_to_preview(&pipeline, "t1").await;

    let failed = pipeline
        .orchestrator
        .approve_and_commit("t1", &hash, "alice")
        .await
        .unwrap();
    assert!(matches!(failed, ApprovalOutcome::PreviousFailure { .. }));

    // Same hash again: the recorded failure is replayed, no new call.
    let replay = pipeline
        .orchestrator
        .approve_and_commit("t1", &hash, "bob")
        .await
        .unwrap();
    assert!(matches!(replay, ApprovalOutcome::PreviousFailure { .. }));
    assert_eq!(pipeline.tracker.create_calls(), 1);

    // Editing the draft produces a new hash, and approving it is a new
    // commit attempt against the tracker.
    pipeline
        .runner
        .handle_message(MessageEnvelope::new(
            "t1",
            "user-1",
            "problem: the index is missing entirely",
        ))
        .await
        .unwrap();
    let new_hash = pipeline
        .runner
        .current_content_hash("t1")
        .await
        .unwrap()
        .unwrap();
    assert_ne!(new_hash, hash);
    let retried = pipeline
        .orchestrator
        .approve_and_commit("t1", &new_hash, "alice")
        .await
        .unwrap();
    assert!(matches!(retried, ApprovalOutcome::PreviousFailure { .. }));
    assert_eq!(pipeline.tracker.create_calls(), 2);
}

#[tokio::test]
async fn committed_draft_is_frozen_against_further_edits() {
    let pipeline = memory_pipeline(RecordingTracker::new());
    let hash = drive_to_preview(&pipeline, "t1").await;
    pipeline
        .orchestrator
        .approve_and_commit("t1", &hash, "alice")
        .await
        .unwrap();

    // Post-commit messages cannot mutate the draft; the hash is stable.
    pipeline
        .runner
        .handle_message(MessageEnvelope::new(
            "t1",
            "user-1",
            "problem: wait, change the problem statement",
        ))
        .await
        .unwrap();
    let after = pipeline
        .runner
        .current_content_hash("t1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after, hash);
}

#[tokio::test]
async fn multibyte_messages_complete_the_turn() {
    // Characters whose lowercase form changes byte length must not break
    // marker extraction; the turn completes and persists normally.
    let pipeline = memory_pipeline(RecordingTracker::new());
    let outcome = pipeline
        .runner
        .handle_message(MessageEnvelope::new("t1", "user-1", "İ title:ék"))
        .await
        .unwrap();
    assert!(matches!(outcome, TurnOutcome::Ask { .. }), "{:?}", outcome);
    assert!(pipeline
        .runner
        .current_content_hash("t1")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn session_resumes_across_restart() {
    let tmp = NamedTempFile::new().unwrap();
    let path = tmp.path().to_path_buf();

    // First process: an incomplete request leaves open questions behind.
    {
        let checkpoints: Arc<dyn CheckpointStore> =
            Arc::new(SqliteCheckpointStore::new(path.clone()).unwrap());
        let runner = SessionRunner::new(flow(), checkpoints);
        let outcome = runner
            .handle_message(MessageEnvelope::new(
                "t1",
                "user-1",
                "create a ticket: the exporter crashes",
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::Ask { .. }));
    }

    // Second process: a fresh runner on the same database picks the
    // session up mid-conversation and completes the draft.
    let checkpoints: Arc<dyn CheckpointStore> =
        Arc::new(SqliteCheckpointStore::new(path.clone()).unwrap());
    let runner = SessionRunner::new(flow(), checkpoints);
    let outcome = runner
        .handle_message(MessageEnvelope::new(
            "t1",
            "user-1",
            "problem: exports over 10k rows OOM. acceptance criterion: done when a 50k row export succeeds",
        ))
        .await
        .unwrap();
    assert!(outcome.is_preview(), "got {:?}", outcome);
}

#[tokio::test]
async fn sqlite_records_survive_orchestrator_restart() {
    let checkpoint_file = NamedTempFile::new().unwrap();
    let record_file = NamedTempFile::new().unwrap();
    let checkpoints: Arc<dyn CheckpointStore> =
        Arc::new(SqliteCheckpointStore::new(checkpoint_file.path().to_path_buf()).unwrap());
    let tracker = Arc::new(RecordingTracker::new());

    let runner = SessionRunner::new(flow(), checkpoints.clone());
    let outcome = runner
        .handle_message(MessageEnvelope::new("t1", "user-1", COMPLETE_REQUEST))
        .await
        .unwrap();
    let hash = match outcome {
        TurnOutcome::Preview { content_hash, .. } => content_hash,
        other => panic!("expected preview, got {:?}", other),
    };

    let key = {
        let orchestrator = CommitOrchestrator::new(
            Arc::new(SqliteRecordStore::new(record_file.path().to_path_buf()).unwrap()),
            tracker.clone(),
            checkpoints.clone(),
            runner.thread_locks(),
            TrackerConfig::default(),
            fast_retry(),
        );
        match orchestrator
            .approve_and_commit("t1", &hash, "alice")
            .await
            .unwrap()
        {
            ApprovalOutcome::Committed { external_key } => external_key,
            other => panic!("expected committed, got {:?}", other),
        }
    };

    // A new orchestrator over the same database replays the commit
    // instead of re-invoking the tracker.
    let orchestrator = CommitOrchestrator::new(
        Arc::new(SqliteRecordStore::new(record_file.path().to_path_buf()).unwrap()),
        tracker.clone(),
        checkpoints,
        runner.thread_locks(),
        TrackerConfig::default(),
        fast_retry(),
    );
    let replay = orchestrator
        .approve_and_commit("t1", &hash, "bob")
        .await
        .unwrap();
    assert_eq!(replay, ApprovalOutcome::Committed { external_key: key });
    assert_eq!(tracker.create_calls(), 1);
}
