//! Approval and exactly-once commit to the external tracker.

pub mod duplicates;
pub mod orchestrator;
pub mod records;
pub mod tracker;

pub use duplicates::{DuplicateCandidate, DuplicateSearch, NoopDuplicateSearch, TrackerDuplicateSearch};
pub use orchestrator::{ApprovalOutcome, CommitOrchestrator};
pub use records::{
    ApprovalDecision, ApprovalInsert, ApprovalRecord, ClaimOutcome, CommitOperationRecord,
    InMemoryRecordStore, OperationStatus, RecordStore, SqliteRecordStore, OP_TRACKER_CREATE,
};
pub use tracker::{
    with_retry, IssueCreateRequest, IssueTracker, JiraClient, RecordingTracker,
};
