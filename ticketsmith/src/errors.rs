//! Error handling for the capture/commit pipeline

use thiserror::Error;

pub type TicketResult<T> = Result<T, TicketError>;

/// Errors surfaced by the pipeline. Classification and extraction failures
/// are deliberately *not* represented here as turn-level errors: the state
/// machine absorbs them as "no new information" and continues.
#[derive(Debug, Error)]
pub enum TicketError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("llm provider error: {0}")]
    Llm(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("draft is frozen after a successful commit")]
    DraftFrozen,

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

/// Issue-tracker failures split by retryability. Transient errors are
/// retried with backoff; permanent ones are recorded immediately and
/// require a fresh human approval before another attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("transient tracker failure: {0}")]
    Transient(String),

    #[error("permanent tracker failure: {0}")]
    Permanent(String),
}

impl TrackerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TrackerError::Transient(_))
    }
}

impl From<serde_json::Error> for TicketError {
    fn from(e: serde_json::Error) -> Self {
        TicketError::Serialization(e.to_string())
    }
}

impl From<rusqlite::Error> for TicketError {
    fn from(e: rusqlite::Error) -> Self {
        TicketError::Storage(e.to_string())
    }
}
