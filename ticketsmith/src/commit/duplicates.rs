//! Best-effort duplicate detection consulted before a preview is surfaced.
//!
//! The collaborator is non-authoritative: a failed or empty search never
//! blocks a preview, it only removes the hint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::draft::TicketDraft;
use crate::errors::TicketResult;

use super::tracker::IssueTracker;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateCandidate {
    pub key: String,
    pub summary: String,
}

#[async_trait]
pub trait DuplicateSearch: Send + Sync {
    async fn find_similar(&self, draft: &TicketDraft) -> TicketResult<Vec<DuplicateCandidate>>;
}

/// No duplicate detection at all.
pub struct NoopDuplicateSearch;

#[async_trait]
impl DuplicateSearch for NoopDuplicateSearch {
    async fn find_similar(&self, _draft: &TicketDraft) -> TicketResult<Vec<DuplicateCandidate>> {
        Ok(Vec::new())
    }
}

/// Searches the tracker by draft title.
pub struct TrackerDuplicateSearch {
    tracker: Arc<dyn IssueTracker>,
    limit: usize,
}

impl TrackerDuplicateSearch {
    pub fn new(tracker: Arc<dyn IssueTracker>) -> Self {
        Self { tracker, limit: 5 }
    }
}

#[async_trait]
impl DuplicateSearch for TrackerDuplicateSearch {
    async fn find_similar(&self, draft: &TicketDraft) -> TicketResult<Vec<DuplicateCandidate>> {
        if draft.title.trim().is_empty() {
            return Ok(Vec::new());
        }
        let hits = self
            .tracker
            .search_summaries(&draft.title, self.limit)
            .await?;
        Ok(hits
            .into_iter()
            .map(|(key, summary)| DuplicateCandidate { key, summary })
            .collect())
    }
}

/// In-memory word-overlap matcher for tests.
pub struct KeywordDuplicateSearch {
    known: Vec<DuplicateCandidate>,
}

impl KeywordDuplicateSearch {
    pub fn new(known: Vec<DuplicateCandidate>) -> Self {
        Self { known }
    }
}

#[async_trait]
impl DuplicateSearch for KeywordDuplicateSearch {
    async fn find_similar(&self, draft: &TicketDraft) -> TicketResult<Vec<DuplicateCandidate>> {
        let title = draft.title.to_lowercase();
        let words: Vec<&str> = title.split_whitespace().collect();
        Ok(self
            .known
            .iter()
            .filter(|candidate| {
                let summary = candidate.summary.to_lowercase();
                words.iter().any(|w| w.len() > 3 && summary.contains(w))
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::DraftPatch;

    #[tokio::test]
    async fn keyword_search_matches_on_title_words() {
        let search = KeywordDuplicateSearch::new(vec![
            DuplicateCandidate {
                key: "SRCH-10".to_string(),
                summary: "Search latency regression".to_string(),
            },
            DuplicateCandidate {
                key: "SRCH-11".to_string(),
                summary: "Export button mislabeled".to_string(),
            },
        ]);
        let mut draft = TicketDraft::new();
        draft
            .apply(&[DraftPatch::Title("search is slow".to_string())], "m1")
            .unwrap();

        let hits = search.find_similar(&draft).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "SRCH-10");
    }
}
