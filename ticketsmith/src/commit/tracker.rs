//! External commit client: the issue-tracker boundary.
//!
//! The orchestrator never calls `create_issue` more than once per won
//! claim; the client's job is to classify failures as transient (worth a
//! backoff retry) or permanent (recorded immediately, fresh approval
//! required).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::{RetryConfig, TrackerConfig};
use crate::draft::TicketDraft;
use crate::errors::{TicketError, TicketResult, TrackerError};

/// Payload for the tracker create call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueCreateRequest {
    pub project_key: String,
    pub summary: String,
    pub description: String,
    pub priority: String,
    pub parent_key: Option<String>,
}

impl IssueCreateRequest {
    pub fn from_draft(draft: &TicketDraft, config: &TrackerConfig) -> Self {
        let mut description = draft.problem.clone();
        if !draft.solution.trim().is_empty() {
            description.push_str("\n\nProposed solution:\n");
            description.push_str(&draft.solution);
        }
        if !draft.acceptance_criteria.is_empty() {
            description.push_str("\n\nAcceptance criteria:\n");
            for criterion in &draft.acceptance_criteria {
                description.push_str(&format!("- {}\n", criterion));
            }
        }
        if !draft.risks.is_empty() {
            description.push_str("\nRisks:\n");
            for risk in &draft.risks {
                description.push_str(&format!("- {}\n", risk));
            }
        }
        if !draft.dependencies.is_empty() {
            description.push_str("\nDependencies:\n");
            for dep in &draft.dependencies {
                description.push_str(&format!("- {}\n", dep));
            }
        }
        Self {
            project_key: config.project_key.clone(),
            summary: draft.title.clone(),
            description,
            priority: config.default_priority.clone(),
            parent_key: draft.parent_epic.clone(),
        }
    }
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Create the issue, returning the external key (e.g. "PROJ-123").
    async fn create_issue(&self, request: &IssueCreateRequest) -> Result<String, TrackerError>;

    /// Best-effort summary search used for duplicate hints. Trackers that
    /// cannot search return nothing.
    async fn search_summaries(
        &self,
        _query: &str,
        _limit: usize,
    ) -> Result<Vec<(String, String)>, TrackerError> {
        Ok(Vec::new())
    }
}

/// Retry a tracker call with exponential backoff. Only transient failures
/// are retried; a permanent failure aborts immediately.
pub async fn with_retry<F, Fut, T>(
    retry: &RetryConfig,
    op_name: &str,
    mut call: F,
) -> Result<T, TrackerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TrackerError>>,
{
    let mut backoff_ms = retry.initial_backoff_ms;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                log::warn!(
                    "{} attempt {}/{} failed ({}), retrying in {}ms",
                    op_name,
                    attempt,
                    retry.max_attempts,
                    e,
                    backoff_ms
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(retry.max_backoff_ms);
            }
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Jira client
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct JiraCreateBody {
    fields: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct JiraCreateResponse {
    key: String,
}

pub struct JiraClient {
    config: TrackerConfig,
    client: reqwest::Client,
}

impl JiraClient {
    pub fn new(config: TrackerConfig) -> TicketResult<Self> {
        if config.base_url.is_none() {
            return Err(TicketError::Config(
                "tracker.base_url is required for the Jira client".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| TicketError::Config(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or_default()
    }

    fn auth(&self) -> Result<(String, String), TrackerError> {
        let email = self.config.account_email.clone().ok_or_else(|| {
            TrackerError::Permanent("tracker.account_email is not configured".to_string())
        })?;
        let token = self.config.resolved_api_token().ok_or_else(|| {
            TrackerError::Permanent("no Jira API token configured".to_string())
        })?;
        Ok((email, token))
    }

    fn classify_status(status: reqwest::StatusCode, body: &str) -> TrackerError {
        if status.is_server_error() || status.as_u16() == 429 {
            TrackerError::Transient(format!("Jira returned {}: {}", status, body))
        } else {
            // Configuration/validation failures (bad project, bad field)
            // will not improve on retry.
            TrackerError::Permanent(format!("Jira returned {}: {}", status, body))
        }
    }
}

#[async_trait]
impl IssueTracker for JiraClient {
    async fn create_issue(&self, request: &IssueCreateRequest) -> Result<String, TrackerError> {
        let (email, token) = self.auth()?;
        let url = format!("{}/rest/api/2/issue", self.base_url());

        let mut fields = serde_json::json!({
            "project": { "key": request.project_key },
            "summary": request.summary,
            "description": request.description,
            "issuetype": { "name": "Story" },
            "priority": { "name": request.priority },
        });
        if let Some(parent) = &request.parent_key {
            fields["parent"] = serde_json::json!({ "key": parent });
        }

        let response = self
            .client
            .post(&url)
            .basic_auth(email, Some(token))
            .json(&JiraCreateBody { fields })
            .send()
            .await
            .map_err(|e| TrackerError::Transient(format!("request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TrackerError::Transient(format!("failed to read body: {}", e)))?;
        if !status.is_success() {
            return Err(Self::classify_status(status, &body));
        }
        let parsed: JiraCreateResponse = serde_json::from_str(&body)
            .map_err(|e| TrackerError::Permanent(format!("unexpected create response: {}", e)))?;
        Ok(parsed.key)
    }

    async fn search_summaries(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(String, String)>, TrackerError> {
        let (email, token) = self.auth()?;
        let jql = format!(
            "project = {} AND summary ~ \"{}\" ORDER BY created DESC",
            self.config.project_key,
            query.replace('"', " ")
        );
        let url = format!("{}/rest/api/2/search", self.base_url());

        let response = self
            .client
            .get(&url)
            .basic_auth(email, Some(token))
            .query(&[("jql", jql.as_str()), ("maxResults", &limit.to_string())])
            .send()
            .await
            .map_err(|e| TrackerError::Transient(format!("request failed: {}", e)))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TrackerError::Transient(format!("failed to read body: {}", e)))?;
        if !status.is_success() {
            return Err(Self::classify_status(status, &body));
        }

        #[derive(Deserialize)]
        struct SearchResponse {
            issues: Vec<SearchIssue>,
        }
        #[derive(Deserialize)]
        struct SearchIssue {
            key: String,
            fields: SearchFields,
        }
        #[derive(Deserialize)]
        struct SearchFields {
            summary: String,
        }
        let parsed: SearchResponse = serde_json::from_str(&body)
            .map_err(|e| TrackerError::Permanent(format!("unexpected search response: {}", e)))?;
        Ok(parsed
            .issues
            .into_iter()
            .map(|i| (i.key, i.fields.summary))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Recording test double
// ---------------------------------------------------------------------------

/// Counts external calls and can inject transient or permanent failures.
pub struct RecordingTracker {
    calls: AtomicU64,
    transient_failures: AtomicU64,
    permanent: bool,
    created: Mutex<Vec<IssueCreateRequest>>,
    known_issues: Vec<(String, String)>,
}

impl RecordingTracker {
    pub fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
            transient_failures: AtomicU64::new(0),
            permanent: false,
            created: Mutex::new(Vec::new()),
            known_issues: Vec::new(),
        }
    }

    /// Fail the first `n` create calls with a transient error.
    pub fn with_transient_failures(mut self, n: u64) -> Self {
        self.transient_failures = AtomicU64::new(n);
        self
    }

    /// Fail every create call with a permanent error.
    pub fn with_permanent_failure(mut self) -> Self {
        self.permanent = true;
        self
    }

    pub fn with_known_issues(mut self, issues: Vec<(String, String)>) -> Self {
        self.known_issues = issues;
        self
    }

    /// Total create attempts observed, failed ones included.
    pub fn create_calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for RecordingTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IssueTracker for RecordingTracker {
    async fn create_issue(&self, request: &IssueCreateRequest) -> Result<String, TrackerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.permanent {
            return Err(TrackerError::Permanent("project is not configured".to_string()));
        }
        loop {
            let remaining = self.transient_failures.load(Ordering::SeqCst);
            if remaining == 0 {
                break;
            }
            if self
                .transient_failures
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Err(TrackerError::Transient("503 from tracker".to_string()));
            }
        }
        let mut created = self.created.lock().expect("recording lock");
        created.push(request.clone());
        Ok(format!("{}-{}", request.project_key, call))
    }

    async fn search_summaries(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(String, String)>, TrackerError> {
        let query = query.to_lowercase();
        Ok(self
            .known_issues
            .iter()
            .filter(|(_, summary)| summary.to_lowercase().contains(&query))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::DraftPatch;

    fn ready_draft() -> TicketDraft {
        let mut draft = TicketDraft::new();
        draft
            .apply(
                &[
                    DraftPatch::Title("Slow search".to_string()),
                    DraftPatch::Problem("p95 is over 500ms".to_string()),
                    DraftPatch::AcceptanceCriterion("p95 < 500ms".to_string()),
                    DraftPatch::Risk("reindex load".to_string()),
                ],
                "m1",
            )
            .unwrap();
        draft
    }

    #[test]
    fn create_request_carries_draft_content() {
        let config = TrackerConfig {
            project_key: "SRCH".to_string(),
            ..TrackerConfig::default()
        };
        let request = IssueCreateRequest::from_draft(&ready_draft(), &config);
        assert_eq!(request.project_key, "SRCH");
        assert_eq!(request.summary, "Slow search");
        assert!(request.description.contains("p95 is over 500ms"));
        assert!(request.description.contains("- p95 < 500ms"));
        assert!(request.description.contains("reindex load"));
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let tracker = RecordingTracker::new().with_transient_failures(2);
        let config = TrackerConfig::default();
        let request = IssueCreateRequest::from_draft(&ready_draft(), &config);
        let retry = RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
        };
        let key = with_retry(&retry, "tracker_create", || tracker.create_issue(&request))
            .await
            .unwrap();
        assert_eq!(key, "PROJ-3");
        assert_eq!(tracker.create_calls(), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_budget() {
        let tracker = RecordingTracker::new().with_transient_failures(10);
        let config = TrackerConfig::default();
        let request = IssueCreateRequest::from_draft(&ready_draft(), &config);
        let retry = RetryConfig {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        };
        let err = with_retry(&retry, "tracker_create", || tracker.create_issue(&request))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(tracker.create_calls(), 2);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let tracker = RecordingTracker::new().with_permanent_failure();
        let config = TrackerConfig::default();
        let request = IssueCreateRequest::from_draft(&ready_draft(), &config);
        let err = with_retry(&RetryConfig::default(), "tracker_create", || {
            tracker.create_issue(&request)
        })
        .await
        .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(tracker.create_calls(), 1);
    }
}
