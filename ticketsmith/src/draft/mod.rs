//! Versioned ticket draft with patch-style mutation and an evidence trail.
//!
//! The draft is the single document a conversation assembles. Every mutation
//! goes through [`TicketDraft::apply`], which records one evidence entry per
//! changed field and bumps the version counter at most once per call. The
//! content hash covers only the commit-relevant fields (title, problem,
//! sorted acceptance criteria) so it stays stable across bookkeeping changes
//! and criteria insertion order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::errors::{TicketError, TicketResult};

/// Lifecycle status of a key/value constraint on the draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintStatus {
    Proposed,
    Accepted,
    Deprecated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub value: String,
    pub status: ConstraintStatus,
}

/// Ties a field change back to the message that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceEntry {
    pub message_id: String,
    pub field: String,
    pub excerpt: String,
    pub recorded_at: DateTime<Utc>,
}

/// A single known field mutation. Unknown fields fail deserialization
/// instead of being silently set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum DraftPatch {
    Title(String),
    Problem(String),
    Solution(String),
    AcceptanceCriterion(String),
    Constraint {
        key: String,
        #[serde(rename = "value")]
        text: String,
        status: ConstraintStatus,
    },
    Risk(String),
    Dependency(String),
    ParentEpic(String),
}

impl DraftPatch {
    /// Name of the draft field this patch touches, used for evidence entries.
    pub fn field_name(&self) -> &'static str {
        match self {
            DraftPatch::Title(_) => "title",
            DraftPatch::Problem(_) => "problem",
            DraftPatch::Solution(_) => "solution",
            DraftPatch::AcceptanceCriterion(_) => "acceptance_criterion",
            DraftPatch::Constraint { .. } => "constraint",
            DraftPatch::Risk(_) => "risk",
            DraftPatch::Dependency(_) => "dependency",
            DraftPatch::ParentEpic(_) => "parent_epic",
        }
    }

    /// Build a patch for a named scalar field (used when a pending question
    /// is answered). Returns `None` for fields that are not directly
    /// answerable this way.
    pub fn for_field(field: &str, value: String) -> Option<Self> {
        match field {
            "title" => Some(DraftPatch::Title(value)),
            "problem" => Some(DraftPatch::Problem(value)),
            "solution" => Some(DraftPatch::Solution(value)),
            "acceptance_criterion" => Some(DraftPatch::AcceptanceCriterion(value)),
            _ => None,
        }
    }

    /// Short excerpt describing the patched content, stored as evidence.
    fn excerpt(&self) -> String {
        let text = match self {
            DraftPatch::Title(s)
            | DraftPatch::Problem(s)
            | DraftPatch::Solution(s)
            | DraftPatch::AcceptanceCriterion(s)
            | DraftPatch::Risk(s)
            | DraftPatch::Dependency(s)
            | DraftPatch::ParentEpic(s) => s.clone(),
            DraftPatch::Constraint { key, text, .. } => format!("{}: {}", key, text),
        };
        const MAX_EXCERPT: usize = 200;
        if text.chars().count() > MAX_EXCERPT {
            let truncated: String = text.chars().take(MAX_EXCERPT).collect();
            format!("{}…", truncated)
        } else {
            text
        }
    }
}

/// The evolving ticket proposal assembled from a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketDraft {
    pub id: String,
    pub parent_epic: Option<String>,
    pub title: String,
    pub problem: String,
    pub solution: String,
    pub acceptance_criteria: Vec<String>,
    /// Keyed constraints, merged by key on patch.
    pub constraints: BTreeMap<String, Constraint>,
    pub risks: Vec<String>,
    pub dependencies: Vec<String>,
    /// Append-only trail of which message produced which field change.
    pub evidence: Vec<EvidenceEntry>,
    /// Bumped once per mutating `apply` call.
    pub version: u64,
    /// Set once a commit-operation record for this draft reaches success.
    pub frozen: bool,
    pub created_at: DateTime<Utc>,
}

impl TicketDraft {
    pub fn new() -> Self {
        Self {
            id: format!("draft-{}", uuid::Uuid::new_v4()),
            parent_epic: None,
            title: String::new(),
            problem: String::new(),
            solution: String::new(),
            acceptance_criteria: Vec::new(),
            constraints: BTreeMap::new(),
            risks: Vec::new(),
            dependencies: Vec::new(),
            evidence: Vec::new(),
            version: 0,
            frozen: false,
            created_at: Utc::now(),
        }
    }

    /// A draft can be committed once a title, a problem statement and at
    /// least one acceptance criterion exist.
    pub fn is_commit_ready(&self) -> bool {
        !self.title.trim().is_empty()
            && !self.problem.trim().is_empty()
            && !self.acceptance_criteria.is_empty()
    }

    /// Apply a batch of patches originating from one message.
    ///
    /// List fields append (exact duplicates are dropped), constraints merge
    /// by key, scalar fields replace. Each field that actually changes gets
    /// one evidence entry; the version is incremented at most once per call,
    /// and not at all when nothing changed. Frozen drafts reject patches.
    pub fn apply(&mut self, patches: &[DraftPatch], message_id: &str) -> TicketResult<usize> {
        if self.frozen {
            return Err(TicketError::DraftFrozen);
        }

        let mut changed = 0usize;
        for patch in patches {
            if self.apply_one(patch) {
                self.evidence.push(EvidenceEntry {
                    message_id: message_id.to_string(),
                    field: patch.field_name().to_string(),
                    excerpt: patch.excerpt(),
                    recorded_at: Utc::now(),
                });
                changed += 1;
            }
        }
        if changed > 0 {
            self.version += 1;
        }
        Ok(changed)
    }

    fn apply_one(&mut self, patch: &DraftPatch) -> bool {
        match patch {
            DraftPatch::Title(s) => replace_scalar(&mut self.title, s),
            DraftPatch::Problem(s) => replace_scalar(&mut self.problem, s),
            DraftPatch::Solution(s) => replace_scalar(&mut self.solution, s),
            DraftPatch::AcceptanceCriterion(s) => append_unique(&mut self.acceptance_criteria, s),
            DraftPatch::Risk(s) => append_unique(&mut self.risks, s),
            DraftPatch::Dependency(s) => append_unique(&mut self.dependencies, s),
            DraftPatch::ParentEpic(s) => {
                let next = Some(s.clone());
                if self.parent_epic != next {
                    self.parent_epic = next;
                    true
                } else {
                    false
                }
            }
            DraftPatch::Constraint { key, text, status } => {
                let next = Constraint {
                    value: text.clone(),
                    status: *status,
                };
                match self.constraints.get(key) {
                    Some(existing) if *existing == next => false,
                    _ => {
                        self.constraints.insert(key.clone(), next);
                        true
                    }
                }
            }
        }
    }

    /// Deterministic digest of the commit-relevant fields: title, problem,
    /// and the acceptance criteria sorted so that insertion order does not
    /// matter. Version counter, evidence and timestamps are excluded on
    /// purpose: approving "this exact visible draft" stays valid across
    /// bookkeeping changes.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.title.as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.problem.as_bytes());
        hasher.update([0x1f]);
        let mut criteria = self.acceptance_criteria.clone();
        criteria.sort();
        for criterion in &criteria {
            hasher.update(criterion.as_bytes());
            hasher.update([0x1e]);
        }
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Mark the draft read-only. Called once a commit-operation record for
    /// its content hash reaches success.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }
}

impl Default for TicketDraft {
    fn default() -> Self {
        Self::new()
    }
}

fn replace_scalar(slot: &mut String, value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() || slot == trimmed {
        return false;
    }
    *slot = trimmed.to_string();
    true
}

fn append_unique(list: &mut Vec<String>, value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() || list.iter().any(|v| v == trimmed) {
        return false;
    }
    list.push(trimmed.to_string());
    true
}
