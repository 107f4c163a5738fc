//! Conversation state machine.
//!
//! Routing graph: route → extract (looped) → validate → decide, terminating
//! in exactly one outcome per turn (ask / preview / ready / review text).
//! Non-ticket intents exit immediately without touching the
//! draft. The extraction loop is bounded by the per-session step budget,
//! and classification or extraction failures degrade to "no new
//! information" instead of failing the turn.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::commit::duplicates::{DuplicateCandidate, DuplicateSearch};
use crate::config::FlowConfig;
use crate::draft::TicketDraft;
use crate::intent::{IntentRouter, MessageIntent};
use crate::llm::LlmProvider;
use crate::session::{Checkpoint, MessageEnvelope};

mod extract;

pub use extract::is_delegation;

/// An unanswered question tied to a draft field, tracked across turns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingQuestion {
    pub field: String,
    pub text: String,
}

/// Terminal outcome of one state-machine run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TurnOutcome {
    /// The draft is incomplete; these questions are open.
    Ask { questions: Vec<PendingQuestion> },
    /// The draft is complete; surface it (plus possible duplicates) for
    /// human approval.
    Preview {
        draft: TicketDraft,
        duplicates: Vec<DuplicateCandidate>,
        content_hash: String,
    },
    /// The draft was already approved in a prior turn.
    Ready { draft: TicketDraft },
    /// Non-ticket branch: review feedback or conversational reply.
    Review { message: String },
}

impl TurnOutcome {
    pub fn is_preview(&self) -> bool {
        matches!(self, TurnOutcome::Preview { .. })
    }

    /// Short human rendering used by the driver binary.
    pub fn render(&self) -> String {
        match self {
            TurnOutcome::Ask { questions } => {
                let mut out = String::from("I need a bit more detail:\n");
                for q in questions {
                    out.push_str(&format!("  - {}\n", q.text));
                }
                out
            }
            TurnOutcome::Preview {
                draft,
                duplicates,
                content_hash,
            } => {
                let mut out = format!(
                    "Ready for approval (hash {}):\n  {}\n  {}\n",
                    &content_hash[..12.min(content_hash.len())],
                    draft.title,
                    draft.problem
                );
                for c in &draft.acceptance_criteria {
                    out.push_str(&format!("  * done when {}\n", c));
                }
                if !duplicates.is_empty() {
                    out.push_str("Possible duplicates:\n");
                    for d in duplicates {
                        out.push_str(&format!("  ? {} {}\n", d.key, d.summary));
                    }
                }
                out
            }
            TurnOutcome::Ready { draft } => format!("Approved: {}", draft.title),
            TurnOutcome::Review { message } => message.clone(),
        }
    }
}

/// Fixed fallback when the step budget is exhausted.
const BUDGET_FALLBACK: &str =
    "I couldn't finish assembling this ticket within the allowed number of steps. \
     Please restate the request in a new thread and I'll start a fresh draft.";

const CONVERSATIONAL_REPLY: &str =
    "Happy to help. Describe the work you'd like captured and I'll draft a ticket.";

/// Drives one conversation turn over the session checkpoint.
pub struct ConversationFlow {
    router: IntentRouter,
    provider: Arc<dyn LlmProvider>,
    duplicates: Arc<dyn DuplicateSearch>,
    config: FlowConfig,
}

impl ConversationFlow {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        duplicates: Arc<dyn DuplicateSearch>,
        config: FlowConfig,
    ) -> Self {
        Self {
            router: IntentRouter::new(provider.clone()),
            provider,
            duplicates,
            config,
        }
    }

    /// Run the machine until a terminal outcome. Never errors: degraded
    /// collaborators only reduce what a turn can extract.
    pub async fn run_turn(&self, session: &mut Checkpoint) -> TurnOutcome {
        let Some(latest) = session.messages.last().cloned() else {
            return TurnOutcome::Review {
                message: CONVERSATIONAL_REPLY.to_string(),
            };
        };

        let has_preview = session
            .last_outcome
            .as_ref()
            .map(TurnOutcome::is_preview)
            .unwrap_or(false);

        let intent = self.router.classify(&latest.text, has_preview).await;
        tracing::debug!(thread_id = %session.thread_id, ?intent, "routed message");

        match intent {
            MessageIntent::Conversational => TurnOutcome::Review {
                message: CONVERSATIONAL_REPLY.to_string(),
            },
            MessageIntent::Review => self.review_turn(session).await,
            MessageIntent::ActOnExisting => TurnOutcome::Review {
                message: existing_item_reply(&latest.text),
            },
            MessageIntent::Approval if has_preview && session.draft.is_commit_ready() => {
                TurnOutcome::Ready {
                    draft: session.draft.clone(),
                }
            }
            MessageIntent::Approval | MessageIntent::CreateTicket => {
                self.capture_turn(session, &latest).await
            }
        }
    }

    /// The bounded extraction loop followed by validation and the decision.
    async fn capture_turn(
        &self,
        session: &mut Checkpoint,
        latest: &MessageEnvelope,
    ) -> TurnOutcome {
        loop {
            if session.step_count >= self.config.max_steps {
                log::warn!(
                    "step budget exhausted for thread {} ({} steps)",
                    session.thread_id,
                    session.step_count
                );
                return TurnOutcome::Review {
                    message: BUDGET_FALLBACK.to_string(),
                };
            }
            session.step_count += 1;

            let changed = self.extract_step(session, latest).await;

            if session.draft.is_commit_ready() {
                break;
            }
            if changed == 0 {
                // Nothing extractable remains in this message.
                let questions = self.open_questions(session);
                if questions.is_empty() {
                    break;
                }
                session.pending_questions = questions.clone();
                return TurnOutcome::Ask { questions };
            }
            // Something changed but the draft is still incomplete:
            // re-enter extraction within the budget.
        }

        // Commit-ready validation passed; pick the outcome, consulting the
        // duplicate collaborator best-effort.
        let duplicates = match self.duplicates.find_similar(&session.draft).await {
            Ok(candidates) => candidates,
            Err(e) => {
                log::warn!("duplicate search failed, continuing without hints: {}", e);
                Vec::new()
            }
        };
        session.pending_questions.clear();
        TurnOutcome::Preview {
            content_hash: session.draft.content_hash(),
            draft: session.draft.clone(),
            duplicates,
        }
    }

    async fn review_turn(&self, session: &Checkpoint) -> TurnOutcome {
        let transcript = extract::transcript(session);
        let message = match self.provider.generate_field("review", &transcript).await {
            Ok(text) if !text.trim().is_empty() => text,
            _ => "Here's where the draft stands; tell me what to adjust.".to_string(),
        };
        TurnOutcome::Review { message }
    }

    /// Questions for the missing commit-ready fields, capped.
    fn open_questions(&self, session: &Checkpoint) -> Vec<PendingQuestion> {
        let draft = &session.draft;
        let mut questions = Vec::new();
        if draft.title.trim().is_empty() {
            questions.push(PendingQuestion {
                field: "title".to_string(),
                text: "What should the ticket title be?".to_string(),
            });
        }
        if draft.problem.trim().is_empty() {
            questions.push(PendingQuestion {
                field: "problem".to_string(),
                text: "What problem does this solve?".to_string(),
            });
        }
        if draft.acceptance_criteria.is_empty() {
            questions.push(PendingQuestion {
                field: "acceptance_criterion".to_string(),
                text: "How will we know it's done? (e.g. \"done when p95 < 500ms\")".to_string(),
            });
        }
        questions.truncate(self.config.max_questions);
        questions
    }
}

fn existing_item_reply(text: &str) -> String {
    static KEY: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r"\b[A-Z][A-Z0-9]+-\d+\b").unwrap());
    match KEY.find(text) {
        Some(m) => format!(
            "That sounds like work on {}; open it in the tracker to update it. \
             I only assemble new tickets here.",
            m.as_str()
        ),
        None => "That sounds like an update to an existing ticket; I only assemble new \
                 tickets here."
            .to_string(),
    }
}
