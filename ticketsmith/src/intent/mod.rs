//! Two-tier intent routing.
//!
//! Deterministic pattern rules handle the common cases in a fixed priority
//! order; only an unmatched message is escalated to the model classifier.
//! A classifier failure falls back to the ticket-creation intent.

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

use crate::llm::LlmProvider;

/// Closed set of message intents the router produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageIntent {
    CreateTicket,
    Review,
    ActOnExisting,
    Approval,
    Conversational,
}

impl MessageIntent {
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "create_ticket" | "ticket" | "create" => Some(MessageIntent::CreateTicket),
            "review" | "discussion" => Some(MessageIntent::Review),
            "act_on_existing" | "existing" => Some(MessageIntent::ActOnExisting),
            "approval" | "approve" => Some(MessageIntent::Approval),
            "conversational" | "chat" => Some(MessageIntent::Conversational),
            _ => None,
        }
    }
}

static NEGATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(don't|do not|no need|never mind|cancel|forget|scrap)\b.*\b(ticket|story|issue|bug|task|epic|that)\b")
        .unwrap()
});

/// Tracker-style issue keys ("SRCH-123") or explicit references to an
/// existing item.
static EXISTING_ITEM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Z][A-Z0-9]+-\d+\b|(?i)\b(existing|that)\s+(ticket|story|issue)\b|(?i)\b(update|close|reopen|comment on)\s+the\s+(ticket|story|issue)\b")
        .unwrap()
});

static CREATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(create|open|file|raise|log|make|write up|draft)\b.{0,40}\b(ticket|story|issue|bug|task|epic)\b")
        .unwrap()
});

static REVIEW: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(review|feedback|thoughts on|what do you think|look over|discuss)\b")
        .unwrap()
});

static APPROVAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(yes|yep|approve[d]?|lgtm|ship it|go ahead|looks good|confirm(ed)?|do it)\b")
        .unwrap()
});

static CONVERSATIONAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(hi|hello|hey|thanks|thank you|ok(ay)?|good (morning|afternoon|evening))\b")
        .unwrap()
});

/// Routes a message to an intent, escalating to the model only when no
/// deterministic rule fires.
pub struct IntentRouter {
    provider: Arc<dyn LlmProvider>,
}

impl IntentRouter {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }

    /// Deterministic tier. Priority: negation > existing-item reference >
    /// creation phrase > review phrase > approval (only when a preview
    /// context exists) > conversational phrase.
    pub fn classify_rules(text: &str, has_preview_context: bool) -> Option<MessageIntent> {
        if NEGATION.is_match(text) {
            return Some(MessageIntent::Conversational);
        }
        if EXISTING_ITEM.is_match(text) {
            return Some(MessageIntent::ActOnExisting);
        }
        if CREATION.is_match(text) {
            return Some(MessageIntent::CreateTicket);
        }
        if REVIEW.is_match(text) {
            return Some(MessageIntent::Review);
        }
        if has_preview_context && APPROVAL.is_match(text) {
            return Some(MessageIntent::Approval);
        }
        if CONVERSATIONAL.is_match(text) {
            return Some(MessageIntent::Conversational);
        }
        None
    }

    /// Full classification. Never fails the turn: a model error or an
    /// unrecognized label defaults to ticket creation.
    pub async fn classify(&self, text: &str, has_preview_context: bool) -> MessageIntent {
        if let Some(intent) = Self::classify_rules(text, has_preview_context) {
            return intent;
        }
        match self.provider.classify_intent(text).await {
            Ok(intent) => intent,
            Err(e) => {
                log::warn!("intent classification failed, defaulting to ticket: {}", e);
                MessageIntent::CreateTicket
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(text: &str) -> Option<MessageIntent> {
        IntentRouter::classify_rules(text, false)
    }

    #[test]
    fn creation_phrases_route_to_ticket() {
        assert_eq!(
            rules("please create a ticket for the login bug"),
            Some(MessageIntent::CreateTicket)
        );
        assert_eq!(
            rules("can you file an issue about this?"),
            Some(MessageIntent::CreateTicket)
        );
    }

    #[test]
    fn negation_outranks_creation() {
        assert_eq!(
            rules("don't create a ticket for this"),
            Some(MessageIntent::Conversational)
        );
        assert_eq!(
            rules("never mind the story idea"),
            Some(MessageIntent::Conversational)
        );
    }

    #[test]
    fn existing_item_reference_outranks_creation() {
        assert_eq!(
            rules("create a subtask under SRCH-123"),
            Some(MessageIntent::ActOnExisting)
        );
        assert_eq!(
            rules("please update the ticket with the new logs"),
            Some(MessageIntent::ActOnExisting)
        );
    }

    #[test]
    fn review_phrases_route_to_review() {
        assert_eq!(
            rules("thoughts on the caching approach?"),
            Some(MessageIntent::Review)
        );
    }

    #[test]
    fn approval_requires_preview_context() {
        assert_eq!(IntentRouter::classify_rules("lgtm", false), None);
        assert_eq!(
            IntentRouter::classify_rules("lgtm", true),
            Some(MessageIntent::Approval)
        );
        assert_eq!(
            IntentRouter::classify_rules("ship it", true),
            Some(MessageIntent::Approval)
        );
    }

    #[test]
    fn greetings_are_conversational() {
        assert_eq!(rules("hey there"), Some(MessageIntent::Conversational));
    }

    #[test]
    fn ambiguous_text_is_unmatched() {
        assert_eq!(rules("the p95 latency regressed after the deploy"), None);
    }
}
