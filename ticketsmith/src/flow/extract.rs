//! Extraction step: answer-matching for open questions, delegation
//! handling, and general patch extraction from the latest message.

use once_cell::sync::Lazy;
use regex::Regex;

use super::ConversationFlow;
use crate::draft::DraftPatch;
use crate::session::{Checkpoint, MessageEnvelope};

/// Minimum confidence for an answer match to be applied to the draft.
const MIN_ANSWER_CONFIDENCE: f64 = 0.5;

static DELEGATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(you decide|up to you|whatever you think|your call|you choose|fill (it|that) in)\b")
        .unwrap()
});

/// Explicit "delegate to system" signal: the user is asking us to generate
/// the content rather than answering the question.
pub fn is_delegation(text: &str) -> bool {
    DELEGATION.is_match(text)
}

pub(super) fn transcript(session: &Checkpoint) -> String {
    session
        .messages
        .iter()
        .map(|m| format!("{}: {}", m.sender_id, m.text))
        .collect::<Vec<_>>()
        .join("\n")
}

impl ConversationFlow {
    /// One extraction pass. Returns the number of draft fields that changed;
    /// any collaborator failure counts as zero for that portion of the
    /// step (the turn continues, nothing is surfaced as an error).
    pub(super) async fn extract_step(
        &self,
        session: &mut Checkpoint,
        latest: &MessageEnvelope,
    ) -> usize {
        let mut changed = 0usize;

        if !session.pending_questions.is_empty() {
            changed += if is_delegation(&latest.text) {
                self.delegate_open_questions(session, latest).await
            } else {
                self.match_open_questions(session, latest).await
            };
        }

        // Only fall through to general extraction when the message was not
        // consumed as answers; otherwise a "title: ..." reply would also be
        // re-extracted as a fresh patch set.
        if changed == 0 {
            match self.provider.extract_patches(&latest.text).await {
                Ok(patches) => match session.draft.apply(&patches, &latest.id) {
                    Ok(n) => changed += n,
                    Err(e) => log::warn!("patch application rejected: {}", e),
                },
                Err(e) => {
                    // Degradation, not failure: the turn proceeds with no
                    // new information.
                    log::warn!("extraction failed, treating as no-op: {}", e);
                }
            }
        }

        changed
    }

    /// Each open question is independently matched against the response.
    async fn match_open_questions(
        &self,
        session: &mut Checkpoint,
        latest: &MessageEnvelope,
    ) -> usize {
        let mut changed = 0usize;
        let mut remaining = Vec::new();
        for question in session.pending_questions.clone() {
            let matched = self
                .provider
                .match_answer(&question.field, &question.text, &latest.text)
                .await;
            match matched {
                Ok(m) if m.confidence >= MIN_ANSWER_CONFIDENCE && m.answer.is_some() => {
                    let answer = m.answer.unwrap_or_default();
                    if let Some(patch) = DraftPatch::for_field(&question.field, answer) {
                        match session.draft.apply(&[patch], &latest.id) {
                            Ok(n) if n > 0 => {
                                changed += n;
                                continue;
                            }
                            Ok(_) => {}
                            Err(e) => log::warn!("answer patch rejected: {}", e),
                        }
                    }
                    remaining.push(question);
                }
                Ok(_) => remaining.push(question),
                Err(e) => {
                    log::debug!("answer matching failed, keeping question open: {}", e);
                    remaining.push(question);
                }
            }
        }
        session.pending_questions = remaining;
        changed
    }

    /// The user delegated content to the system: generate each open field
    /// from the transcript instead of matching answers.
    async fn delegate_open_questions(
        &self,
        session: &mut Checkpoint,
        latest: &MessageEnvelope,
    ) -> usize {
        let context = transcript(session);
        let mut changed = 0usize;
        let questions = std::mem::take(&mut session.pending_questions);
        for question in questions {
            match self.provider.generate_field(&question.field, &context).await {
                Ok(value) => {
                    if let Some(patch) = DraftPatch::for_field(&question.field, value) {
                        match session.draft.apply(&[patch], &latest.id) {
                            Ok(n) => changed += n,
                            Err(e) => log::warn!("generated patch rejected: {}", e),
                        }
                    }
                }
                Err(e) => {
                    log::warn!("field generation failed, keeping question open: {}", e);
                    session.pending_questions.push(question);
                }
            }
        }
        changed
    }
}
