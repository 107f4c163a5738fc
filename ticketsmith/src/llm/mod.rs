//! LLM provider abstraction.
//!
//! The state machine talks to the model through [`LlmProvider`], so the
//! pipeline works the same against an OpenAI-compatible endpoint or the
//! deterministic stub used in tests. Providers never fail a conversation
//! turn: callers treat provider errors as "no new information".

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::draft::DraftPatch;
use crate::errors::{TicketError, TicketResult};
use crate::intent::MessageIntent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderType {
    Stub,
    OpenAi,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmProviderConfig {
    pub provider_type: LlmProviderType,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub timeout_seconds: Option<u64>,
}

impl Default for LlmProviderConfig {
    fn default() -> Self {
        Self {
            provider_type: LlmProviderType::Stub,
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            base_url: None,
            max_tokens: Some(1024),
            temperature: Some(0.2),
            timeout_seconds: Some(30),
        }
    }
}

/// Result of matching one open question against a user response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerMatch {
    pub answer: Option<String>,
    pub confidence: f64,
}

impl AnswerMatch {
    pub fn none() -> Self {
        Self {
            answer: None,
            confidence: 0.0,
        }
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Classify a message that the deterministic rules could not place.
    async fn classify_intent(&self, text: &str) -> TicketResult<MessageIntent>;

    /// Extract draft patches from the latest message.
    async fn extract_patches(&self, text: &str) -> TicketResult<Vec<DraftPatch>>;

    /// Generate content for a field the user delegated to the system.
    async fn generate_field(&self, field: &str, context: &str) -> TicketResult<String>;

    /// Match one open question (tied to `field`) against a response.
    async fn match_answer(
        &self,
        field: &str,
        question: &str,
        response: &str,
    ) -> TicketResult<AnswerMatch>;
}

pub struct LlmProviderFactory;

impl LlmProviderFactory {
    pub fn create_provider(
        config: LlmProviderConfig,
    ) -> TicketResult<Arc<dyn LlmProvider>> {
        match config.provider_type {
            LlmProviderType::Stub => Ok(Arc::new(StubLlmProvider::new())),
            LlmProviderType::OpenAi => Ok(Arc::new(OpenAiCompatProvider::new(config)?)),
        }
    }

    /// Probe the environment for an API key; fall back to the stub so the
    /// pipeline stays usable offline.
    pub fn default_from_env() -> TicketResult<Arc<dyn LlmProvider>> {
        if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
            let config = LlmProviderConfig {
                provider_type: LlmProviderType::OpenAi,
                model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
                api_key: Some(api_key),
                base_url: std::env::var("OPENAI_BASE_URL").ok(),
                ..Default::default()
            };
            return Self::create_provider(config);
        }
        Ok(Arc::new(StubLlmProvider::new()))
    }
}

// ---------------------------------------------------------------------------
// Stub provider
// ---------------------------------------------------------------------------

/// Deterministic provider for tests and offline runs. Extraction uses the
/// small comma-separated grammar exercised by the test suite; answer
/// matching looks for `field: value` markers.
pub struct StubLlmProvider;

impl StubLlmProvider {
    pub fn new() -> Self {
        Self
    }

    fn field_marker(field: &str) -> String {
        format!("{}:", field.replace('_', " "))
    }
}

/// Byte offset just past the first occurrence of the ASCII `marker`,
/// compared case-insensitively. Offsets are computed on `text` itself, so
/// they stay valid for slicing even when lowercasing would change byte
/// lengths (e.g. 'İ').
fn find_marker_end(text: &str, marker: &str) -> Option<usize> {
    let haystack = text.as_bytes();
    let needle = marker.as_bytes();
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .find(|&i| haystack[i..i + needle.len()].eq_ignore_ascii_case(needle))
        .map(|i| i + needle.len())
}

/// Case-insensitive strip of an ASCII prefix, slicing the original string.
fn strip_prefix_ci<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let needle = prefix.as_bytes();
    match text.as_bytes().get(..needle.len()) {
        Some(head) if head.eq_ignore_ascii_case(needle) => Some(&text[needle.len()..]),
        _ => None,
    }
}

impl Default for StubLlmProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for StubLlmProvider {
    async fn classify_intent(&self, _text: &str) -> TicketResult<MessageIntent> {
        Ok(MessageIntent::CreateTicket)
    }

    async fn extract_patches(&self, text: &str) -> TicketResult<Vec<DraftPatch>> {
        // Direct `field: value` form first (answers sent without a pending
        // question still land on the right field).
        for field in ["title", "problem", "solution"] {
            let marker = format!("{}:", field);
            if let Some(end) = find_marker_end(text, &marker) {
                let value = text[end..].trim().to_string();
                if !value.is_empty() {
                    return Ok(DraftPatch::for_field(field, value).into_iter().collect());
                }
            }
        }

        // Comma-separated capture grammar:
        //   "create a story: <title>, <problem...>, done when <criterion>"
        let body = match text.split_once(':') {
            Some((head, rest)) if head.to_lowercase().split_whitespace().any(|w| {
                matches!(w, "create" | "story" | "ticket" | "bug" | "task" | "issue" | "epic")
            }) =>
            {
                rest
            }
            _ => text,
        };

        let mut patches = Vec::new();
        let mut problem_parts: Vec<&str> = Vec::new();
        for segment in body.split(',') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            if let Some(rest) = strip_prefix_ci(segment, "done when") {
                patches.push(DraftPatch::AcceptanceCriterion(rest.trim().to_string()));
            } else if !patches.iter().any(|p| matches!(p, DraftPatch::Title(_))) {
                patches.push(DraftPatch::Title(segment.to_string()));
            } else {
                problem_parts.push(segment);
            }
        }
        if !problem_parts.is_empty() {
            patches.push(DraftPatch::Problem(problem_parts.join(", ")));
        }
        Ok(patches)
    }

    async fn generate_field(&self, field: &str, _context: &str) -> TicketResult<String> {
        let text = match field {
            "title" => "Captured from conversation",
            "problem" => "Problem statement delegated to the system",
            "solution" => "Proposed solution delegated to the system",
            "acceptance_criterion" => "Outcome demonstrated and verified by the requester",
            other => return Ok(format!("Generated value for {}", other)),
        };
        Ok(text.to_string())
    }

    async fn match_answer(
        &self,
        field: &str,
        _question: &str,
        response: &str,
    ) -> TicketResult<AnswerMatch> {
        let markers = [Self::field_marker(field), format!("{}:", field)];
        for marker in markers {
            if let Some(end) = find_marker_end(response, &marker) {
                let answer = response[end..].trim();
                if !answer.is_empty() {
                    return Ok(AnswerMatch {
                        answer: Some(answer.to_string()),
                        confidence: 0.9,
                    });
                }
            }
        }
        if field == "acceptance_criterion" {
            if let Some(end) = find_marker_end(response, "done when") {
                let answer = response[end..].trim();
                if !answer.is_empty() {
                    return Ok(AnswerMatch {
                        answer: Some(answer.to_string()),
                        confidence: 0.8,
                    });
                }
            }
        }
        Ok(AnswerMatch::none())
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible provider
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Works with OpenAI and any endpoint speaking the same chat-completions
/// dialect (OpenRouter, local gateways).
pub struct OpenAiCompatProvider {
    config: LlmProviderConfig,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(config: LlmProviderConfig) -> TicketResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(
                config.timeout_seconds.unwrap_or(30),
            ))
            .build()
            .map_err(|e| TicketError::Llm(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    async fn make_request(&self, system: &str, user: &str) -> TicketResult<String> {
        let api_key = self
            .config
            .api_key
            .as_ref()
            .ok_or_else(|| TicketError::Llm("API key required for OpenAI provider".to_string()))?;
        let base_url = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1");
        let url = format!("{}/chat/completions", base_url);

        let request_body = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await
            .map_err(|e| TicketError::Llm(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let raw_body = response
            .text()
            .await
            .map_err(|e| TicketError::Llm(format!("failed to read response body: {}", e)))?;
        if !status.is_success() {
            return Err(TicketError::Llm(format!(
                "API returned {}: {}",
                status, raw_body
            )));
        }

        let parsed: ChatResponse = serde_json::from_str(&raw_body)
            .map_err(|e| TicketError::Llm(format!("unexpected response shape: {}", e)))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| TicketError::Llm("response contained no choices".to_string()))
    }
}

/// Extract the first balanced JSON array or object from a text blob; models
/// routinely wrap JSON in prose or code fences.
fn extract_json_block(text: &str) -> Option<&str> {
    let start = text.find(['[', '{'])?;
    let open = text.as_bytes()[start] as char;
    let close = if open == '[' { ']' } else { '}' };
    let mut depth = 0usize;
    let mut in_string = false;
    let mut prev = '\0';
    for (idx, ch) in text[start..].char_indices() {
        match ch {
            '"' if prev != '\\' => in_string = !in_string,
            c if !in_string && c == open => depth += 1,
            c if !in_string && c == close => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + idx + 1]);
                }
            }
            _ => {}
        }
        prev = ch;
    }
    None
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn classify_intent(&self, text: &str) -> TicketResult<MessageIntent> {
        let system = "Classify the message into exactly one label: \
                      create_ticket, review, act_on_existing, approval, conversational. \
                      Answer with the label only.";
        let content = self.make_request(system, text).await?;
        let label = content.trim().trim_matches('"').to_lowercase();
        MessageIntent::from_label(&label)
            .ok_or_else(|| TicketError::Llm(format!("unrecognized intent label: {}", label)))
    }

    async fn extract_patches(&self, text: &str) -> TicketResult<Vec<DraftPatch>> {
        let system = "Extract ticket fields from the message as a JSON array. \
                      Each element: {\"field\": one of title|problem|solution|\
                      acceptance_criterion|constraint|risk|dependency|parent_epic, \
                      \"value\": string (for constraint: {\"key\",\"value\",\"status\"})}. \
                      Emit [] when nothing is extractable. JSON only.";
        let content = self.make_request(system, text).await?;
        let block = extract_json_block(&content)
            .ok_or_else(|| TicketError::Llm("no JSON array in extraction response".to_string()))?;
        let patches: Vec<DraftPatch> = serde_json::from_str(block)
            .map_err(|e| TicketError::Llm(format!("invalid patch JSON: {}", e)))?;
        Ok(patches)
    }

    async fn generate_field(&self, field: &str, context: &str) -> TicketResult<String> {
        let system = format!(
            "Write the `{}` field of an issue ticket from the conversation below. \
             Respond with the field text only.",
            field
        );
        let content = self.make_request(&system, context).await?;
        Ok(content.trim().to_string())
    }

    async fn match_answer(
        &self,
        field: &str,
        question: &str,
        response: &str,
    ) -> TicketResult<AnswerMatch> {
        let system = format!(
            "The user was asked: \"{}\" (ticket field `{}`). Decide whether the \
             message below answers it. Respond with JSON \
             {{\"answer\": string or null, \"confidence\": 0.0-1.0}}.",
            question, field
        );
        let content = self.make_request(&system, response).await?;
        let block = extract_json_block(&content)
            .ok_or_else(|| TicketError::Llm("no JSON in answer-match response".to_string()))?;
        let matched: AnswerMatch = serde_json::from_str(block)
            .map_err(|e| TicketError::Llm(format!("invalid answer-match JSON: {}", e)))?;
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_extracts_title_problem_and_criterion() {
        let provider = StubLlmProvider::new();
        let patches = provider
            .extract_patches(
                "create a story: search is slow, fix p95 under 500ms, done when p95<500ms",
            )
            .await
            .unwrap();
        assert!(patches.contains(&DraftPatch::Title("search is slow".to_string())));
        assert!(patches.contains(&DraftPatch::Problem("fix p95 under 500ms".to_string())));
        assert!(patches.contains(&DraftPatch::AcceptanceCriterion("p95<500ms".to_string())));
    }

    #[tokio::test]
    async fn stub_extracts_direct_field_form() {
        let provider = StubLlmProvider::new();
        let patches = provider.extract_patches("title: Fix login flow").await.unwrap();
        assert_eq!(patches, vec![DraftPatch::Title("Fix login flow".to_string())]);
    }

    #[tokio::test]
    async fn stub_matches_marked_answers_only() {
        let provider = StubLlmProvider::new();
        let hit = provider
            .match_answer("title", "What should the title be?", "title: Slow search")
            .await
            .unwrap();
        assert_eq!(hit.answer.as_deref(), Some("Slow search"));
        assert!(hit.confidence >= 0.5);

        let miss = provider
            .match_answer("problem", "What is the problem?", "title: Slow search")
            .await
            .unwrap();
        assert!(miss.answer.is_none());
    }

    #[tokio::test]
    async fn multibyte_text_around_markers_is_sliced_safely() {
        // 'İ' lowercases to two chars, so byte offsets computed on a
        // lowercased copy would not be valid for the original string.
        let provider = StubLlmProvider::new();
        let patches = provider.extract_patches("İ title:ék").await.unwrap();
        assert_eq!(patches, vec![DraftPatch::Title("ék".to_string())]);

        let hit = provider
            .match_answer("title", "What should the title be?", "İ title:ék")
            .await
            .unwrap();
        assert_eq!(hit.answer.as_deref(), Some("ék"));

        let criteria = provider
            .extract_patches("create a ticket: İİİ thing, done when ça marche")
            .await
            .unwrap();
        assert!(criteria.contains(&DraftPatch::AcceptanceCriterion("ça marche".to_string())));
    }

    #[test]
    fn json_block_extraction_skips_prose_and_fences() {
        let text = "Sure! Here you go:\n```json\n[{\"field\":\"title\",\"value\":\"x\"}]\n```";
        assert_eq!(
            extract_json_block(text),
            Some("[{\"field\":\"title\",\"value\":\"x\"}]")
        );
        assert!(extract_json_block("no json here").is_none());
    }
}
