//! Configuration for the pipeline: TOML files with env-var overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::{TicketError, TicketResult};
use crate::llm::LlmProviderConfig;

/// Retry/backoff policy for external tracker calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts (first call included).
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

/// Bounds on the conversation state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Step budget for the extraction loop, persisted per session.
    pub max_steps: u32,
    /// Cap on the number of open questions surfaced in one ASK outcome.
    pub max_questions: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_steps: 10,
            max_questions: 3,
        }
    }
}

/// Target issue tracker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    pub base_url: Option<String>,
    pub project_key: String,
    pub default_priority: String,
    pub account_email: Option<String>,
    /// Read from `JIRA_API_TOKEN` when absent.
    #[serde(default)]
    pub api_token: Option<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            project_key: "PROJ".to_string(),
            default_priority: "Medium".to_string(),
            account_email: None,
            api_token: None,
        }
    }
}

impl TrackerConfig {
    pub fn resolved_api_token(&self) -> Option<String> {
        self.api_token
            .clone()
            .or_else(|| std::env::var("JIRA_API_TOKEN").ok())
    }
}

/// Where sessions and idempotency records live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageConfig {
    Memory,
    Sqlite { path: PathBuf },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TicketsmithConfig {
    pub llm: LlmProviderConfig,
    pub tracker: TrackerConfig,
    pub flow: FlowConfig,
    pub retry: RetryConfig,
    pub storage: StorageConfig,
}

impl TicketsmithConfig {
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> TicketResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| TicketError::Config(format!("read {}: {}", path.as_ref().display(), e)))?;
        toml::from_str(&raw).map_err(|e| TicketError::Config(e.to_string()))
    }
}
