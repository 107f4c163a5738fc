//! Line-oriented driver for the capture/commit pipeline.
//!
//! Reads commands from stdin, one per line:
//!
//! ```text
//! msg <thread-id> <text...>      feed a message into the thread
//! approve <thread-id> [user]     approve the thread's current preview
//! hash <thread-id>               print the draft's content hash
//! quit
//! ```
//!
//! Without `--live`, tracker calls go to an in-process recorder, so the
//! whole pipeline (idempotency records included) can be exercised offline.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ticketsmith::commit::{
    CommitOrchestrator, InMemoryRecordStore, IssueTracker, JiraClient, RecordStore,
    RecordingTracker, SqliteRecordStore, TrackerDuplicateSearch,
};
use ticketsmith::config::StorageConfig;
use ticketsmith::flow::ConversationFlow;
use ticketsmith::llm::LlmProviderFactory;
use ticketsmith::session::{
    CheckpointStore, InMemoryCheckpointStore, MessageEnvelope, SessionRunner,
    SqliteCheckpointStore,
};
use ticketsmith::TicketsmithConfig;

#[derive(Parser, Debug)]
#[command(name = "ticketsmith", about = "Conversation-to-ticket capture pipeline")]
struct Cli {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the storage path (implies sqlite storage).
    #[arg(long)]
    db: Option<PathBuf>,

    /// Send commits to the configured Jira instance instead of the
    /// in-process recorder.
    #[arg(long, default_value_t = false)]
    live: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => TicketsmithConfig::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TicketsmithConfig::default(),
    };
    if let Some(db) = cli.db {
        config.storage = StorageConfig::Sqlite { path: db };
    }

    let (checkpoints, records): (Arc<dyn CheckpointStore>, Arc<dyn RecordStore>) =
        match &config.storage {
            StorageConfig::Memory => (
                Arc::new(InMemoryCheckpointStore::new()),
                Arc::new(InMemoryRecordStore::new()),
            ),
            StorageConfig::Sqlite { path } => (
                Arc::new(SqliteCheckpointStore::new(path.clone())?),
                Arc::new(SqliteRecordStore::new(path.clone())?),
            ),
        };

    let tracker: Arc<dyn IssueTracker> = if cli.live {
        Arc::new(JiraClient::new(config.tracker.clone())?)
    } else {
        tracing::info!("dry run: tracker calls are recorded in-process");
        Arc::new(RecordingTracker::new())
    };

    let provider = LlmProviderFactory::create_provider(config.llm.clone())?;
    let flow = ConversationFlow::new(
        provider,
        Arc::new(TrackerDuplicateSearch::new(tracker.clone())),
        config.flow.clone(),
    );
    let runner = SessionRunner::new(flow, checkpoints.clone());
    let orchestrator = CommitOrchestrator::new(
        records,
        tracker,
        checkpoints,
        runner.thread_locks(),
        config.tracker.clone(),
        config.retry.clone(),
    );

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("reading stdin")?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("quit"), _, _) => break,
            (Some("msg"), Some(thread_id), Some(text)) => {
                let envelope = MessageEnvelope::new(thread_id, whoami(), text);
                match runner.handle_message(envelope).await {
                    Ok(outcome) => println!("{}", outcome.render()),
                    Err(e) => eprintln!("error: {}", e),
                }
            }
            (Some("hash"), Some(thread_id), _) => {
                match runner.current_content_hash(thread_id).await {
                    Ok(Some(hash)) => println!("{}", hash),
                    Ok(None) => println!("no session for {}", thread_id),
                    Err(e) => eprintln!("error: {}", e),
                }
            }
            (Some("approve"), Some(thread_id), approver) => {
                let approver = approver.unwrap_or("cli-user").to_string();
                let hash = match runner.current_content_hash(thread_id).await {
                    Ok(Some(hash)) => hash,
                    Ok(None) => {
                        println!("no session for {}", thread_id);
                        continue;
                    }
                    Err(e) => {
                        eprintln!("error: {}", e);
                        continue;
                    }
                };
                match orchestrator
                    .approve_and_commit(thread_id, &hash, &approver)
                    .await
                {
                    Ok(outcome) => println!("{}", serde_json::to_string(&outcome)?),
                    Err(e) => eprintln!("error: {}", e),
                }
            }
            _ => eprintln!("usage: msg <thread> <text> | approve <thread> [user] | hash <thread> | quit"),
        }
    }
    Ok(())
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "cli-user".to_string())
}
