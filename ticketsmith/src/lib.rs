//! Ticketsmith: requirement capture and idempotent commit.
//!
//! Turns a free-form conversation thread into a structured ticket draft,
//! asks for whatever is missing, surfaces a preview for human approval,
//! and commits the approved draft to an external issue tracker exactly
//! once per (session, content hash), regardless of retries, double
//! clicks, or concurrent approvals.
//!
//! The crate is organised along the pipeline:
//!
//! - [`draft`]: the accumulating ticket draft, patches, evidence, and the
//!   canonical content hash.
//! - [`intent`]: two-tier message routing (rules first, model fallback).
//! - [`llm`]: the language-model boundary and its deterministic stub.
//! - [`flow`]: the bounded per-turn state machine.
//! - [`session`]: per-thread serialization and checkpoint persistence.
//! - [`commit`]: approval records, operation claims, and the tracker
//!   client behind the exactly-once guarantee.

pub mod commit;
pub mod config;
pub mod draft;
pub mod errors;
pub mod flow;
pub mod intent;
pub mod llm;
pub mod session;

pub use commit::{ApprovalOutcome, CommitOrchestrator};
pub use config::TicketsmithConfig;
pub use draft::{DraftPatch, TicketDraft};
pub use errors::{TicketError, TicketResult, TrackerError};
pub use flow::{ConversationFlow, TurnOutcome};
pub use session::{MessageEnvelope, SessionRunner, ThreadLocks};
