//! # agent-relay
//!
//! Streaming execution and session reconciliation for a chat front-end over
//! an LLM coding agent.
//!
//! The agent runs either as a local CLI subprocess or behind a remote
//! delegate. Either way it emits newline-delimited JSON; this crate turns that
//! stream into an ordered sequence of caller-facing events, persists the
//! conversation, and keeps the caller's conversation id stable while the
//! upstream engine assigns (and sometimes rotates) its own session ids.
//!
//! ```text
//!   upstream (CLI / remote)
//!          │ NDJSON lines
//!          ▼
//!   ┌──────────────┐  ExecutionEvent   ┌────────────────────┐  ResponseEvent
//!   │ reader task  │ ───────────────▶ │ ResponseDispatcher │ ─────────────▶ caller
//!   │ EventParser  │  bounded channel  │ ExecutionContext   │
//!   └──────────────┘                   │ SessionReconciler  │
//!                                      └─────────┬──────────┘
//!                                                │ side effects
//!                                                ▼
//!                              ConversationStore, TitleGenerator
//! ```
//!
//! ## Modules
//! - `backend`: upstream engines, the line parser and the reader task
//! - `chat`: per-request correlation state, session reconciliation, dispatch
//! - `store`: conversation persistence (in-memory, SQLite)
//! - `title`: conversation title generation

pub mod backend;
pub mod chat;
pub mod config;
pub mod store;
pub mod title;
pub mod util;

pub use backend::events::{ExecutionError, ExecutionEvent, TokenUsage};
pub use chat::{ChatRequest, ChatService, ResponseEvent, TurnOutcome};
pub use config::Config;
pub use store::{ConversationStore, InMemoryConversationStore, SqliteConversationStore};
