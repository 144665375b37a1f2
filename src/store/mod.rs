//! Conversation storage with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `sqlite`: SQLite database
//!
//! Every write must tolerate being issued more than once: the dispatcher does
//! not retry, but neither does it guarantee exactly-once delivery across
//! process restarts.

mod memory;
mod sqlite;

pub use memory::InMemoryConversationStore;
pub use sqlite::SqliteConversationStore;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chat::context::ToolCallStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    Thinking,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Thinking => "thinking",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "thinking" => Some(MessageRole::Thinking),
            _ => None,
        }
    }
}

/// A conversation, keyed by the caller-stable internal id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    /// Session id assigned by the upstream engine; an attribute, never the key.
    pub upstream_id: Option<String>,
    pub model: Option<String>,
    pub title: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredToolCall {
    pub tool_use_id: String,
    pub conversation_id: String,
    pub tool_name: String,
    pub input: Option<Value>,
    pub output: Option<String>,
    pub status: String,
    pub started_at: String,
    pub finished_at: Option<String>,
}

/// Get current timestamp as RFC3339 string.
pub fn now_string() -> String {
    Utc::now().to_rfc3339()
}

/// Conversation store trait - implemented by all storage backends.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// Create the conversation record. Creating an existing id updates the
    /// upstream id and model when provided.
    async fn create_conversation(
        &self,
        internal_id: &str,
        upstream_id: Option<&str>,
        model: Option<&str>,
    ) -> Result<(), String>;

    /// Append a message to the conversation.
    async fn record_message(
        &self,
        internal_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<(), String>;

    /// Record a tool call as running. Repeated starts for one `tool_use_id` are ignored.
    async fn record_tool_call_start(
        &self,
        internal_id: &str,
        tool_use_id: &str,
        tool_name: &str,
        input: &Value,
    ) -> Result<(), String>;

    /// Finalize a tool call with its resolved input, output and status.
    async fn record_tool_call_finish(
        &self,
        tool_use_id: &str,
        input: Option<&Value>,
        output: &str,
        status: ToolCallStatus,
    ) -> Result<(), String>;

    /// Replace the stored upstream id for a conversation.
    async fn update_upstream_id(&self, internal_id: &str, upstream_id: &str) -> Result<(), String>;

    async fn update_conversation_title(&self, internal_id: &str, title: &str)
        -> Result<(), String>;

    async fn get_conversation(&self, internal_id: &str) -> Result<Option<Conversation>, String>;

    /// Messages in insertion order.
    async fn list_messages(&self, internal_id: &str) -> Result<Vec<StoredMessage>, String>;

    async fn get_tool_call(&self, tool_use_id: &str) -> Result<Option<StoredToolCall>, String>;
}
