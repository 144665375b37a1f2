use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Token counters reported by the upstream engine for one assistant message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

impl TokenUsage {
    pub fn has_usage(&self) -> bool {
        self.input_tokens > 0
            || self.output_tokens > 0
            || self.cache_creation_tokens > 0
            || self.cache_read_tokens > 0
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cache_creation_tokens = self
            .cache_creation_tokens
            .saturating_add(other.cache_creation_tokens);
        self.cache_read_tokens = self.cache_read_tokens.saturating_add(other.cache_read_tokens);
    }
}

/// Why a turn ended in failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The upstream engine reported an error (explicit `error` line or failed `result`).
    #[error("{0}")]
    Upstream(String),
    /// The process or connection failed without usable output.
    #[error("upstream process failed: {0}")]
    Process(String),
    /// The request deadline passed before the turn completed.
    #[error("upstream timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("request cancelled")]
    Cancelled,
}

impl ExecutionError {
    /// Short machine-readable cause, forwarded alongside the message.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::Upstream(_) => "upstream",
            ExecutionError::Process(_) => "process",
            ExecutionError::Timeout(_) => "timeout",
            ExecutionError::Cancelled => "cancelled",
        }
    }
}

/// Normalized events decoded from the upstream stream, in wire order.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// Plain assistant text fragment.
    Chunk { text: String },
    /// Extended-reasoning fragment.
    Thinking { text: String },
    /// The current reasoning block is complete.
    ThinkingEnd,
    /// A new upstream assistant message begins; per-turn correlation state resets.
    TurnStart { message_id: Option<String> },
    ToolStart {
        index: u32,
        tool_use_id: String,
        tool_name: String,
        input: Value,
    },
    /// Fragment of a tool's JSON arguments, concatenated in arrival order.
    ToolInputDelta { index: u32, delta: String },
    ToolProgress {
        tool_use_id: String,
        elapsed_seconds: f64,
    },
    ToolResult {
        tool_use_id: String,
        output: String,
        is_error: bool,
    },
    ToolError { tool_use_id: String, output: String },
    /// Token usage attached to an upstream message id.
    Usage {
        message_id: String,
        usage: TokenUsage,
    },
    /// The upstream engine's identifier for this conversation.
    SessionId { value: String },
    /// The turn is complete. `final_text` is whatever the engine reported as its result.
    Done { final_text: String },
    /// The turn failed; terminal.
    Error { cause: ExecutionError },
    /// A decoded line with no meaning for this core.
    Unrecognized,
}

impl ExecutionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionEvent::Done { .. } | ExecutionEvent::Error { .. })
    }

    pub fn error(message: impl Into<String>) -> Self {
        ExecutionEvent::Error {
            cause: ExecutionError::Upstream(message.into()),
        }
    }
}
