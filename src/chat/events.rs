//! Caller-facing events. The upstream session id never appears here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::events::TokenUsage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseEvent {
    TextChunk {
        content: String,
    },
    ThinkingChunk {
        content: String,
    },
    /// Closes a reasoning block; `content` is the whole block.
    ThinkingEnd {
        content: String,
    },
    ToolStart {
        tool_use_id: String,
        tool_name: String,
        input: Value,
    },
    ToolInputDelta {
        tool_use_id: String,
        delta: String,
    },
    ToolProgress {
        tool_use_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        elapsed_seconds: f64,
    },
    ToolResult {
        tool_use_id: String,
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        output: String,
    },
    ToolError {
        tool_use_id: String,
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        output: String,
    },
    /// The conversation now has a stable internal id.
    SessionBound {
        session_id: String,
    },
    Done {
        session_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
    Error {
        message: String,
        /// Cause category: upstream, process, timeout or cancelled.
        kind: String,
    },
}

impl ResponseEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            ResponseEvent::TextChunk { .. } => "text_chunk",
            ResponseEvent::ThinkingChunk { .. } => "thinking_chunk",
            ResponseEvent::ThinkingEnd { .. } => "thinking_end",
            ResponseEvent::ToolStart { .. } => "tool_start",
            ResponseEvent::ToolInputDelta { .. } => "tool_input_delta",
            ResponseEvent::ToolProgress { .. } => "tool_progress",
            ResponseEvent::ToolResult { .. } => "tool_result",
            ResponseEvent::ToolError { .. } => "tool_error",
            ResponseEvent::SessionBound { .. } => "session_bound",
            ResponseEvent::Done { .. } => "done",
            ResponseEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ResponseEvent::Done { .. } | ResponseEvent::Error { .. })
    }
}
