//! Per-request correlation state.
//!
//! Owned by one dispatcher task for the lifetime of one request. Tool calls are
//! keyed by their positional index within the current assistant message, with a
//! back-reference from `tool_use_id` to index. Upstream indices restart at 0 for
//! every assistant message, so [`ExecutionContext::reset_for_new_turn`] clears
//! everything except accumulated usage.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::backend::events::TokenUsage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallStatus {
    Running,
    Success,
    Error,
}

impl ToolCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCallStatus::Running => "running",
            ToolCallStatus::Success => "success",
            ToolCallStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolCallState {
    pub tool_use_id: String,
    pub tool_name: String,
    /// Raw JSON argument text, appended in arrival order.
    pub input_buffer: String,
    /// Input supplied with the start event, used when no deltas arrive.
    pub initial_input: Value,
    pub status: ToolCallStatus,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamMode {
    #[default]
    Text,
    Thinking,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("tool call index {index} already registered for {existing}")]
    DuplicateIndex { index: u32, existing: String },
    #[error("unknown tool_use_id {0}")]
    UnknownToolUse(String),
}

#[derive(Debug, Default)]
pub struct ExecutionContext {
    index_to_tool_call: HashMap<u32, ToolCallState>,
    tool_use_id_to_index: HashMap<String, u32>,
    mode: StreamMode,
    processed_usage_message_ids: HashSet<String>,
    accumulated_usage: TokenUsage,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a tool call at `index`. An occupied index is rejected and
    /// the existing call is kept.
    pub fn register_tool_call(
        &mut self,
        index: u32,
        tool_use_id: &str,
        tool_name: &str,
        initial_input: Value,
    ) -> Result<(), CorrelationError> {
        if let Some(existing) = self.index_to_tool_call.get(&index) {
            warn!(
                index,
                tool_use_id,
                existing = %existing.tool_use_id,
                "Tool call index already registered; ignoring start"
            );
            return Err(CorrelationError::DuplicateIndex {
                index,
                existing: existing.tool_use_id.clone(),
            });
        }

        self.index_to_tool_call.insert(
            index,
            ToolCallState {
                tool_use_id: tool_use_id.to_string(),
                tool_name: tool_name.to_string(),
                input_buffer: String::new(),
                initial_input,
                status: ToolCallStatus::Running,
                started_at: Utc::now(),
            },
        );
        self.tool_use_id_to_index
            .insert(tool_use_id.to_string(), index);
        Ok(())
    }

    /// Append a JSON fragment to the buffer at `index`. Returns the owning
    /// `tool_use_id`, or `None` when the index is unknown.
    pub fn append_tool_input(&mut self, index: u32, delta: &str) -> Option<&str> {
        match self.index_to_tool_call.get_mut(&index) {
            Some(state) => {
                state.input_buffer.push_str(delta);
                Some(state.tool_use_id.as_str())
            }
            None => {
                debug!(index, "Input delta for unknown tool call index");
                None
            }
        }
    }

    pub fn tool_call(&self, tool_use_id: &str) -> Option<&ToolCallState> {
        let index = self.tool_use_id_to_index.get(tool_use_id)?;
        self.index_to_tool_call.get(index)
    }

    /// Parse the accumulated input for `tool_use_id`.
    ///
    /// `None` means no structured input is available yet (empty or partial
    /// buffer), not a fault.
    pub fn resolve_accumulated_input(&self, tool_use_id: &str) -> Option<Value> {
        let state = self.tool_call(tool_use_id)?;
        if state.input_buffer.trim().is_empty() {
            return None;
        }
        match serde_json::from_str::<Value>(&state.input_buffer) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(tool_use_id, "Tool input not valid JSON yet: {}", e);
                None
            }
        }
    }

    /// The best input available for `tool_use_id`: the accumulated buffer if
    /// it parses, else a non-empty initial input.
    pub fn final_input(&self, tool_use_id: &str) -> Option<Value> {
        self.resolve_accumulated_input(tool_use_id).or_else(|| {
            self.tool_call(tool_use_id)
                .map(|state| state.initial_input.clone())
                .filter(|v| !is_empty_input(v))
        })
    }

    pub fn set_status(
        &mut self,
        tool_use_id: &str,
        status: ToolCallStatus,
    ) -> Result<(), CorrelationError> {
        let index = self
            .tool_use_id_to_index
            .get(tool_use_id)
            .ok_or_else(|| CorrelationError::UnknownToolUse(tool_use_id.to_string()))?;
        if let Some(state) = self.index_to_tool_call.get_mut(index) {
            state.status = status;
        }
        Ok(())
    }

    /// Add usage for `message_id` once. Returns whether it was counted.
    pub fn add_usage(&mut self, message_id: &str, usage: &TokenUsage) -> bool {
        if !self
            .processed_usage_message_ids
            .insert(message_id.to_string())
        {
            debug!(message_id, "Usage already counted for message");
            return false;
        }
        self.accumulated_usage.add(usage);
        true
    }

    pub fn accumulated_usage(&self) -> TokenUsage {
        self.accumulated_usage
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    /// Switch streaming mode, returning the previous one. Callers leaving
    /// `Thinking` for `Text` must finalize the thinking block first.
    pub fn switch_mode(&mut self, new_mode: StreamMode) -> StreamMode {
        std::mem::replace(&mut self.mode, new_mode)
    }

    pub fn running_tool_calls(&self) -> impl Iterator<Item = &ToolCallState> {
        self.index_to_tool_call
            .values()
            .filter(|s| s.status == ToolCallStatus::Running)
    }

    /// Clear per-turn state. Accumulated usage and the processed-message set
    /// persist for the whole request.
    pub fn reset_for_new_turn(&mut self) {
        self.index_to_tool_call.clear();
        self.tool_use_id_to_index.clear();
        self.mode = StreamMode::Text;
    }
}

fn is_empty_input(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}
