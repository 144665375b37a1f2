//! Decoder for the NDJSON `stream-json` protocol spoken by the agent CLI.
//!
//! One upstream line maps to zero or more [`ExecutionEvent`]s. The parser is
//! total: malformed lines are logged and skipped. Session identifiers are
//! picked up from any line that carries one, regardless of its type.
//!
//! With partial messages enabled the CLI streams `content_block_*` deltas and
//! then repeats the complete message as an `assistant` line. The parser tracks
//! which upstream message has already been streamed so text is emitted once.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::events::{ExecutionEvent, TokenUsage};
use crate::util::excerpt;

const STREAM_EVENT_TYPES: &[&str] = &[
    "message_start",
    "content_block_start",
    "content_block_delta",
    "content_block_stop",
    "message_delta",
    "message_stop",
];

// ── Wire types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum CliEvent {
    #[serde(rename = "system")]
    System(SystemEvent),
    #[serde(rename = "stream_event")]
    StreamEvent(StreamEventWrapper),
    #[serde(rename = "assistant")]
    Assistant(AssistantEvent),
    #[serde(rename = "user")]
    User(UserEvent),
    #[serde(rename = "result")]
    Result(ResultEvent),
    #[serde(rename = "error")]
    Error(ErrorEvent),
    #[serde(rename = "tool_progress")]
    ToolProgress(ToolProgressEvent),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
struct SystemEvent {
    #[serde(default)]
    subtype: String,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamEventWrapper {
    event: StreamEvent,
    #[serde(default)]
    parent_tool_use_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "message_start")]
    MessageStart {
        #[serde(default)]
        message: Value,
    },
    #[serde(rename = "content_block_start")]
    ContentBlockStart {
        index: u32,
        content_block: ContentBlockInfo,
    },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: u32, delta: Delta },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: u32 },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
struct ContentBlockInfo {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct Delta {
    #[serde(rename = "type")]
    delta_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    partial_json: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AssistantEvent {
    message: AssistantMessage,
    #[serde(default)]
    parent_tool_use_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
}

impl From<WireUsage> for TokenUsage {
    fn from(u: WireUsage) -> Self {
        TokenUsage {
            input_tokens: u.input_tokens.unwrap_or(0),
            output_tokens: u.output_tokens.unwrap_or(0),
            cache_creation_tokens: u.cache_creation_input_tokens.unwrap_or(0),
            cache_read_tokens: u.cache_read_input_tokens.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<ToolResultContent>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
    #[serde(other)]
    Other,
}

/// Tool result content: plain text or an array of content blocks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ToolResultContent {
    Text(String),
    Structured(Vec<Value>),
}

impl ToolResultContent {
    fn to_string_lossy(&self) -> String {
        match self {
            ToolResultContent::Text(s) => s.clone(),
            ToolResultContent::Structured(items) => {
                let parts: Vec<String> = items
                    .iter()
                    .filter_map(|item| {
                        let obj = item.as_object()?;
                        if obj.get("type").and_then(Value::as_str) == Some("image") {
                            Some("[image]".to_string())
                        } else {
                            obj.get("text").and_then(Value::as_str).map(str::to_string)
                        }
                    })
                    .collect();
                if parts.is_empty() {
                    serde_json::to_string(items).unwrap_or_default()
                } else {
                    parts.join("\n")
                }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct UserEvent {
    message: UserMessage,
    #[serde(default)]
    parent_tool_use_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct UserMessage {
    #[serde(default)]
    content: UserContent,
}

/// User content is a plain prompt string or a list of blocks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum UserContent {
    Blocks(Vec<ContentBlock>),
    Text(String),
}

impl Default for UserContent {
    fn default() -> Self {
        UserContent::Blocks(Vec::new())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ResultEvent {
    #[serde(default)]
    subtype: String,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    errors: Vec<String>,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    num_turns: Option<u32>,
}

impl ResultEvent {
    fn is_failure(&self) -> bool {
        let text = self.result.as_deref().unwrap_or("");
        let looks_like_api_error = text.starts_with("API Error:")
            || text.contains("\"type\":\"error\"")
            || text.contains("\"type\":\"overloaded_error\"")
            || text.contains("\"type\":\"api_error\"");
        self.is_error || self.subtype.starts_with("error") || looks_like_api_error
    }

    /// Best available failure message: `result`, `error`, `message`, then `errors[0]`.
    fn error_message(&self) -> String {
        let non_empty = |s: &Option<String>| s.clone().filter(|s| !s.is_empty());
        let raw = non_empty(&self.result)
            .or_else(|| non_empty(&self.error))
            .or_else(|| non_empty(&self.message))
            .or_else(|| self.errors.first().filter(|s| !s.is_empty()).cloned())
            .unwrap_or_else(|| format!("Upstream reported failure ({})", self.subtype));
        unwrap_embedded_error(&raw).unwrap_or(raw)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorEvent {
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    message: Option<String>,
}

impl ErrorEvent {
    fn message(&self) -> String {
        let from_error = match &self.error {
            Some(Value::String(s)) => Some(s.clone()),
            Some(v) => v.get("message").and_then(Value::as_str).map(str::to_string),
            None => None,
        };
        from_error
            .or_else(|| self.message.clone())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "Unknown upstream error".to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ToolProgressEvent {
    tool_use_id: String,
    #[serde(default, alias = "elapsed_seconds")]
    elapsed_time_seconds: f64,
}

/// Error strings such as `402 {"error":{"message":"..."}}` carry a JSON payload.
fn unwrap_embedded_error(raw: &str) -> Option<String> {
    let json_str = raw.find('{').map(|idx| &raw[idx..])?;
    let parsed: Value = serde_json::from_str(json_str).ok()?;
    parsed
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .or_else(|| parsed.get("message").and_then(Value::as_str))
        .map(str::to_string)
}

/// Find a session identifier anywhere the engine is known to put one.
fn discover_session_id(value: &Value) -> Option<String> {
    let lookup = |v: &Value| {
        v.get("session_id")
            .or_else(|| v.get("sessionId"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    lookup(value).or_else(|| value.get("message").and_then(lookup))
}

// ── Parser ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    ToolUse,
    Other,
}

/// Stateful line decoder for one request.
#[derive(Debug, Default)]
pub struct EventParser {
    current_message_id: Option<String>,
    /// Partial deltas were seen for the current message.
    streamed: bool,
    /// Position of the next block taken from a non-streamed `assistant` line.
    block_cursor: u32,
    block_kinds: HashMap<u32, BlockKind>,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one line. Never fails; unusable input yields no events.
    pub fn parse_line(&mut self, line: &str) -> Vec<ExecutionEvent> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(v @ Value::Object(_)) => v,
            Ok(_) => {
                debug!("Skipping non-object upstream line: {}", excerpt(line, 200));
                return Vec::new();
            }
            Err(e) => {
                warn!(
                    "Failed to parse upstream event: {} - line: {}",
                    e,
                    excerpt(line, 200)
                );
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        if let Some(session_id) = discover_session_id(&value) {
            events.push(ExecutionEvent::SessionId { value: session_id });
        }

        let event_type = value.get("type").and_then(Value::as_str).unwrap_or("");
        let decoded = if STREAM_EVENT_TYPES.contains(&event_type) {
            StreamEvent::deserialize(&value).map(|event| {
                CliEvent::StreamEvent(StreamEventWrapper {
                    event,
                    parent_tool_use_id: None,
                })
            })
        } else {
            CliEvent::deserialize(&value)
        };

        match decoded {
            Ok(event) => self.convert(event, &mut events),
            Err(e) => {
                warn!(
                    event_type,
                    "Malformed upstream event: {} - line: {}",
                    e,
                    excerpt(line, 200)
                );
            }
        }

        if events.is_empty() {
            events.push(ExecutionEvent::Unrecognized);
        }
        events
    }

    fn begin_message(&mut self, message_id: Option<String>, events: &mut Vec<ExecutionEvent>) {
        self.current_message_id = message_id.clone();
        self.streamed = false;
        self.block_cursor = 0;
        self.block_kinds.clear();
        events.push(ExecutionEvent::TurnStart { message_id });
    }

    fn convert(&mut self, event: CliEvent, events: &mut Vec<ExecutionEvent>) {
        match event {
            CliEvent::System(sys) => {
                debug!(subtype = %sys.subtype, model = ?sys.model, "Upstream system event");
            }
            CliEvent::StreamEvent(wrapper) => {
                if wrapper.parent_tool_use_id.is_some() {
                    debug!("Skipping sub-agent stream event");
                    return;
                }
                self.convert_stream_event(wrapper.event, events);
            }
            CliEvent::Assistant(evt) => {
                if evt.parent_tool_use_id.is_some() {
                    debug!("Skipping sub-agent assistant message");
                    return;
                }
                self.convert_assistant(evt.message, events);
            }
            CliEvent::User(evt) => {
                if evt.parent_tool_use_id.is_some() {
                    debug!("Skipping sub-agent tool results");
                    return;
                }
                let UserContent::Blocks(blocks) = evt.message.content else {
                    return;
                };
                for block in blocks {
                    if let ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } = block
                    {
                        let output = content
                            .map(|c| c.to_string_lossy())
                            .unwrap_or_default();
                        if is_error {
                            events.push(ExecutionEvent::ToolError {
                                tool_use_id,
                                output,
                            });
                        } else {
                            events.push(ExecutionEvent::ToolResult {
                                tool_use_id,
                                output,
                                is_error: false,
                            });
                        }
                    }
                }
            }
            CliEvent::Result(res) => {
                if res.is_failure() {
                    events.push(ExecutionEvent::error(res.error_message()));
                } else {
                    debug!(
                        "Upstream result: subtype={}, duration={:?}ms, turns={:?}",
                        res.subtype, res.duration_ms, res.num_turns
                    );
                    events.push(ExecutionEvent::Done {
                        final_text: res.result.unwrap_or_default(),
                    });
                }
            }
            CliEvent::Error(err) => {
                events.push(ExecutionEvent::error(err.message()));
            }
            CliEvent::ToolProgress(progress) => {
                events.push(ExecutionEvent::ToolProgress {
                    tool_use_id: progress.tool_use_id,
                    elapsed_seconds: progress.elapsed_time_seconds,
                });
            }
            CliEvent::Unknown => {}
        }
    }

    fn convert_stream_event(&mut self, event: StreamEvent, events: &mut Vec<ExecutionEvent>) {
        match event {
            StreamEvent::MessageStart { message } => {
                let message_id = message
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                self.begin_message(message_id, events);
                self.streamed = true;
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                self.streamed = true;
                let kind = match content_block.block_type.as_str() {
                    "text" => BlockKind::Text,
                    "thinking" => BlockKind::Thinking,
                    "tool_use" => BlockKind::ToolUse,
                    _ => BlockKind::Other,
                };
                self.block_kinds.insert(index, kind);
                match kind {
                    BlockKind::ToolUse => {
                        if let (Some(id), Some(name)) = (content_block.id, content_block.name) {
                            events.push(ExecutionEvent::ToolStart {
                                index,
                                tool_use_id: id,
                                tool_name: name,
                                input: content_block.input.unwrap_or(Value::Null),
                            });
                        } else {
                            warn!(index, "tool_use block without id or name");
                        }
                    }
                    BlockKind::Text => {
                        if let Some(text) = content_block.text.filter(|t| !t.is_empty()) {
                            events.push(ExecutionEvent::Chunk { text });
                        }
                    }
                    _ => {}
                }
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                self.streamed = true;
                let in_thinking_block = self.block_kinds.get(&index) == Some(&BlockKind::Thinking);
                match delta.delta_type.as_str() {
                    "thinking_delta" => {
                        if let Some(text) = delta.thinking.or(delta.text).filter(|t| !t.is_empty())
                        {
                            events.push(ExecutionEvent::Thinking { text });
                        }
                    }
                    "text_delta" => {
                        if let Some(text) = delta.text.filter(|t| !t.is_empty()) {
                            if in_thinking_block {
                                events.push(ExecutionEvent::Thinking { text });
                            } else {
                                events.push(ExecutionEvent::Chunk { text });
                            }
                        }
                    }
                    "input_json_delta" => {
                        if let Some(partial) = delta.partial_json.filter(|p| !p.is_empty()) {
                            events.push(ExecutionEvent::ToolInputDelta {
                                index,
                                delta: partial,
                            });
                        }
                    }
                    other => {
                        debug!(index, delta_type = other, "Ignoring delta");
                    }
                }
            }
            StreamEvent::ContentBlockStop { index } => {
                if self.block_kinds.get(&index) == Some(&BlockKind::Thinking) {
                    events.push(ExecutionEvent::ThinkingEnd);
                }
            }
            StreamEvent::Other => {}
        }
    }

    fn convert_assistant(&mut self, message: AssistantMessage, events: &mut Vec<ExecutionEvent>) {
        if message.id.is_some() && message.id != self.current_message_id {
            if self.current_message_id.is_none() && self.streamed {
                // Bare deltas without a message_start belong to this message.
                self.current_message_id = message.id.clone();
            } else {
                self.begin_message(message.id.clone(), events);
            }
        }

        if let (Some(id), Some(usage)) = (message.id.clone(), message.usage) {
            events.push(ExecutionEvent::Usage {
                message_id: id,
                usage: usage.into(),
            });
        }

        if self.streamed {
            // Content already arrived through partial deltas.
            return;
        }

        for block in message.content {
            let index = self.block_cursor;
            self.block_cursor += 1;
            match block {
                ContentBlock::Text { text } => {
                    if !text.is_empty() {
                        events.push(ExecutionEvent::Chunk { text });
                    }
                }
                ContentBlock::Thinking { thinking } => {
                    if !thinking.is_empty() {
                        events.push(ExecutionEvent::Thinking { text: thinking });
                        events.push(ExecutionEvent::ThinkingEnd);
                    }
                }
                ContentBlock::ToolUse { id, name, input } => {
                    events.push(ExecutionEvent::ToolStart {
                        index,
                        tool_use_id: id,
                        tool_name: name,
                        input,
                    });
                }
                ContentBlock::ToolResult { .. } | ContentBlock::Other => {}
            }
        }
    }
}
