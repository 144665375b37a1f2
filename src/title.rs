//! Conversation title generation.
//!
//! Titles are generated once per new conversation, after the first turn has
//! been delivered. The work runs on a detached task; failures are logged and
//! never reach the caller.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::ConversationStore;
use crate::util::safe_truncate_index;

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const MAX_TITLE_CHARS: usize = 60;
/// Context sent to the model is capped per side.
const MAX_CONTEXT_BYTES: usize = 2000;

const TITLE_PROMPT: &str = "Write a short title (at most six words) for a conversation that \
starts with the exchange below. Reply with the title only, no quotes or punctuation at the end.";

#[derive(Debug, Error)]
pub enum TitleError {
    #[error("title request failed: {0}")]
    Request(String),
    #[error("title request returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("title response could not be parsed: {0}")]
    Parse(String),
    #[error("generated title was empty")]
    Empty,
}

#[async_trait]
pub trait TitleGenerator: Send + Sync {
    async fn generate_title(
        &self,
        user_text: &str,
        assistant_text: &str,
    ) -> Result<String, TitleError>;
}

/// Derives a title from the first line of the user's message.
#[derive(Debug, Clone, Default)]
pub struct HeuristicTitleGenerator;

#[async_trait]
impl TitleGenerator for HeuristicTitleGenerator {
    async fn generate_title(
        &self,
        user_text: &str,
        _assistant_text: &str,
    ) -> Result<String, TitleError> {
        let first_line = user_text
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("");
        clean_title(first_line).ok_or(TitleError::Empty)
    }
}

/// Asks an OpenAI-compatible chat-completions endpoint for a title.
pub struct LlmTitleGenerator {
    client: Client,
    api_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<CompletionMessage<'a>>,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct CompletionMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionContent,
}

#[derive(Debug, Deserialize)]
struct CompletionContent {
    #[serde(default)]
    content: Option<String>,
}

impl LlmTitleGenerator {
    pub fn new(api_key: String, model: String) -> Self {
        Self::with_url(OPENROUTER_API_URL.to_string(), api_key, model)
    }

    pub fn with_url(api_url: String, api_key: String, model: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            api_url,
            api_key,
            model,
        }
    }
}

#[async_trait]
impl TitleGenerator for LlmTitleGenerator {
    async fn generate_title(
        &self,
        user_text: &str,
        assistant_text: &str,
    ) -> Result<String, TitleError> {
        let user_ctx = &user_text[..safe_truncate_index(user_text, MAX_CONTEXT_BYTES)];
        let assistant_ctx =
            &assistant_text[..safe_truncate_index(assistant_text, MAX_CONTEXT_BYTES)];

        let request = CompletionRequest {
            model: &self.model,
            messages: vec![
                CompletionMessage {
                    role: "system",
                    content: TITLE_PROMPT.to_string(),
                },
                CompletionMessage {
                    role: "user",
                    content: format!("User: {}\n\nAssistant: {}", user_ctx, assistant_ctx),
                },
            ],
            max_tokens: 24,
        };

        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| TitleError::Request(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(TitleError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: CompletionResponse =
            serde_json::from_str(&body).map_err(|e| TitleError::Parse(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        debug!(raw = %content, "Title model response");
        clean_title(&content).ok_or(TitleError::Empty)
    }
}

/// Normalize a raw title: first non-empty line, no wrapping quotes, capped at a
/// word boundary.
pub fn clean_title(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = line
        .trim_start_matches(|c: char| c == '"' || c == '\'' || c == '#' || c == '*')
        .trim_end_matches(|c: char| c == '"' || c == '\'' || c == '*' || c == '.')
        .trim();
    if line.is_empty() {
        return None;
    }
    if line.chars().count() <= MAX_TITLE_CHARS {
        return Some(line.to_string());
    }

    let cut: String = line.chars().take(MAX_TITLE_CHARS).collect();
    let shortened = match cut.rfind(char::is_whitespace) {
        Some(idx) if idx > 0 => cut[..idx].trim_end().to_string(),
        _ => cut,
    };
    Some(format!("{}…", shortened))
}

/// Generate and store a title on a detached task.
pub fn spawn_title_update(
    generator: Arc<dyn TitleGenerator>,
    store: Arc<dyn ConversationStore>,
    internal_id: String,
    user_text: String,
    assistant_text: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let title = match generator.generate_title(&user_text, &assistant_text).await {
            Ok(title) => title,
            Err(e) => {
                warn!(internal_id = %internal_id, "Title generation failed: {}", e);
                return;
            }
        };
        match store.update_conversation_title(&internal_id, &title).await {
            Ok(()) => info!(internal_id = %internal_id, title = %title, "Conversation titled"),
            Err(e) => warn!(internal_id = %internal_id, "Failed to store title: {}", e),
        }
    })
}
