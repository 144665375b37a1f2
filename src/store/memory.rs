//! In-memory conversation store (non-persistent).

use super::{
    now_string, Conversation, ConversationStore, MessageRole, StoredMessage, StoredToolCall,
};
use crate::chat::context::ToolCallStatus;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct InMemoryConversationStore {
    conversations: Arc<RwLock<HashMap<String, Conversation>>>,
    messages: Arc<RwLock<HashMap<String, Vec<StoredMessage>>>>,
    tool_calls: Arc<RwLock<HashMap<String, StoredToolCall>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn create_conversation(
        &self,
        internal_id: &str,
        upstream_id: Option<&str>,
        model: Option<&str>,
    ) -> Result<(), String> {
        let now = now_string();
        let mut conversations = self.conversations.write().await;
        let entry = conversations
            .entry(internal_id.to_string())
            .or_insert_with(|| Conversation {
                id: internal_id.to_string(),
                upstream_id: None,
                model: None,
                title: None,
                created_at: now.clone(),
                updated_at: now.clone(),
            });
        if let Some(upstream_id) = upstream_id {
            entry.upstream_id = Some(upstream_id.to_string());
        }
        if let Some(model) = model {
            entry.model = Some(model.to_string());
        }
        entry.updated_at = now;
        Ok(())
    }

    async fn record_message(
        &self,
        internal_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<(), String> {
        self.messages
            .write()
            .await
            .entry(internal_id.to_string())
            .or_default()
            .push(StoredMessage {
                conversation_id: internal_id.to_string(),
                role,
                content: content.to_string(),
                created_at: now_string(),
            });
        Ok(())
    }

    async fn record_tool_call_start(
        &self,
        internal_id: &str,
        tool_use_id: &str,
        tool_name: &str,
        input: &Value,
    ) -> Result<(), String> {
        self.tool_calls
            .write()
            .await
            .entry(tool_use_id.to_string())
            .or_insert_with(|| StoredToolCall {
                tool_use_id: tool_use_id.to_string(),
                conversation_id: internal_id.to_string(),
                tool_name: tool_name.to_string(),
                input: Some(input.clone()).filter(|v| !v.is_null()),
                output: None,
                status: ToolCallStatus::Running.as_str().to_string(),
                started_at: now_string(),
                finished_at: None,
            });
        Ok(())
    }

    async fn record_tool_call_finish(
        &self,
        tool_use_id: &str,
        input: Option<&Value>,
        output: &str,
        status: ToolCallStatus,
    ) -> Result<(), String> {
        let mut tool_calls = self.tool_calls.write().await;
        let call = tool_calls
            .get_mut(tool_use_id)
            .ok_or_else(|| format!("Tool call {} not found", tool_use_id))?;
        if let Some(input) = input {
            call.input = Some(input.clone());
        }
        call.output = Some(output.to_string());
        call.status = status.as_str().to_string();
        call.finished_at = Some(now_string());
        Ok(())
    }

    async fn update_upstream_id(&self, internal_id: &str, upstream_id: &str) -> Result<(), String> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(internal_id)
            .ok_or_else(|| format!("Conversation {} not found", internal_id))?;
        conversation.upstream_id = Some(upstream_id.to_string());
        conversation.updated_at = now_string();
        Ok(())
    }

    async fn update_conversation_title(
        &self,
        internal_id: &str,
        title: &str,
    ) -> Result<(), String> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(internal_id)
            .ok_or_else(|| format!("Conversation {} not found", internal_id))?;
        conversation.title = Some(title.to_string());
        conversation.updated_at = now_string();
        Ok(())
    }

    async fn get_conversation(&self, internal_id: &str) -> Result<Option<Conversation>, String> {
        Ok(self.conversations.read().await.get(internal_id).cloned())
    }

    async fn list_messages(&self, internal_id: &str) -> Result<Vec<StoredMessage>, String> {
        Ok(self
            .messages
            .read()
            .await
            .get(internal_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_tool_call(&self, tool_use_id: &str) -> Result<Option<StoredToolCall>, String> {
        Ok(self.tool_calls.read().await.get(tool_use_id).cloned())
    }
}
