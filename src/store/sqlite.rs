//! SQLite-based conversation store.

use super::{
    now_string, Conversation, ConversationStore, MessageRole, StoredMessage, StoredToolCall,
};
use crate::chat::context::ToolCallStatus;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY NOT NULL,
    upstream_id TEXT,
    model TEXT,
    title TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_updated_at ON conversations(updated_at DESC);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, id);

CREATE TABLE IF NOT EXISTS tool_calls (
    tool_use_id TEXT PRIMARY KEY NOT NULL,
    conversation_id TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    input TEXT,
    output TEXT,
    status TEXT NOT NULL DEFAULT 'running',
    started_at TEXT NOT NULL,
    finished_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_tool_calls_conversation ON tool_calls(conversation_id);
"#;

pub struct SqliteConversationStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteConversationStore {
    pub async fn new(db_path: PathBuf) -> Result<Self, String> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| format!("Failed to create store dir: {}", e))?;
            }
        }

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)
                .map_err(|e| format!("Failed to open SQLite database: {}", e))?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| format!("Failed to run schema: {}", e))?;
            Ok::<_, String>(conn)
        })
        .await
        .map_err(|e| format!("Task join error: {}", e))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, String>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, String> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(|e| e.to_string())?
    }
}

fn encode_json(value: Option<&Value>) -> Option<String> {
    value
        .filter(|v| !v.is_null())
        .and_then(|v| serde_json::to_string(v).ok())
}

fn decode_json(raw: Option<String>) -> Option<Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn create_conversation(
        &self,
        internal_id: &str,
        upstream_id: Option<&str>,
        model: Option<&str>,
    ) -> Result<(), String> {
        let now = now_string();
        let internal_id = internal_id.to_string();
        let upstream_id = upstream_id.map(str::to_string);
        let model = model.map(str::to_string);

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO conversations (id, upstream_id, model, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    upstream_id = COALESCE(excluded.upstream_id, conversations.upstream_id),
                    model = COALESCE(excluded.model, conversations.model),
                    updated_at = excluded.updated_at",
                params![internal_id, upstream_id, model, now],
            )
            .map_err(|e| e.to_string())?;
            Ok(())
        })
        .await
    }

    async fn record_message(
        &self,
        internal_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<(), String> {
        let now = now_string();
        let internal_id = internal_id.to_string();
        let content = content.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO messages (conversation_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![internal_id, role.as_str(), content, now],
            )
            .map_err(|e| e.to_string())?;
            Ok(())
        })
        .await
    }

    async fn record_tool_call_start(
        &self,
        internal_id: &str,
        tool_use_id: &str,
        tool_name: &str,
        input: &Value,
    ) -> Result<(), String> {
        let now = now_string();
        let internal_id = internal_id.to_string();
        let tool_use_id = tool_use_id.to_string();
        let tool_name = tool_name.to_string();
        let input = encode_json(Some(input));

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO tool_calls
                    (tool_use_id, conversation_id, tool_name, input, status, started_at)
                 VALUES (?1, ?2, ?3, ?4, 'running', ?5)",
                params![tool_use_id, internal_id, tool_name, input, now],
            )
            .map_err(|e| e.to_string())?;
            Ok(())
        })
        .await
    }

    async fn record_tool_call_finish(
        &self,
        tool_use_id: &str,
        input: Option<&Value>,
        output: &str,
        status: ToolCallStatus,
    ) -> Result<(), String> {
        let now = now_string();
        let tool_use_id = tool_use_id.to_string();
        let input = encode_json(input);
        let output = output.to_string();

        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE tool_calls
                     SET input = COALESCE(?1, input), output = ?2, status = ?3, finished_at = ?4
                     WHERE tool_use_id = ?5",
                    params![input, output, status.as_str(), now, tool_use_id],
                )
                .map_err(|e| e.to_string())?;
            if updated == 0 {
                return Err(format!("Tool call {} not found", tool_use_id));
            }
            Ok(())
        })
        .await
    }

    async fn update_upstream_id(&self, internal_id: &str, upstream_id: &str) -> Result<(), String> {
        let now = now_string();
        let internal_id = internal_id.to_string();
        let upstream_id = upstream_id.to_string();

        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE conversations SET upstream_id = ?1, updated_at = ?2 WHERE id = ?3",
                    params![upstream_id, now, internal_id],
                )
                .map_err(|e| e.to_string())?;
            if updated == 0 {
                return Err(format!("Conversation {} not found", internal_id));
            }
            Ok(())
        })
        .await
    }

    async fn update_conversation_title(
        &self,
        internal_id: &str,
        title: &str,
    ) -> Result<(), String> {
        let now = now_string();
        let internal_id = internal_id.to_string();
        let title = title.to_string();

        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3",
                    params![title, now, internal_id],
                )
                .map_err(|e| e.to_string())?;
            if updated == 0 {
                return Err(format!("Conversation {} not found", internal_id));
            }
            Ok(())
        })
        .await
    }

    async fn get_conversation(&self, internal_id: &str) -> Result<Option<Conversation>, String> {
        let internal_id = internal_id.to_string();

        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, upstream_id, model, title, created_at, updated_at
                 FROM conversations WHERE id = ?1",
                params![internal_id],
                |row| {
                    Ok(Conversation {
                        id: row.get(0)?,
                        upstream_id: row.get(1)?,
                        model: row.get(2)?,
                        title: row.get(3)?,
                        created_at: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()
            .map_err(|e| e.to_string())
        })
        .await
    }

    async fn list_messages(&self, internal_id: &str) -> Result<Vec<StoredMessage>, String> {
        let internal_id = internal_id.to_string();

        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT conversation_id, role, content, created_at
                     FROM messages WHERE conversation_id = ?1 ORDER BY id ASC",
                )
                .map_err(|e| e.to_string())?;
            let rows = stmt
                .query_map(params![internal_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })
                .map_err(|e| e.to_string())?;

            let mut messages = Vec::new();
            for row in rows {
                let (conversation_id, role, content, created_at) =
                    row.map_err(|e| e.to_string())?;
                let Some(role) = MessageRole::parse(&role) else {
                    tracing::warn!(role = %role, "Skipping message with unknown role");
                    continue;
                };
                messages.push(StoredMessage {
                    conversation_id,
                    role,
                    content,
                    created_at,
                });
            }
            Ok(messages)
        })
        .await
    }

    async fn get_tool_call(&self, tool_use_id: &str) -> Result<Option<StoredToolCall>, String> {
        let tool_use_id = tool_use_id.to_string();

        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT tool_use_id, conversation_id, tool_name, input, output, status,
                        started_at, finished_at
                 FROM tool_calls WHERE tool_use_id = ?1",
                params![tool_use_id],
                |row| {
                    Ok(StoredToolCall {
                        tool_use_id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        tool_name: row.get(2)?,
                        input: decode_json(row.get(3)?),
                        output: row.get(4)?,
                        status: row.get(5)?,
                        started_at: row.get(6)?,
                        finished_at: row.get(7)?,
                    })
                },
            )
            .optional()
            .map_err(|e| e.to_string())
        })
        .await
    }
}
