//! Consumer side of a request.
//!
//! Drains the ordered event channel, drives the [`ExecutionContext`] and the
//! [`SessionReconciler`], forwards [`ResponseEvent`]s to the caller and fires
//! the persistence side effects. Exactly one terminal event (`done` or
//! `error`) is forwarded per request; after it nothing else is consumed.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::context::{ExecutionContext, StreamMode, ToolCallStatus};
use super::events::ResponseEvent;
use super::session::{FinalBinding, Reconciliation, SessionReconciler, SessionRef};
use crate::backend::events::{ExecutionError, ExecutionEvent, TokenUsage};
use crate::store::{ConversationStore, MessageRole};
use crate::title::{spawn_title_update, TitleGenerator};

/// What one request settled on.
#[derive(Debug)]
pub struct TurnOutcome {
    pub internal_id: String,
    pub upstream_id: Option<String>,
    pub final_text: String,
    pub usage: TokenUsage,
    pub error: Option<ExecutionError>,
    /// Detached title generation, if one was scheduled.
    pub title_task: Option<JoinHandle<()>>,
}

impl TurnOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

pub struct ResponseDispatcher {
    store: Arc<dyn ConversationStore>,
    titles: Option<Arc<dyn TitleGenerator>>,
    outward: mpsc::Sender<ResponseEvent>,
    ctx: ExecutionContext,
    session: SessionReconciler,
    user_text: String,
    model: Option<String>,
    text: String,
    thinking: String,
    session_announced: bool,
    conversation_created: bool,
    user_message_recorded: bool,
    caller_gone: bool,
    binding: Option<FinalBinding>,
    title_task: Option<JoinHandle<()>>,
    error: Option<ExecutionError>,
}

impl ResponseDispatcher {
    pub fn new(
        session: SessionRef,
        user_text: String,
        model: Option<String>,
        store: Arc<dyn ConversationStore>,
        titles: Option<Arc<dyn TitleGenerator>>,
        outward: mpsc::Sender<ResponseEvent>,
    ) -> Self {
        Self {
            store,
            titles,
            outward,
            ctx: ExecutionContext::new(),
            session: SessionReconciler::new(session),
            user_text,
            model,
            text: String::new(),
            thinking: String::new(),
            session_announced: false,
            conversation_created: false,
            user_message_recorded: false,
            caller_gone: false,
            binding: None,
            title_task: None,
            error: None,
        }
    }

    /// Consume events until a terminal one (or channel close) and report the
    /// settled outcome.
    pub async fn run(mut self, mut events: mpsc::Receiver<ExecutionEvent>) -> TurnOutcome {
        if !self.session.is_new_conversation() {
            // Resumed conversations already exist; the user turn can be stored up front.
            self.conversation_created = true;
            self.record_user_message_once().await;
        }

        let mut terminated = false;
        while let Some(event) = events.recv().await {
            if self.handle(event).await {
                terminated = true;
                break;
            }
        }

        if !terminated {
            warn!("Event channel closed without a terminal event");
            self.fail(ExecutionError::Process(
                "upstream stream closed without a terminal event".to_string(),
            ))
            .await;
        }

        let binding = match self.binding.take() {
            Some(binding) => binding,
            None => self.session.finish(),
        };
        TurnOutcome {
            internal_id: binding.internal_id,
            upstream_id: binding.upstream_id,
            final_text: self.text,
            usage: self.ctx.accumulated_usage(),
            error: self.error,
            title_task: self.title_task,
        }
    }

    /// Returns true once a terminal event has been handled.
    async fn handle(&mut self, event: ExecutionEvent) -> bool {
        match event {
            ExecutionEvent::Chunk { text } => {
                self.finalize_thinking().await;
                self.text.push_str(&text);
                self.emit(ResponseEvent::TextChunk { content: text }).await;
            }
            ExecutionEvent::Thinking { text } => {
                self.thinking.push_str(&text);
                self.ctx.switch_mode(StreamMode::Thinking);
                self.emit(ResponseEvent::ThinkingChunk { content: text })
                    .await;
            }
            ExecutionEvent::ThinkingEnd => {
                self.finalize_thinking().await;
            }
            ExecutionEvent::TurnStart { message_id } => {
                self.finalize_thinking().await;
                for call in self.ctx.running_tool_calls() {
                    debug!(
                        tool_use_id = %call.tool_use_id,
                        tool_name = %call.tool_name,
                        "Tool call still running at turn boundary"
                    );
                }
                debug!(message_id = ?message_id, "New assistant turn");
                self.ctx.reset_for_new_turn();
            }
            ExecutionEvent::ToolStart {
                index,
                tool_use_id,
                tool_name,
                input,
            } => {
                self.finalize_thinking().await;
                if self
                    .ctx
                    .register_tool_call(index, &tool_use_id, &tool_name, input.clone())
                    .is_err()
                {
                    return false;
                }
                self.emit(ResponseEvent::ToolStart {
                    tool_use_id: tool_use_id.clone(),
                    tool_name: tool_name.clone(),
                    input: input.clone(),
                })
                .await;

                self.record_user_message_once().await;
                let internal_id = self.session.ensure_internal_id();
                if let Err(e) = self
                    .store
                    .record_tool_call_start(&internal_id, &tool_use_id, &tool_name, &input)
                    .await
                {
                    warn!(tool_use_id = %tool_use_id, "Failed to record tool call start: {}", e);
                }
            }
            ExecutionEvent::ToolInputDelta { index, delta } => {
                let Some(tool_use_id) = self.ctx.append_tool_input(index, &delta) else {
                    return false;
                };
                let tool_use_id = tool_use_id.to_string();
                self.emit(ResponseEvent::ToolInputDelta { tool_use_id, delta })
                    .await;
            }
            ExecutionEvent::ToolProgress {
                tool_use_id,
                elapsed_seconds,
            } => {
                let Some(call) = self.ctx.tool_call(&tool_use_id) else {
                    debug!(tool_use_id = %tool_use_id, "Progress for unknown tool call");
                    return false;
                };
                let tool_name = Some(call.tool_name.clone());
                self.emit(ResponseEvent::ToolProgress {
                    tool_use_id,
                    tool_name,
                    elapsed_seconds,
                })
                .await;
            }
            ExecutionEvent::ToolResult {
                tool_use_id,
                output,
                is_error,
            } => {
                self.finish_tool_call(tool_use_id, output, is_error).await;
            }
            ExecutionEvent::ToolError {
                tool_use_id,
                output,
            } => {
                self.finish_tool_call(tool_use_id, output, true).await;
            }
            ExecutionEvent::Usage { message_id, usage } => {
                self.ctx.add_usage(&message_id, &usage);
            }
            ExecutionEvent::SessionId { value } => {
                self.observe_session(&value).await;
            }
            ExecutionEvent::Done { final_text } => {
                self.complete(final_text).await;
                return true;
            }
            ExecutionEvent::Error { cause } => {
                self.fail(cause).await;
                return true;
            }
            ExecutionEvent::Unrecognized => {}
        }
        false
    }

    async fn emit(&mut self, event: ResponseEvent) {
        if self.caller_gone {
            return;
        }
        if self.outward.send(event).await.is_err() {
            debug!("Caller dropped the response channel; continuing without forwarding");
            self.caller_gone = true;
        }
    }

    /// Close the open reasoning block: one `thinking_end` carrying the whole
    /// block, and one stored thinking message.
    async fn finalize_thinking(&mut self) {
        if self.ctx.mode() != StreamMode::Thinking {
            return;
        }
        self.ctx.switch_mode(StreamMode::Text);
        let content = std::mem::take(&mut self.thinking);
        self.emit(ResponseEvent::ThinkingEnd {
            content: content.clone(),
        })
        .await;

        if content.trim().is_empty() {
            return;
        }
        self.record_user_message_once().await;
        let internal_id = self.session.ensure_internal_id();
        if let Err(e) = self
            .store
            .record_message(&internal_id, MessageRole::Thinking, &content)
            .await
        {
            warn!(internal_id = %internal_id, "Failed to record thinking: {}", e);
        }
    }

    async fn finish_tool_call(&mut self, tool_use_id: String, output: String, is_error: bool) {
        let Some(call) = self.ctx.tool_call(&tool_use_id) else {
            warn!(tool_use_id = %tool_use_id, "Result for unknown tool call; skipping");
            return;
        };
        let tool_name = call.tool_name.clone();
        let input = self.ctx.final_input(&tool_use_id);
        let status = if is_error {
            ToolCallStatus::Error
        } else {
            ToolCallStatus::Success
        };
        if let Err(e) = self.ctx.set_status(&tool_use_id, status) {
            warn!("Failed to update tool call status: {}", e);
        }

        if let Err(e) = self
            .store
            .record_tool_call_finish(&tool_use_id, input.as_ref(), &output, status)
            .await
        {
            warn!(tool_use_id = %tool_use_id, "Failed to record tool call finish: {}", e);
        }

        let event = if is_error {
            ResponseEvent::ToolError {
                tool_use_id,
                tool_name,
                input,
                output,
            }
        } else {
            ResponseEvent::ToolResult {
                tool_use_id,
                tool_name,
                input,
                output,
            }
        };
        self.emit(event).await;
    }

    async fn observe_session(&mut self, value: &str) {
        match self.session.observe(value) {
            Reconciliation::CreateConversation {
                internal_id,
                upstream_id,
            } => {
                self.create_conversation(&internal_id, Some(&upstream_id))
                    .await;
                self.record_user_message_once().await;
            }
            Reconciliation::UpdateUpstreamId {
                internal_id,
                upstream_id,
            } => {
                if let Err(e) = self
                    .store
                    .update_upstream_id(&internal_id, &upstream_id)
                    .await
                {
                    warn!(internal_id = %internal_id, "Failed to update upstream id: {}", e);
                }
            }
            Reconciliation::Unchanged | Reconciliation::Rejected => {}
        }

        if !self.session_announced {
            if let Some(internal_id) = self.session.internal_id().map(str::to_string) {
                self.session_announced = true;
                self.emit(ResponseEvent::SessionBound {
                    session_id: internal_id,
                })
                .await;
            }
        }
    }

    async fn create_conversation(&mut self, internal_id: &str, upstream_id: Option<&str>) {
        self.conversation_created = true;
        match self
            .store
            .create_conversation(internal_id, upstream_id, self.model.as_deref())
            .await
        {
            Ok(()) => info!(internal_id, upstream_id = ?upstream_id, "Conversation created"),
            Err(e) => warn!(internal_id, "Failed to create conversation: {}", e),
        }
    }

    async fn record_user_message_once(&mut self) {
        if self.user_message_recorded || self.user_text.is_empty() {
            return;
        }
        self.user_message_recorded = true;
        let internal_id = self.session.ensure_internal_id();
        if let Err(e) = self
            .store
            .record_message(&internal_id, MessageRole::User, &self.user_text)
            .await
        {
            warn!(internal_id = %internal_id, "Failed to record user message: {}", e);
        }
    }

    async fn complete(&mut self, final_text: String) {
        self.finalize_thinking().await;

        if self.text.is_empty() && !final_text.is_empty() {
            // Nothing was streamed; deliver the reported result as one chunk.
            self.text = final_text.clone();
            self.emit(ResponseEvent::TextChunk {
                content: final_text,
            })
            .await;
        }

        let binding = self.session.finish();
        self.binding = Some(binding.clone());
        if !self.conversation_created {
            self.create_conversation(&binding.internal_id, binding.upstream_id.as_deref())
                .await;
        }
        self.record_user_message_once().await;

        if !self.text.is_empty() {
            if let Err(e) = self
                .store
                .record_message(&binding.internal_id, MessageRole::Assistant, &self.text)
                .await
            {
                warn!(internal_id = %binding.internal_id, "Failed to record assistant message: {}", e);
            }
        }

        let usage = self.ctx.accumulated_usage();
        self.emit(ResponseEvent::Done {
            session_id: binding.internal_id.clone(),
            content: self.text.clone(),
            usage: usage.has_usage().then_some(usage),
        })
        .await;

        if self.session.is_new_conversation() && self.title_task.is_none() {
            if let Some(generator) = &self.titles {
                self.title_task = Some(spawn_title_update(
                    Arc::clone(generator),
                    Arc::clone(&self.store),
                    binding.internal_id,
                    self.user_text.clone(),
                    self.text.clone(),
                ));
            }
        }
    }

    async fn fail(&mut self, cause: ExecutionError) {
        self.binding = Some(self.session.finish());
        warn!(kind = cause.kind(), "Turn failed: {}", cause);
        self.emit(ResponseEvent::Error {
            message: cause.to_string(),
            kind: cause.kind().to_string(),
        })
        .await;
        self.error = Some(cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::reader::{spawn_reader, ReaderOptions};
    use crate::backend::UpstreamStream;
    use crate::store::{Conversation, InMemoryConversationStore, StoredMessage, StoredToolCall};
    use crate::title::HeuristicTitleGenerator;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::BufReader;

    /// In-memory store that counts upstream id updates.
    #[derive(Default)]
    struct CountingStore {
        inner: InMemoryConversationStore,
        upstream_updates: AtomicUsize,
        creates: AtomicUsize,
    }

    #[async_trait]
    impl ConversationStore for CountingStore {
        fn is_persistent(&self) -> bool {
            false
        }
        async fn create_conversation(
            &self,
            internal_id: &str,
            upstream_id: Option<&str>,
            model: Option<&str>,
        ) -> Result<(), String> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            self.inner
                .create_conversation(internal_id, upstream_id, model)
                .await
        }
        async fn record_message(
            &self,
            internal_id: &str,
            role: MessageRole,
            content: &str,
        ) -> Result<(), String> {
            self.inner.record_message(internal_id, role, content).await
        }
        async fn record_tool_call_start(
            &self,
            internal_id: &str,
            tool_use_id: &str,
            tool_name: &str,
            input: &Value,
        ) -> Result<(), String> {
            self.inner
                .record_tool_call_start(internal_id, tool_use_id, tool_name, input)
                .await
        }
        async fn record_tool_call_finish(
            &self,
            tool_use_id: &str,
            input: Option<&Value>,
            output: &str,
            status: ToolCallStatus,
        ) -> Result<(), String> {
            self.inner
                .record_tool_call_finish(tool_use_id, input, output, status)
                .await
        }
        async fn update_upstream_id(
            &self,
            internal_id: &str,
            upstream_id: &str,
        ) -> Result<(), String> {
            self.upstream_updates.fetch_add(1, Ordering::SeqCst);
            self.inner.update_upstream_id(internal_id, upstream_id).await
        }
        async fn update_conversation_title(
            &self,
            internal_id: &str,
            title: &str,
        ) -> Result<(), String> {
            self.inner.update_conversation_title(internal_id, title).await
        }
        async fn get_conversation(&self, internal_id: &str) -> Result<Option<Conversation>, String> {
            self.inner.get_conversation(internal_id).await
        }
        async fn list_messages(&self, internal_id: &str) -> Result<Vec<StoredMessage>, String> {
            self.inner.list_messages(internal_id).await
        }
        async fn get_tool_call(&self, tool_use_id: &str) -> Result<Option<StoredToolCall>, String> {
            self.inner.get_tool_call(tool_use_id).await
        }
    }

    struct Harness {
        store: Arc<CountingStore>,
        titles: Option<Arc<dyn TitleGenerator>>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: Arc::new(CountingStore::default()),
                titles: None,
            }
        }

        async fn run_events(
            &self,
            session: SessionRef,
            events: Vec<ExecutionEvent>,
        ) -> (Vec<ResponseEvent>, TurnOutcome) {
            let (tx, rx) = mpsc::channel(256);
            for event in events {
                tx.send(event).await.unwrap();
            }
            drop(tx);
            self.dispatch(session, rx).await
        }

        async fn run_lines(
            &self,
            session: SessionRef,
            lines: &[&str],
        ) -> (Vec<ResponseEvent>, TurnOutcome) {
            let mut body = lines.join("\n");
            body.push('\n');
            let stream =
                UpstreamStream::from_reader(BufReader::new(Cursor::new(body.into_bytes())));
            let (rx, _reader) = spawn_reader(stream, ReaderOptions::default());
            self.dispatch(session, rx).await
        }

        async fn dispatch(
            &self,
            session: SessionRef,
            rx: mpsc::Receiver<ExecutionEvent>,
        ) -> (Vec<ResponseEvent>, TurnOutcome) {
            let (out_tx, mut out_rx) = mpsc::channel(256);
            let store: Arc<dyn ConversationStore> = self.store.clone();
            let dispatcher = ResponseDispatcher::new(
                session,
                "hello".to_string(),
                Some("sonnet".to_string()),
                store,
                self.titles.clone(),
                out_tx,
            );
            let outcome = dispatcher.run(rx).await;
            let mut out = Vec::new();
            while let Some(event) = out_rx.recv().await {
                out.push(event);
            }
            (out, outcome)
        }
    }

    fn chunk(text: &str) -> ExecutionEvent {
        ExecutionEvent::Chunk {
            text: text.to_string(),
        }
    }

    fn thinking(text: &str) -> ExecutionEvent {
        ExecutionEvent::Thinking {
            text: text.to_string(),
        }
    }

    fn done(text: &str) -> ExecutionEvent {
        ExecutionEvent::Done {
            final_text: text.to_string(),
        }
    }

    fn text_chunks(events: &[ResponseEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                ResponseEvent::TextChunk { content } => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn system_assistant_result_scenario() {
        let harness = Harness::new();
        let (events, outcome) = harness
            .run_lines(
                SessionRef::new_conversation(Some("I1".to_string())),
                &[
                    r#"{"type":"system","subtype":"init","session_id":"S1"}"#,
                    r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hi"}]}}"#,
                    r#"{"type":"result"}"#,
                ],
            )
            .await;

        assert_eq!(
            events,
            vec![
                ResponseEvent::SessionBound {
                    session_id: "I1".to_string()
                },
                ResponseEvent::TextChunk {
                    content: "Hi".to_string()
                },
                ResponseEvent::Done {
                    session_id: "I1".to_string(),
                    content: "Hi".to_string(),
                    usage: None,
                },
            ]
        );
        assert_eq!(outcome.upstream_id.as_deref(), Some("S1"));

        let conv = harness.store.get_conversation("I1").await.unwrap().unwrap();
        assert_eq!(conv.upstream_id.as_deref(), Some("S1"));
        assert_eq!(conv.model.as_deref(), Some("sonnet"));
        assert_eq!(harness.store.creates.load(Ordering::SeqCst), 1);

        let messages = harness.store.list_messages("I1").await.unwrap();
        let roles: Vec<_> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![MessageRole::User, MessageRole::Assistant]);
        assert_eq!(messages[1].content, "Hi");
    }

    #[tokio::test]
    async fn thinking_then_text_scenario() {
        let harness = Harness::new();
        let (events, _) = harness
            .run_lines(
                SessionRef::new_conversation(Some("I1".to_string())),
                &[
                    r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"why"}}"#,
                    r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":" so"}}"#,
                    r#"{"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"Because"}}"#,
                    r#"{"type":"result"}"#,
                ],
            )
            .await;

        assert_eq!(
            events,
            vec![
                ResponseEvent::ThinkingChunk {
                    content: "why".to_string()
                },
                ResponseEvent::ThinkingChunk {
                    content: " so".to_string()
                },
                ResponseEvent::ThinkingEnd {
                    content: "why so".to_string()
                },
                ResponseEvent::TextChunk {
                    content: "Because".to_string()
                },
                ResponseEvent::Done {
                    session_id: "I1".to_string(),
                    content: "Because".to_string(),
                    usage: None,
                },
            ]
        );

        let roles: Vec<_> = harness
            .store
            .list_messages("I1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(
            roles,
            vec![MessageRole::User, MessageRole::Thinking, MessageRole::Assistant]
        );
    }

    #[tokio::test]
    async fn explicit_thinking_end_is_not_duplicated() {
        let harness = Harness::new();
        let (events, _) = harness
            .run_events(
                SessionRef::new_conversation(Some("I1".to_string())),
                vec![
                    thinking("a"),
                    ExecutionEvent::ThinkingEnd,
                    ExecutionEvent::ThinkingEnd,
                    chunk("b"),
                    done(""),
                ],
            )
            .await;
        let ends = events
            .iter()
            .filter(|e| matches!(e, ResponseEvent::ThinkingEnd { .. }))
            .count();
        assert_eq!(ends, 1);
        let end_pos = events
            .iter()
            .position(|e| matches!(e, ResponseEvent::ThinkingEnd { .. }))
            .unwrap();
        let chunk_pos = events
            .iter()
            .position(|e| matches!(e, ResponseEvent::TextChunk { .. }))
            .unwrap();
        assert!(end_pos < chunk_pos);
    }

    #[tokio::test]
    async fn thinking_open_at_done_is_finalized() {
        let harness = Harness::new();
        let (events, _) = harness
            .run_events(
                SessionRef::new_conversation(Some("I1".to_string())),
                vec![thinking("hmm"), done("answer")],
            )
            .await;
        assert_eq!(
            events,
            vec![
                ResponseEvent::ThinkingChunk {
                    content: "hmm".to_string()
                },
                ResponseEvent::ThinkingEnd {
                    content: "hmm".to_string()
                },
                ResponseEvent::TextChunk {
                    content: "answer".to_string()
                },
                ResponseEvent::Done {
                    session_id: "I1".to_string(),
                    content: "answer".to_string(),
                    usage: None,
                },
            ]
        );
    }

    #[tokio::test]
    async fn tool_call_input_is_assembled_from_deltas() {
        let harness = Harness::new();
        let (events, _) = harness
            .run_events(
                SessionRef::new_conversation(Some("I1".to_string())),
                vec![
                    ExecutionEvent::ToolStart {
                        index: 0,
                        tool_use_id: "T1".to_string(),
                        tool_name: "Bash".to_string(),
                        input: json!({}),
                    },
                    ExecutionEvent::ToolInputDelta {
                        index: 0,
                        delta: "{\"a\":".to_string(),
                    },
                    ExecutionEvent::ToolInputDelta {
                        index: 0,
                        delta: "1}".to_string(),
                    },
                    ExecutionEvent::ToolResult {
                        tool_use_id: "T1".to_string(),
                        output: "ok".to_string(),
                        is_error: false,
                    },
                    done(""),
                ],
            )
            .await;

        let call = harness.store.get_tool_call("T1").await.unwrap().unwrap();
        assert_eq!(call.input, Some(json!({"a": 1})));
        assert_eq!(call.output.as_deref(), Some("ok"));
        assert_eq!(call.status, "success");
        assert_eq!(call.conversation_id, "I1");

        assert!(events.contains(&ResponseEvent::ToolInputDelta {
            tool_use_id: "T1".to_string(),
            delta: "1}".to_string(),
        }));
        assert!(events.contains(&ResponseEvent::ToolResult {
            tool_use_id: "T1".to_string(),
            tool_name: "Bash".to_string(),
            input: Some(json!({"a": 1})),
            output: "ok".to_string(),
        }));
    }

    #[tokio::test]
    async fn bare_deltas_then_full_assistant_line_are_not_duplicated() {
        let harness = Harness::new();
        let (events, outcome) = harness
            .run_lines(
                SessionRef::new_conversation(Some("I1".to_string())),
                &[
                    r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"T1","name":"Bash","input":{}}}"#,
                    r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"cmd\":\"ls\"}"}}"#,
                    r#"{"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"Hello"}}"#,
                    r#"{"type":"assistant","message":{"id":"m1","content":[{"type":"tool_use","id":"T1","name":"Bash","input":{"cmd":"ls"}},{"type":"text","text":"Hello"}]}}"#,
                    r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"T1","content":"ok"}]}}"#,
                    r#"{"type":"result","subtype":"success","result":"Hello"}"#,
                ],
            )
            .await;

        let names: Vec<_> = events.iter().map(|e| e.event_name()).collect();
        assert_eq!(
            names,
            vec!["tool_start", "tool_input_delta", "text_chunk", "tool_result", "done"]
        );
        assert_eq!(outcome.final_text, "Hello");
        assert!(outcome.is_success());

        let call = harness.store.get_tool_call("T1").await.unwrap().unwrap();
        assert_eq!(call.input, Some(json!({"cmd": "ls"})));
        assert_eq!(call.status, "success");
    }

    #[tokio::test]
    async fn tool_error_finalizes_with_error_status() {
        let harness = Harness::new();
        let (events, _) = harness
            .run_events(
                SessionRef::new_conversation(Some("I1".to_string())),
                vec![
                    ExecutionEvent::ToolStart {
                        index: 0,
                        tool_use_id: "T1".to_string(),
                        tool_name: "Read".to_string(),
                        input: json!({"path": "/etc/shadow"}),
                    },
                    ExecutionEvent::ToolError {
                        tool_use_id: "T1".to_string(),
                        output: "denied".to_string(),
                    },
                    done("no access"),
                ],
            )
            .await;
        let call = harness.store.get_tool_call("T1").await.unwrap().unwrap();
        assert_eq!(call.status, "error");
        assert_eq!(call.input, Some(json!({"path": "/etc/shadow"})));
        assert!(events
            .iter()
            .any(|e| matches!(e, ResponseEvent::ToolError { output, .. } if output == "denied")));
    }

    #[tokio::test]
    async fn unknown_tool_result_is_skipped() {
        let harness = Harness::new();
        let (events, outcome) = harness
            .run_events(
                SessionRef::new_conversation(Some("I1".to_string())),
                vec![
                    ExecutionEvent::ToolResult {
                        tool_use_id: "ghost".to_string(),
                        output: "?".to_string(),
                        is_error: false,
                    },
                    ExecutionEvent::ToolProgress {
                        tool_use_id: "ghost".to_string(),
                        elapsed_seconds: 1.0,
                    },
                    ExecutionEvent::ToolInputDelta {
                        index: 7,
                        delta: "{".to_string(),
                    },
                    chunk("fine"),
                    done(""),
                ],
            )
            .await;
        assert!(outcome.is_success());
        assert!(harness.store.get_tool_call("ghost").await.unwrap().is_none());
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_tool_index_keeps_first_call() {
        let harness = Harness::new();
        let (events, _) = harness
            .run_events(
                SessionRef::new_conversation(Some("I1".to_string())),
                vec![
                    ExecutionEvent::ToolStart {
                        index: 0,
                        tool_use_id: "T1".to_string(),
                        tool_name: "Bash".to_string(),
                        input: json!({}),
                    },
                    ExecutionEvent::ToolStart {
                        index: 0,
                        tool_use_id: "T2".to_string(),
                        tool_name: "Read".to_string(),
                        input: json!({}),
                    },
                    done("x"),
                ],
            )
            .await;
        let starts = events
            .iter()
            .filter(|e| matches!(e, ResponseEvent::ToolStart { .. }))
            .count();
        assert_eq!(starts, 1);
        assert!(harness.store.get_tool_call("T2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn new_conversation_without_session_id_still_completes() {
        let harness = Harness::new();
        let (events, outcome) = harness
            .run_events(
                SessionRef::new_conversation(Some("I1".to_string())),
                vec![chunk("Hi"), done("")],
            )
            .await;
        assert_eq!(
            events.last(),
            Some(&ResponseEvent::Done {
                session_id: "I1".to_string(),
                content: "Hi".to_string(),
                usage: None,
            })
        );
        assert!(outcome.upstream_id.is_none());
        let conv = harness.store.get_conversation("I1").await.unwrap().unwrap();
        assert!(conv.upstream_id.is_none());
    }

    #[tokio::test]
    async fn new_conversation_without_any_id_mints_one() {
        let harness = Harness::new();
        let (events, outcome) = harness
            .run_events(SessionRef::new_conversation(None), vec![done("ok")])
            .await;
        assert!(!outcome.internal_id.is_empty());
        match events.last() {
            Some(ResponseEvent::Done { session_id, .. }) => {
                assert_eq!(session_id, &outcome.internal_id)
            }
            other => panic!("Expected done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn resumed_rotation_updates_upstream_id_once() {
        let harness = Harness::new();
        harness
            .store
            .create_conversation("I1", Some("S1"), None)
            .await
            .unwrap();
        let (events, outcome) = harness
            .run_events(
                SessionRef::resumed("I1", "S1"),
                vec![
                    ExecutionEvent::SessionId {
                        value: "S2".to_string(),
                    },
                    chunk("again"),
                    ExecutionEvent::SessionId {
                        value: "S2".to_string(),
                    },
                    done(""),
                ],
            )
            .await;

        assert_eq!(harness.store.upstream_updates.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.upstream_id.as_deref(), Some("S2"));
        let conv = harness.store.get_conversation("I1").await.unwrap().unwrap();
        assert_eq!(conv.upstream_id.as_deref(), Some("S2"));

        let bound: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ResponseEvent::SessionBound { .. }))
            .collect();
        assert_eq!(
            bound,
            vec![&ResponseEvent::SessionBound {
                session_id: "I1".to_string()
            }]
        );
        // Upstream ids never leak outward.
        let serialized = serde_json::to_string(&events).unwrap();
        assert!(!serialized.contains("S2"));
    }

    #[tokio::test]
    async fn resumed_conversation_does_not_recreate_or_title() {
        let mut harness = Harness::new();
        harness.titles = Some(Arc::new(HeuristicTitleGenerator));
        harness
            .store
            .create_conversation("I1", Some("S1"), None)
            .await
            .unwrap();
        let (_, outcome) = harness
            .run_events(
                SessionRef::resumed("I1", "S1"),
                vec![
                    ExecutionEvent::SessionId {
                        value: "S1".to_string(),
                    },
                    chunk("ok"),
                    done(""),
                ],
            )
            .await;
        assert!(outcome.title_task.is_none());
        assert_eq!(harness.store.creates.load(Ordering::SeqCst), 1);
        assert_eq!(harness.store.upstream_updates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn new_conversation_schedules_title_once() {
        let mut harness = Harness::new();
        harness.titles = Some(Arc::new(HeuristicTitleGenerator));
        let (_, outcome) = harness
            .run_events(
                SessionRef::new_conversation(Some("I1".to_string())),
                vec![chunk("Hi"), done(""), done("again")],
            )
            .await;
        outcome.title_task.unwrap().await.unwrap();
        let conv = harness.store.get_conversation("I1").await.unwrap().unwrap();
        assert_eq!(conv.title.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn error_is_terminal_and_stops_consumption() {
        let harness = Harness::new();
        let (events, outcome) = harness
            .run_events(
                SessionRef::new_conversation(Some("I1".to_string())),
                vec![
                    chunk("partial"),
                    ExecutionEvent::error("Overloaded"),
                    chunk("late"),
                    done("late"),
                ],
            )
            .await;
        assert_eq!(
            events,
            vec![
                ResponseEvent::TextChunk {
                    content: "partial".to_string()
                },
                ResponseEvent::Error {
                    message: "Overloaded".to_string(),
                    kind: "upstream".to_string(),
                },
            ]
        );
        assert!(!outcome.is_success());
        assert!(outcome.title_task.is_none());
    }

    #[tokio::test]
    async fn closed_channel_without_terminal_is_error() {
        let harness = Harness::new();
        let (events, outcome) = harness
            .run_events(
                SessionRef::new_conversation(Some("I1".to_string())),
                vec![chunk("half")],
            )
            .await;
        let terminals: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminals.len(), 1);
        assert!(matches!(
            terminals[0],
            ResponseEvent::Error { kind, .. } if kind == "process"
        ));
        assert!(matches!(outcome.error, Some(ExecutionError::Process(_))));
    }

    #[tokio::test]
    async fn usage_is_deduplicated_across_repeated_messages() {
        let harness = Harness::new();
        let usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 4,
            cache_creation_tokens: 1,
            cache_read_tokens: 2,
        };
        let (events, outcome) = harness
            .run_events(
                SessionRef::new_conversation(Some("I1".to_string())),
                vec![
                    ExecutionEvent::Usage {
                        message_id: "m1".to_string(),
                        usage,
                    },
                    ExecutionEvent::TurnStart {
                        message_id: Some("m1".to_string()),
                    },
                    ExecutionEvent::Usage {
                        message_id: "m1".to_string(),
                        usage,
                    },
                    chunk("x"),
                    done(""),
                ],
            )
            .await;
        assert_eq!(outcome.usage, usage);
        assert!(matches!(
            events.last(),
            Some(ResponseEvent::Done { usage: Some(u), .. }) if *u == usage
        ));
    }

    #[tokio::test]
    async fn malformed_line_does_not_change_outcome() {
        let clean = [
            r#"{"type":"system","session_id":"S1"}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}"#,
            r#"{"type":"result","subtype":"success","result":"Hello"}"#,
        ];
        let mut dirty = clean.to_vec();
        dirty.insert(2, r#"{"type":"content_block_delta","index":0,"delta":"#);

        let (clean_events, _) = Harness::new()
            .run_lines(SessionRef::new_conversation(Some("I1".to_string())), &clean)
            .await;
        let (dirty_events, _) = Harness::new()
            .run_lines(SessionRef::new_conversation(Some("I1".to_string())), &dirty)
            .await;
        assert_eq!(clean_events.last(), dirty_events.last());
        assert_eq!(text_chunks(&dirty_events), "Hello");
    }

    #[tokio::test]
    async fn chunks_concatenate_to_done_content() {
        let harness = Harness::new();
        let (events, _) = harness
            .run_events(
                SessionRef::new_conversation(Some("I1".to_string())),
                vec![
                    chunk("a"),
                    thinking("t"),
                    chunk("b"),
                    ExecutionEvent::TurnStart { message_id: None },
                    chunk("c"),
                    done("ignored when streamed"),
                ],
            )
            .await;
        let content = match events.last() {
            Some(ResponseEvent::Done { content, .. }) => content.clone(),
            other => panic!("Expected done, got {:?}", other),
        };
        assert_eq!(content, "abc");
        assert_eq!(text_chunks(&events), content);
    }
}
