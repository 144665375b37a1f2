//! One chat turn, end to end.
//!
//! [`ChatService::run_turn`] resolves the conversation identity, opens the
//! upstream, and connects one reader task to one dispatcher task through a
//! bounded channel. Nothing here is shared between turns except the store and
//! the title generator.

pub mod context;
pub mod dispatcher;
pub mod events;
pub mod session;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::events::{ExecutionError, ExecutionEvent};
use crate::backend::reader::{spawn_reader, ReaderOptions};
use crate::backend::{Upstream, UpstreamRequest, UpstreamStream};
use crate::store::ConversationStore;
use crate::title::TitleGenerator;

pub use dispatcher::{ResponseDispatcher, TurnOutcome};
pub use events::ResponseEvent;
pub use session::SessionRef;

/// Caller input for one turn.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub prompt: String,
    /// Caller-stable conversation id. `None` starts a new conversation.
    pub internal_id: Option<String>,
    /// Upstream id to resume, when the caller already knows it.
    pub upstream_id: Option<String>,
    pub model: Option<String>,
    /// Overrides the service default.
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

pub struct ChatService {
    upstream: Arc<dyn Upstream>,
    store: Arc<dyn ConversationStore>,
    titles: Option<Arc<dyn TitleGenerator>>,
    default_timeout: Option<Duration>,
    working_dir: Option<PathBuf>,
}

impl ChatService {
    pub fn new(upstream: Arc<dyn Upstream>, store: Arc<dyn ConversationStore>) -> Self {
        Self {
            upstream,
            store,
            titles: None,
            default_timeout: None,
            working_dir: None,
        }
    }

    pub fn with_title_generator(mut self, titles: Arc<dyn TitleGenerator>) -> Self {
        self.titles = Some(titles);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Work out whether the request starts or resumes a conversation.
    pub async fn resolve_session(&self, request: &ChatRequest) -> SessionRef {
        let Some(internal_id) = request.internal_id.clone() else {
            return SessionRef::new_conversation(None);
        };
        if let Some(upstream_id) = &request.upstream_id {
            return SessionRef::resumed(internal_id, upstream_id.clone());
        }
        match self.store.get_conversation(&internal_id).await {
            Ok(Some(conversation)) => match conversation.upstream_id {
                Some(upstream_id) => SessionRef::resumed(internal_id, upstream_id),
                None => {
                    warn!(
                        internal_id = %internal_id,
                        "Stored conversation has no upstream id; starting a fresh upstream session"
                    );
                    SessionRef::new_conversation(Some(internal_id))
                }
            },
            Ok(None) => SessionRef::new_conversation(Some(internal_id)),
            Err(e) => {
                warn!(internal_id = %internal_id, "Failed to load conversation: {}", e);
                SessionRef::new_conversation(Some(internal_id))
            }
        }
    }

    /// Run one turn, forwarding response events to `outward` in order.
    pub async fn run_turn(
        &self,
        request: ChatRequest,
        outward: mpsc::Sender<ResponseEvent>,
    ) -> TurnOutcome {
        let session = self.resolve_session(&request).await;
        info!(
            upstream = self.upstream.id(),
            internal_id = ?session.internal_id,
            resume = ?session.upstream_id,
            "Starting chat turn"
        );

        let started = Instant::now();
        let deadline = request
            .timeout
            .or(self.default_timeout)
            .map(|t| started + t);

        let upstream_request = UpstreamRequest {
            prompt: request.prompt.clone(),
            model: request.model.clone(),
            resume_upstream_id: session.upstream_id.clone(),
            working_dir: self.working_dir.clone(),
        };

        let opened = tokio::select! {
            biased;
            _ = request.cancel.cancelled() => Err(ExecutionError::Cancelled),
            _ = sleep_until_deadline(deadline) => {
                warn!("Request deadline exceeded while opening upstream");
                Err(ExecutionError::Timeout(started.elapsed()))
            }
            result = self.upstream.open(&upstream_request) => {
                result.map_err(|e| ExecutionError::Process(e.to_string()))
            }
        };

        match opened {
            Ok(stream) => {
                self.run_opened(request, session, stream, deadline, outward)
                    .await
            }
            Err(cause) => {
                let (tx, rx) = mpsc::channel(1);
                let _ = tx.send(ExecutionEvent::Error { cause }).await;
                drop(tx);
                self.dispatcher(&request, session, outward).run(rx).await
            }
        }
    }

    /// Run a turn over an already-open upstream stream. The deadline, if
    /// any, starts now.
    pub async fn run_with_stream(
        &self,
        request: ChatRequest,
        session: SessionRef,
        stream: UpstreamStream,
        outward: mpsc::Sender<ResponseEvent>,
    ) -> TurnOutcome {
        let deadline = request
            .timeout
            .or(self.default_timeout)
            .map(|t| Instant::now() + t);
        self.run_opened(request, session, stream, deadline, outward)
            .await
    }

    async fn run_opened(
        &self,
        request: ChatRequest,
        session: SessionRef,
        stream: UpstreamStream,
        deadline: Option<Instant>,
        outward: mpsc::Sender<ResponseEvent>,
    ) -> TurnOutcome {
        let options = ReaderOptions {
            deadline,
            cancel: request.cancel.clone(),
        };
        let (events, reader) = spawn_reader(stream, options);
        let dispatcher = self.dispatcher(&request, session, outward);
        let outcome = tokio::spawn(dispatcher.run(events)).await;
        if let Err(e) = reader.await {
            warn!("Upstream reader task failed: {}", e);
        }

        match outcome {
            Ok(outcome) => {
                info!(
                    internal_id = %outcome.internal_id,
                    success = outcome.is_success(),
                    output_tokens = outcome.usage.output_tokens,
                    "Chat turn finished"
                );
                outcome
            }
            Err(e) => {
                warn!("Dispatcher task failed: {}", e);
                TurnOutcome {
                    internal_id: request.internal_id.unwrap_or_default(),
                    upstream_id: None,
                    final_text: String::new(),
                    usage: Default::default(),
                    error: Some(ExecutionError::Process(format!("dispatcher failed: {}", e))),
                    title_task: None,
                }
            }
        }
    }

    fn dispatcher(
        &self,
        request: &ChatRequest,
        session: SessionRef,
        outward: mpsc::Sender<ResponseEvent>,
    ) -> ResponseDispatcher {
        ResponseDispatcher::new(
            session,
            request.prompt.clone(),
            request.model.clone(),
            Arc::clone(&self.store),
            self.titles.clone(),
            outward,
        )
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
