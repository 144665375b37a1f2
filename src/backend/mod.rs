//! Upstream engines and the reader task that turns their output into
//! [`events::ExecutionEvent`]s.
//!
//! An upstream is either a local CLI subprocess or a remote delegate. Both
//! produce the same thing: a buffered byte stream of NDJSON lines, plus (for
//! subprocesses) a handle that can report the exit status or be killed.

pub mod claudecode;
pub mod events;
pub mod parser;
pub mod reader;
pub mod remote;

use anyhow::Error;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use tokio::io::AsyncBufRead;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Buffer size for upstream readers. Tool inputs can be large.
pub const READ_BUFFER_BYTES: usize = 1024 * 1024;

/// Lines of stderr kept for diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// What the upstream needs to run one turn.
#[derive(Debug, Clone, Default)]
pub struct UpstreamRequest {
    pub prompt: String,
    pub model: Option<String>,
    /// Upstream session to resume, if the conversation already has one.
    pub resume_upstream_id: Option<String>,
    pub working_dir: Option<PathBuf>,
}

/// A running upstream turn.
pub struct UpstreamStream {
    pub reader: Box<dyn AsyncBufRead + Send + Unpin>,
    pub process: Option<ProcessHandle>,
}

impl UpstreamStream {
    pub fn from_reader(reader: impl AsyncBufRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            process: None,
        }
    }
}

#[async_trait]
pub trait Upstream: Send + Sync {
    fn id(&self) -> &str;
    async fn open(&self, request: &UpstreamRequest) -> Result<UpstreamStream, Error>;
}

// ── Process handle ────────────────────────────────────────────────

/// Handle to a running CLI process.
/// Call `kill()` to terminate the process on timeout or cancellation.
#[derive(Clone)]
pub struct ProcessHandle {
    child: Arc<Mutex<Option<Child>>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl ProcessHandle {
    pub fn new(child: Child) -> Self {
        Self {
            child: Arc::new(Mutex::new(Some(child))),
            stderr_tail: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub(crate) fn stderr_sink(&self) -> Arc<Mutex<VecDeque<String>>> {
        Arc::clone(&self.stderr_tail)
    }

    /// Kill the underlying process. No-op once it has been reaped.
    pub async fn kill(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill upstream process: {}", e);
            } else {
                info!("Upstream process killed");
            }
        }
    }

    /// Wait for the process to exit. `None` if it was already killed or
    /// reaped, or waiting failed.
    pub async fn wait(&self) -> Option<ExitStatus> {
        let mut child = self.child.lock().await.take()?;
        match child.wait().await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("Failed to wait for upstream process: {}", e);
                None
            }
        }
    }

    /// Last stderr lines joined, if any were captured.
    pub async fn stderr_summary(&self) -> Option<String> {
        let tail = self.stderr_tail.lock().await;
        if tail.is_empty() {
            None
        } else {
            Some(tail.iter().cloned().collect::<Vec<_>>().join("\n"))
        }
    }
}

pub(crate) fn push_stderr_line(tail: &mut VecDeque<String>, line: String) {
    if tail.len() == STDERR_TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line);
}
