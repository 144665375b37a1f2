//! Producer side of a request: reads upstream lines, parses them and pushes
//! events into a bounded channel in wire order.
//!
//! The reader is the only owner of the sender. It sends exactly one terminal
//! event (`Done` or `Error`) and then drops the sender, closing the channel.

use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{ExecutionError, ExecutionEvent};
use super::parser::EventParser;
use super::{ProcessHandle, UpstreamStream};
use crate::util::excerpt;

pub const CHANNEL_CAPACITY: usize = 256;

/// How long to wait for the process to exit after it reported a result.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Non-JSON lines kept for diagnostics.
const MAX_NON_JSON_LINES: usize = 20;

#[derive(Debug, Clone, Default)]
pub struct ReaderOptions {
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
}

enum Stop {
    Eof,
    ReadFailed(String),
    Terminal(ExecutionEvent),
    HeldDone(String),
    Cancelled,
    TimedOut,
    ReceiverGone,
}

/// Spawn the reader task for one request.
pub fn spawn_reader(
    stream: UpstreamStream,
    options: ReaderOptions,
) -> (mpsc::Receiver<ExecutionEvent>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let handle = tokio::spawn(read_upstream(stream, options, tx));
    (rx, handle)
}

async fn read_upstream(
    stream: UpstreamStream,
    options: ReaderOptions,
    tx: mpsc::Sender<ExecutionEvent>,
) {
    let UpstreamStream { reader, process } = stream;
    let started = Instant::now();
    let mut lines = reader.lines();
    let mut parser = EventParser::new();
    let mut non_json_output: Vec<String> = Vec::new();
    let mut saw_text = false;

    let deadline = async {
        match options.deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let stop = 'read: loop {
        let next = tokio::select! {
            biased;
            _ = options.cancel.cancelled() => break 'read Stop::Cancelled,
            _ = &mut deadline => break 'read Stop::TimedOut,
            line = lines.next_line() => line,
        };

        let line = match next {
            Ok(Some(line)) => line,
            Ok(None) => break 'read Stop::Eof,
            Err(e) => break 'read Stop::ReadFailed(e.to_string()),
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !trimmed.starts_with('{') {
            if non_json_output.len() < MAX_NON_JSON_LINES {
                non_json_output.push(excerpt(trimmed, 200));
            }
            continue;
        }

        for event in parser.parse_line(trimmed) {
            match event {
                ExecutionEvent::Unrecognized => {}
                ExecutionEvent::Done { final_text } => break 'read Stop::HeldDone(final_text),
                event @ ExecutionEvent::Error { .. } => break 'read Stop::Terminal(event),
                event => {
                    if matches!(event, ExecutionEvent::Chunk { .. }) {
                        saw_text = true;
                    }
                    if tx.send(event).await.is_err() {
                        break 'read Stop::ReceiverGone;
                    }
                }
            }
        }
    };

    let terminal = match stop {
        Stop::ReceiverGone => {
            debug!("Event receiver dropped, stopping upstream reader");
            if let Some(process) = &process {
                process.kill().await;
            }
            return;
        }
        Stop::Cancelled => {
            info!("Request cancelled, terminating upstream");
            if let Some(process) = &process {
                process.kill().await;
            }
            ExecutionEvent::Error {
                cause: ExecutionError::Cancelled,
            }
        }
        Stop::TimedOut => {
            let elapsed = started.elapsed();
            warn!(elapsed_secs = elapsed.as_secs(), "Request deadline exceeded, terminating upstream");
            if let Some(process) = &process {
                process.kill().await;
            }
            ExecutionEvent::Error {
                cause: ExecutionError::Timeout(elapsed),
            }
        }
        Stop::Terminal(event) => {
            if let Some(process) = &process {
                process.kill().await;
            }
            event
        }
        Stop::HeldDone(final_text) => {
            let exit = match &process {
                Some(process) => match tokio::time::timeout(EXIT_GRACE, process.wait()).await {
                    Ok(status) => status,
                    Err(_) => {
                        debug!("Upstream still running after result; releasing it");
                        None
                    }
                },
                None => None,
            };
            match exit {
                Some(status) if !status.success() && !saw_text && final_text.is_empty() => {
                    let mut message =
                        format!("upstream exited with {} and produced no output", status);
                    append_diagnostics(&mut message, &process, &non_json_output).await;
                    ExecutionEvent::Error {
                        cause: ExecutionError::Process(message),
                    }
                }
                _ => ExecutionEvent::Done { final_text },
            }
        }
        Stop::Eof => ended_without_result(None, &process, saw_text, &non_json_output).await,
        Stop::ReadFailed(e) => {
            warn!("Upstream read failed: {}", e);
            ended_without_result(Some(e), &process, saw_text, &non_json_output).await
        }
    };

    if tx.send(terminal).await.is_err() {
        debug!("Event receiver dropped before terminal event");
    }
}

/// Terminal event for a stream that closed before a result line arrived.
async fn ended_without_result(
    read_error: Option<String>,
    process: &Option<ProcessHandle>,
    saw_text: bool,
    non_json_output: &[String],
) -> ExecutionEvent {
    let exit = match process {
        Some(process) => process.wait().await,
        None => None,
    };
    let exit_ok = exit.map(|s| s.success()).unwrap_or(process.is_none());

    if saw_text && exit_ok && read_error.is_none() {
        debug!("Upstream ended without a result line; completing with streamed text");
        return ExecutionEvent::Done {
            final_text: String::new(),
        };
    }

    let mut message = match (&read_error, exit) {
        (Some(e), _) => format!("upstream stream failed: {}", e),
        (None, Some(status)) => format!("upstream exited with {} without a result", status),
        (None, None) => "upstream closed without a result".to_string(),
    };
    append_diagnostics(&mut message, process, non_json_output).await;
    ExecutionEvent::Error {
        cause: ExecutionError::Process(message),
    }
}

async fn append_diagnostics(
    message: &mut String,
    process: &Option<ProcessHandle>,
    non_json_output: &[String],
) {
    if let Some(stderr) = match process {
        Some(p) => p.stderr_summary().await,
        None => None,
    } {
        message.push_str("\n\nstderr:\n");
        message.push_str(&stderr);
    }
    if !non_json_output.is_empty() {
        message.push_str(&format!(
            "\n\nNon-JSON output captured ({} lines):\n{}",
            non_json_output.len(),
            non_json_output.join("\n")
        ));
    }
}
