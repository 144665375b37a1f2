//! agent-relay: run one chat turn and print the response events as NDJSON.
//!
//! ```text
//! agent-relay [--resume <conversation-id>] [--model <model>] [prompt...]
//! ```
//!
//! The prompt is read from stdin when no positional arguments are given.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_relay::backend::claudecode::{ClaudeCodeConfig, ClaudeCodeUpstream};
use agent_relay::backend::remote::RemoteUpstream;
use agent_relay::backend::Upstream;
use agent_relay::config::{Config, UpstreamKind};
use agent_relay::title::{HeuristicTitleGenerator, LlmTitleGenerator, TitleGenerator};
use agent_relay::{
    ChatRequest, ChatService, ConversationStore, InMemoryConversationStore, ResponseEvent,
    SqliteConversationStore,
};

#[derive(Parser, Debug)]
#[command(name = "agent-relay", version, about = "Run one chat turn and print its events as NDJSON")]
struct CliArgs {
    /// Conversation id to continue
    #[arg(long)]
    resume: Option<String>,
    /// Model override for this turn
    #[arg(long)]
    model: Option<String>,
    /// Prompt text; read from stdin when omitted
    #[arg(trailing_var_arg = true)]
    prompt: Vec<String>,
}

impl CliArgs {
    fn prompt(&self) -> Option<String> {
        (!self.prompt.is_empty()).then(|| self.prompt.join(" "))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the event stream.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_env()?;
    let args = CliArgs::parse();

    let prompt = match args.prompt() {
        Some(prompt) => prompt,
        None => {
            let mut buf = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buf)
                .await
                .context("Failed to read prompt from stdin")?;
            buf
        }
    };
    if prompt.trim().is_empty() {
        bail!("Empty prompt");
    }

    let store: Arc<dyn ConversationStore> = match &config.db_path {
        Some(path) => Arc::new(
            SqliteConversationStore::new(path.clone())
                .await
                .map_err(|e| anyhow!(e))?,
        ),
        None => Arc::new(InMemoryConversationStore::new()),
    };
    info!(persistent = store.is_persistent(), "Conversation store ready");

    let upstream: Arc<dyn Upstream> = match config.upstream {
        UpstreamKind::Cli => Arc::new(ClaudeCodeUpstream::with_config(ClaudeCodeConfig {
            cli_path: config.cli_path.clone(),
            api_key: config.api_key.clone(),
            default_model: config.default_model.clone(),
        })),
        UpstreamKind::Remote => {
            let url = config
                .remote_url
                .clone()
                .ok_or_else(|| anyhow!("AGENT_RELAY_REMOTE_URL is not set"))?;
            Arc::new(RemoteUpstream::new(url, config.remote_token.clone()))
        }
    };

    let mut service = ChatService::new(upstream, store);
    if let Some(timeout) = config.timeout {
        service = service.with_timeout(timeout);
    }
    if let Some(dir) = &config.working_dir {
        service = service.with_working_dir(dir.clone());
    }
    if config.titles.enabled {
        let titles: Arc<dyn TitleGenerator> = match &config.titles.api_key {
            Some(key) => match &config.titles.api_url {
                Some(url) => Arc::new(LlmTitleGenerator::with_url(
                    url.clone(),
                    key.clone(),
                    config.titles.model.clone(),
                )),
                None => Arc::new(LlmTitleGenerator::new(
                    key.clone(),
                    config.titles.model.clone(),
                )),
            },
            None => Arc::new(HeuristicTitleGenerator),
        };
        service = service.with_title_generator(titles);
    }

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling turn");
            ctrl_c_cancel.cancel();
        }
    });

    let (tx, mut rx) = mpsc::channel::<ResponseEvent>(256);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to serialize {} event: {}", event.event_name(), e),
            }
        }
    });

    let outcome = service
        .run_turn(
            ChatRequest {
                prompt,
                internal_id: args.resume,
                model: args.model.or(config.default_model.clone()),
                cancel,
                ..Default::default()
            },
            tx,
        )
        .await;
    printer.await?;

    if let Some(task) = outcome.title_task {
        if let Err(e) = task.await {
            warn!("Title task failed: {}", e);
        }
    }

    if let Some(error) = outcome.error {
        warn!(internal_id = %outcome.internal_id, "Turn failed: {}", error);
        std::process::exit(1);
    }
    info!(internal_id = %outcome.internal_id, "Turn complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(list: &[&str]) -> Result<CliArgs, clap::Error> {
        CliArgs::try_parse_from(std::iter::once("agent-relay").chain(list.iter().copied()))
    }

    #[test]
    fn parses_resume_model_and_prompt() {
        let args = parse(&["--resume", "I1", "--model", "opus", "fix", "it"]).unwrap();
        assert_eq!(args.resume.as_deref(), Some("I1"));
        assert_eq!(args.model.as_deref(), Some("opus"));
        assert_eq!(args.prompt().as_deref(), Some("fix it"));
    }

    #[test]
    fn double_dash_ends_flags() {
        let args = parse(&["--", "--not-a-flag"]).unwrap();
        assert_eq!(args.prompt().as_deref(), Some("--not-a-flag"));
    }

    #[test]
    fn rejects_unknown_flags_and_missing_values() {
        assert!(parse(&["--verbose"]).is_err());
        assert!(parse(&["--resume"]).is_err());
        let empty = parse(&[]).unwrap();
        assert!(empty.resume.is_none());
        assert!(empty.prompt().is_none());
    }
}
