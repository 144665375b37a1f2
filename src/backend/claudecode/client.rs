use anyhow::{anyhow, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::backend::{push_stderr_line, ProcessHandle, UpstreamStream, READ_BUFFER_BYTES};

/// Configuration for the Claude Code client.
#[derive(Debug, Clone)]
pub struct ClaudeCodeConfig {
    pub cli_path: String,
    pub api_key: Option<String>,
    pub default_model: Option<String>,
}

impl Default for ClaudeCodeConfig {
    fn default() -> Self {
        Self {
            cli_path: std::env::var("CLAUDE_CLI_PATH").unwrap_or_else(|_| "claude".to_string()),
            api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            default_model: None,
        }
    }
}

/// Client for communicating with the Claude CLI.
pub struct ClaudeCodeClient {
    config: ClaudeCodeConfig,
}

impl ClaudeCodeClient {
    pub fn new() -> Self {
        Self {
            config: ClaudeCodeConfig::default(),
        }
    }

    pub fn with_config(config: ClaudeCodeConfig) -> Self {
        Self { config }
    }

    /// Build the CLI invocation for one turn.
    pub fn build_command(
        &self,
        directory: Option<&Path>,
        message: &str,
        model: Option<&str>,
        resume_session_id: Option<&str>,
    ) -> Command {
        let mut cmd = Command::new(&self.config.cli_path);
        if let Some(dir) = directory {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .arg("--print")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--include-partial-messages");

        // OAuth tokens start with "sk-ant-oat" and must use CLAUDE_CODE_OAUTH_TOKEN
        if let Some(ref key) = self.config.api_key {
            if key.starts_with("sk-ant-oat") {
                cmd.env("CLAUDE_CODE_OAUTH_TOKEN", key);
                debug!("Using OAuth token for Claude CLI authentication");
            } else {
                cmd.env("ANTHROPIC_API_KEY", key);
                debug!("Using API key for Claude CLI authentication");
            }
        }

        // The CLI expects bare model ids, not provider-prefixed ones.
        if let Some(m) = model.or(self.config.default_model.as_deref()) {
            let bare = m.strip_prefix("anthropic/").unwrap_or(m);
            cmd.arg("--model").arg(bare);
        }

        if let Some(sid) = resume_session_id {
            cmd.arg("--resume").arg(sid);
        }

        cmd.arg("--").arg(message);
        cmd
    }

    /// Spawn the CLI and hand back its stdout as a line stream.
    pub async fn execute_message(
        &self,
        directory: Option<&Path>,
        message: &str,
        model: Option<&str>,
        resume_session_id: Option<&str>,
    ) -> Result<UpstreamStream> {
        let mut cmd = self.build_command(directory, message, model, resume_session_id);

        info!(
            "Spawning Claude CLI: directory={:?}, model={:?}, resume={:?}",
            directory,
            model.or(self.config.default_model.as_deref()),
            resume_session_id
        );

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn Claude CLI: {}", e);
            anyhow!(
                "Failed to spawn Claude CLI: {}. Is it installed at '{}'?",
                e,
                self.config.cli_path
            )
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Failed to capture Claude stdout"))?;
        let stderr = child.stderr.take();

        let handle = ProcessHandle::new(child);

        if let Some(stderr) = stderr {
            let sink = handle.stderr_sink();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let line = line.trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    debug!("Claude CLI stderr: {}", line);
                    push_stderr_line(&mut *sink.lock().await, line);
                }
            });
        }

        Ok(UpstreamStream {
            reader: Box::new(BufReader::with_capacity(READ_BUFFER_BYTES, stdout)),
            process: Some(handle),
        })
    }
}

impl Default for ClaudeCodeClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn env_of(cmd: &Command, key: &str) -> Option<String> {
        cmd.as_std()
            .get_envs()
            .find(|(k, _)| *k == std::ffi::OsStr::new(key))
            .and_then(|(_, v)| v.map(|v| v.to_string_lossy().into_owned()))
    }

    fn client(api_key: Option<&str>) -> ClaudeCodeClient {
        ClaudeCodeClient::with_config(ClaudeCodeConfig {
            cli_path: "claude".to_string(),
            api_key: api_key.map(str::to_string),
            default_model: Some("claude-sonnet-4".to_string()),
        })
    }

    #[test]
    fn resume_and_model_flags() {
        let cmd = client(None).build_command(None, "hello", Some("anthropic/claude-opus-4"), Some("S1"));
        let args = args_of(&cmd);
        assert!(args.windows(2).any(|w| w == ["--model", "claude-opus-4"]));
        assert!(args.windows(2).any(|w| w == ["--resume", "S1"]));
        assert_eq!(args.last().map(String::as_str), Some("hello"));
    }

    #[test]
    fn new_conversation_has_no_resume_flag() {
        let cmd = client(None).build_command(None, "-starts with dash", None, None);
        let args = args_of(&cmd);
        assert!(!args.iter().any(|a| a == "--resume"));
        assert!(args.windows(2).any(|w| w == ["--model", "claude-sonnet-4"]));
        assert!(args.windows(2).any(|w| w == ["--", "-starts with dash"]));
    }

    #[test]
    fn oauth_token_uses_dedicated_env_var() {
        let cmd = client(Some("sk-ant-oat01-abc")).build_command(None, "hi", None, None);
        assert_eq!(
            env_of(&cmd, "CLAUDE_CODE_OAUTH_TOKEN").as_deref(),
            Some("sk-ant-oat01-abc")
        );

        let cmd = client(Some("sk-ant-api03-abc")).build_command(None, "hi", None, None);
        assert_eq!(
            env_of(&cmd, "ANTHROPIC_API_KEY").as_deref(),
            Some("sk-ant-api03-abc")
        );
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let client = ClaudeCodeClient::with_config(ClaudeCodeConfig {
            cli_path: "/nonexistent/claude-cli".to_string(),
            api_key: None,
            default_model: None,
        });
        let err = client
            .execute_message(None, "hi", None, None)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("/nonexistent/claude-cli"));
    }
}
