//! Configuration management for agent-relay.
//!
//! Configuration is read from environment variables:
//! - `AGENT_RELAY_UPSTREAM` - Optional. `cli` (default) or `remote`.
//! - `CLAUDE_CLI_PATH` - Optional. Path to the Claude CLI. Defaults to `claude`.
//! - `ANTHROPIC_API_KEY` - Optional. API key or OAuth token passed to the CLI.
//! - `AGENT_RELAY_MODEL` - Optional. Default model for new turns.
//! - `AGENT_RELAY_WORKDIR` - Optional. Working directory for the CLI.
//! - `AGENT_RELAY_REMOTE_URL` - Required when the upstream is `remote`.
//! - `AGENT_RELAY_REMOTE_TOKEN` - Optional. Bearer token for the remote delegate.
//! - `AGENT_RELAY_TIMEOUT_SECS` - Optional. Per-turn deadline. Defaults to `600`; `0` disables it.
//! - `AGENT_RELAY_DB_PATH` - Optional. SQLite database path. In-memory store when unset.
//! - `AGENT_RELAY_TITLES` - Optional. Generate conversation titles. Defaults to `true`.
//! - `OPENROUTER_API_KEY` - Optional. Enables model-generated titles; heuristic titles otherwise.
//! - `AGENT_RELAY_TITLE_MODEL` - Optional. Title model. Defaults to `openai/gpt-4o-mini`.
//! - `AGENT_RELAY_TITLE_URL` - Optional. Chat-completions endpoint for titles.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::util::parse_bool;

const DEFAULT_TIMEOUT_SECS: u64 = 600;
const DEFAULT_TITLE_MODEL: &str = "openai/gpt-4o-mini";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamKind {
    Cli,
    Remote,
}

/// Title generation settings.
#[derive(Debug, Clone)]
pub struct TitleConfig {
    pub enabled: bool,
    /// When set, titles come from the model; otherwise from the user's first line.
    pub api_key: Option<String>,
    pub model: String,
    pub api_url: Option<String>,
}

impl Default for TitleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            model: DEFAULT_TITLE_MODEL.to_string(),
            api_url: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub upstream: UpstreamKind,

    pub cli_path: String,

    /// Anthropic API key or OAuth token for the CLI
    pub api_key: Option<String>,

    pub default_model: Option<String>,

    pub working_dir: Option<PathBuf>,

    pub remote_url: Option<String>,

    pub remote_token: Option<String>,

    /// Per-turn deadline; `None` means no deadline
    pub timeout: Option<Duration>,

    pub db_path: Option<PathBuf>,

    pub titles: TitleConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if the remote upstream is selected
    /// without `AGENT_RELAY_REMOTE_URL`, and `ConfigError::InvalidValue` for
    /// unparseable values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let upstream = match var("AGENT_RELAY_UPSTREAM").as_deref().map(str::trim) {
            None | Some("cli") => UpstreamKind::Cli,
            Some("remote") => UpstreamKind::Remote,
            Some(other) => {
                return Err(ConfigError::InvalidValue(
                    "AGENT_RELAY_UPSTREAM".to_string(),
                    format!("expected `cli` or `remote`, got `{}`", other),
                ))
            }
        };

        let remote_url = var("AGENT_RELAY_REMOTE_URL");
        if upstream == UpstreamKind::Remote && remote_url.is_none() {
            return Err(ConfigError::MissingEnvVar(
                "AGENT_RELAY_REMOTE_URL".to_string(),
            ));
        }

        let timeout_secs: u64 = match var("AGENT_RELAY_TIMEOUT_SECS") {
            Some(raw) => raw.trim().parse().map_err(|e| {
                ConfigError::InvalidValue("AGENT_RELAY_TIMEOUT_SECS".to_string(), format!("{}", e))
            })?,
            None => DEFAULT_TIMEOUT_SECS,
        };

        let titles = TitleConfig {
            enabled: var("AGENT_RELAY_TITLES")
                .map(|v| parse_bool(&v))
                .unwrap_or(true),
            api_key: var("OPENROUTER_API_KEY"),
            model: var("AGENT_RELAY_TITLE_MODEL")
                .unwrap_or_else(|| DEFAULT_TITLE_MODEL.to_string()),
            api_url: var("AGENT_RELAY_TITLE_URL"),
        };

        Ok(Self {
            upstream,
            cli_path: var("CLAUDE_CLI_PATH").unwrap_or_else(|| "claude".to_string()),
            api_key: var("ANTHROPIC_API_KEY"),
            default_model: var("AGENT_RELAY_MODEL"),
            working_dir: var("AGENT_RELAY_WORKDIR").map(PathBuf::from),
            remote_url,
            remote_token: var("AGENT_RELAY_REMOTE_TOKEN"),
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            db_path: var("AGENT_RELAY_DB_PATH").map(PathBuf::from),
            titles,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = load(&[]).unwrap();
        assert_eq!(config.upstream, UpstreamKind::Cli);
        assert_eq!(config.cli_path, "claude");
        assert_eq!(config.timeout, Some(Duration::from_secs(600)));
        assert!(config.db_path.is_none());
        assert!(config.titles.enabled);
        assert!(config.titles.api_key.is_none());
        assert_eq!(config.titles.model, DEFAULT_TITLE_MODEL);
    }

    #[test]
    fn remote_requires_url() {
        let err = load(&[("AGENT_RELAY_UPSTREAM", "remote")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "AGENT_RELAY_REMOTE_URL"));

        let config = load(&[
            ("AGENT_RELAY_UPSTREAM", "remote"),
            ("AGENT_RELAY_REMOTE_URL", "http://localhost:9000/turn"),
        ])
        .unwrap();
        assert_eq!(config.upstream, UpstreamKind::Remote);
    }

    #[test]
    fn invalid_values_are_reported() {
        assert!(matches!(
            load(&[("AGENT_RELAY_UPSTREAM", "grpc")]),
            Err(ConfigError::InvalidValue(..))
        ));
        assert!(matches!(
            load(&[("AGENT_RELAY_TIMEOUT_SECS", "soon")]),
            Err(ConfigError::InvalidValue(..))
        ));
    }

    #[test]
    fn zero_timeout_disables_deadline_and_flags_parse() {
        let config = load(&[
            ("AGENT_RELAY_TIMEOUT_SECS", "0"),
            ("AGENT_RELAY_TITLES", "off"),
            ("AGENT_RELAY_DB_PATH", "/tmp/relay.db"),
            ("ANTHROPIC_API_KEY", "  "),
        ])
        .unwrap();
        assert!(config.timeout.is_none());
        assert!(!config.titles.enabled);
        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/relay.db")));
        assert!(config.api_key.is_none());
    }
}
