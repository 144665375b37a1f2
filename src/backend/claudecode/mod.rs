pub mod client;

use anyhow::Error;
use async_trait::async_trait;

use crate::backend::{Upstream, UpstreamRequest, UpstreamStream};

pub use client::{ClaudeCodeClient, ClaudeCodeConfig};

/// Upstream that runs each turn through a fresh Claude CLI process.
pub struct ClaudeCodeUpstream {
    id: String,
    client: ClaudeCodeClient,
}

impl ClaudeCodeUpstream {
    pub fn new() -> Self {
        Self::with_config(ClaudeCodeConfig::default())
    }

    pub fn with_config(config: ClaudeCodeConfig) -> Self {
        Self {
            id: "claudecode".to_string(),
            client: ClaudeCodeClient::with_config(config),
        }
    }
}

impl Default for ClaudeCodeUpstream {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Upstream for ClaudeCodeUpstream {
    fn id(&self) -> &str {
        &self.id
    }

    async fn open(&self, request: &UpstreamRequest) -> Result<UpstreamStream, Error> {
        self.client
            .execute_message(
                request.working_dir.as_deref(),
                &request.prompt,
                request.model.as_deref(),
                request.resume_upstream_id.as_deref(),
            )
            .await
    }
}
