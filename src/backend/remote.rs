//! Remote delegate upstream: POSTs the turn to an HTTP endpoint that streams
//! back the same NDJSON the CLI would print.

use anyhow::{anyhow, Error};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use reqwest::Client;
use serde::Serialize;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::BufReader;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use super::{Upstream, UpstreamRequest, UpstreamStream, READ_BUFFER_BYTES};
use crate::util::excerpt;

type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

#[derive(Debug, Serialize)]
struct RemoteTurnRequest<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

pub struct RemoteUpstream {
    client: Client,
    url: String,
    token: Option<String>,
}

impl RemoteUpstream {
    pub fn new(url: String, token: Option<String>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, url, token }
    }
}

#[async_trait]
impl Upstream for RemoteUpstream {
    fn id(&self) -> &str {
        "remote"
    }

    async fn open(&self, request: &UpstreamRequest) -> Result<UpstreamStream, Error> {
        let body = RemoteTurnRequest {
            prompt: &request.prompt,
            model: request.model.as_deref(),
            session_id: request.resume_upstream_id.as_deref(),
        };

        info!(
            "Opening remote upstream: url={}, resume={:?}",
            self.url, request.resume_upstream_id
        );

        let mut req = self
            .client
            .post(&self.url)
            .header("Accept", "application/x-ndjson")
            .json(&body);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| anyhow!("Remote upstream request failed: {}", e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Remote upstream returned {}: {}",
                status,
                excerpt(&text, 200)
            ));
        }
        debug!("Remote upstream connected: {}", status);

        let body: BodyStream = Box::pin(
            resp.bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );
        let reader = StreamReader::new(body);
        Ok(UpstreamStream::from_reader(BufReader::with_capacity(
            READ_BUFFER_BYTES,
            reader,
        )))
    }
}
