//! HTTP client for the upstream chat message source.
//!
//! The source is external; this client only knows its two read endpoints.
//! Every request carries a fixed timeout so a hung fetch counts as a failed
//! poll instead of stalling the poll loop.

use crate::config::Config;
use crate::models::{MessageBatch, RawMessage, StreamKind};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use std::time::Duration;
use tracing::debug;

/// Upstream path for a stream
pub fn recent_path(stream: StreamKind) -> &'static str {
    match stream {
        StreamKind::Notifications => "/messages/recent",
        StreamKind::Cancellations => "/cancellations/recent",
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
}

impl UpstreamClient {
    /// Build a client for `base_url` sending `api_key` as `X-API-Key`.
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, UpstreamError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(api_key)
                .map_err(|e| UpstreamError::InvalidConfig(format!("invalid API key: {e}")))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::InvalidConfig(format!("failed to build client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Client for the configured upstream, if any
    pub fn from_config(config: &Config) -> Result<Option<Self>, UpstreamError> {
        config
            .upstream_base_url
            .as_deref()
            .map(|url| Self::new(url, &config.upstream_api_key, config.fetch_timeout))
            .transpose()
    }

    /// Fetch the messages of the last `hours` hours.
    pub async fn fetch_recent(
        &self,
        stream: StreamKind,
        hours: u32,
    ) -> Result<Vec<RawMessage>, UpstreamError> {
        let url = format!("{}{}", self.base_url, recent_path(stream));

        let response = self
            .client
            .get(&url)
            .query(&[("hours", hours)])
            .send()
            .await
            .map_err(UpstreamError::from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status(status.as_u16()));
        }

        let batch: MessageBatch = response
            .json()
            .await
            .map_err(|e| UpstreamError::Decode(e.to_string()))?;

        debug!(
            stream = %stream,
            hours,
            count = batch.messages.len(),
            "Fetched upstream messages"
        );
        Ok(batch.messages)
    }
}

/// Transient upstream failures
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream client misconfigured: {0}")]
    InvalidConfig(String),

    #[error("upstream request timed out")]
    Timeout,

    #[error("upstream request failed: {0}")]
    Request(reqwest::Error),

    #[error("upstream returned status {0}")]
    Status(u16),

    #[error("upstream response malformed: {0}")]
    Decode(String),
}

impl UpstreamError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout
        } else {
            UpstreamError::Request(err)
        }
    }
}
