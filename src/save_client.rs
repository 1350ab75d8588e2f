//! Client for the server's save endpoints, used by the alert client's
//! foreground pollers so both polling paths end in the same ingestion service.
//! It also reads back the operator's routed notifications.

use crate::auth::{API_KEY_HEADER, USER_ID_HEADER};
use crate::ingest::{BatchSink, SinkError};
use crate::models::{
    IngestResult, MessageBatch, Notification, RawMessage, SaveMessagesResponse, StreamKind, UserId,
};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Save endpoint path for a stream
pub fn save_path(stream: StreamKind) -> &'static str {
    match stream {
        StreamKind::Notifications => "/api/notifications/save",
        StreamKind::Cancellations => "/api/notifications/save-cancellations",
    }
}

#[derive(Debug, Clone)]
pub struct SaveEndpointClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl SaveEndpointClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Unread notifications the server routed to `user_id`
    pub async fn unread_notifications(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Notification>, SinkError> {
        let url = format!("{}/api/notifications/unread", self.base_url);
        let response = self
            .client
            .get(&url)
            .header(USER_ID_HEADER, user_id.to_string())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Status(status.as_u16()));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl BatchSink for SaveEndpointClient {
    async fn submit(
        &self,
        stream: StreamKind,
        batch: Vec<RawMessage>,
    ) -> Result<Vec<IngestResult>, SinkError> {
        let url = format!("{}{}", self.base_url, save_path(stream));
        let mut request = self.client.post(&url).json(&MessageBatch { messages: batch });
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Status(status.as_u16()));
        }

        let body: SaveMessagesResponse = response.json().await?;
        debug!(stream = %stream, results = body.results.len(), "Batch saved remotely");
        Ok(body.results)
    }
}
