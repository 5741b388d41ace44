//! HTTP Backend
//!
//! Talks to the generation service over HTTP.
//!
//! # API
//!
//! - `POST /api/v1/chat/stream` - Start a turn, answered with an event stream
//! - `GET /api/v1/conversations/{id}/messages` - Authoritative message list
//! - `GET /api/v1/conversations/orphan/messages` - Messages not yet in a conversation
//!
//! Only opening a stream is retried. Once the backend accepted the request
//! the byte stream is handed over untouched.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;

use super::retry::RetryPolicy;
use super::traits::{
    ByteStream, ConversationFetcher, CredentialProvider, NoCredentials, TransportError,
    TurnRequest, TurnTransport,
};
use crate::conversation::{ConversationKey, Message};

/// Default backend address
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Longest error body kept in [`TransportError::Status`]
const MAX_ERROR_BODY: usize = 512;

/// Message list responses come either bare or wrapped
#[derive(Deserialize)]
#[serde(untagged)]
enum MessageList {
    Bare(Vec<Message>),
    Wrapped { messages: Vec<Message> },
}

impl MessageList {
    fn into_messages(self) -> Vec<Message> {
        match self {
            Self::Bare(messages) | Self::Wrapped { messages } => messages,
        }
    }
}

/// Generation service client
#[derive(Clone)]
pub struct HttpBackend {
    base_url: String,
    http_client: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    retry: RetryPolicy,
}

impl HttpBackend {
    /// Create a client for `base_url`
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> Result<Self, TransportError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| TransportError::Network(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
            credentials: Arc::new(NoCredentials),
            retry: RetryPolicy::default(),
        })
    }

    /// Use `credentials` for every request
    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Replace the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Base URL without trailing slash
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get the stream endpoint URL
    fn stream_url(&self) -> String {
        format!("{}/api/v1/chat/stream", self.base_url)
    }

    /// Get the messages endpoint URL for a conversation
    fn messages_url(&self, key: &ConversationKey) -> String {
        match key.conversation_id() {
            Some(id) => format!("{}/api/v1/conversations/{id}/messages", self.base_url),
            None => format!("{}/api/v1/conversations/orphan/messages", self.base_url),
        }
    }

    async fn authorize(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, TransportError> {
        Ok(match self.credentials.authorization().await? {
            Some(value) => builder.header(reqwest::header::AUTHORIZATION, value),
            None => builder,
        })
    }

    async fn open_once(&self, request: &TurnRequest) -> Result<reqwest::Response, TransportError> {
        let builder = self
            .http_client
            .post(self.stream_url())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&request.wire_body());

        let response = self
            .authorize(builder)
            .await?
            .send()
            .await
            .map_err(map_reqwest_error)?;

        check_status(response).await
    }
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("base_url", &self.base_url)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TurnTransport for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn open(&self, request: &TurnRequest) -> Result<ByteStream, TransportError> {
        let mut attempt = 0;
        let response = loop {
            match self.open_once(request).await {
                Ok(response) => break response,
                Err(e) if self.retry.should_retry(&e, attempt) => {
                    let backoff = self.retry.backoff_for_attempt(attempt);
                    tracing::warn!(
                        error = %e,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        "Opening stream failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        tracing::debug!(status = response.status().as_u16(), "Stream accepted");
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(map_reqwest_error));
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl ConversationFetcher for HttpBackend {
    async fn fetch_messages(&self, key: &ConversationKey) -> Result<Vec<Message>, TransportError> {
        let builder = self.http_client.get(self.messages_url(key));
        let response = self
            .authorize(builder)
            .await?
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let response = check_status(response).await?;

        let body = response.bytes().await.map_err(map_reqwest_error)?;
        parse_message_list(&body)
    }
}

fn parse_message_list(body: &[u8]) -> Result<Vec<Message>, TransportError> {
    serde_json::from_slice::<MessageList>(body)
        .map(MessageList::into_messages)
        .map_err(|e| TransportError::InvalidResponse(format!("message list: {e}")))
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(TransportError::Status {
        status: status.as_u16(),
        body,
    })
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if let Some(status) = e.status() {
        TransportError::Status {
            status: status.as_u16(),
            body: e.to_string(),
        }
    } else {
        TransportError::Network(e.to_string())
    }
}
