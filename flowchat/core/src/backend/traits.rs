//! Backend Traits
//!
//! Seams between the engine and the generation backend. The streaming
//! session only ever sees a [`TurnTransport`]; the engine refetches
//! authoritative lists through a [`ConversationFetcher`].
//!
//! Implementations handle the provider-specific details (HTTP, auth,
//! in-process test doubles).

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use thiserror::Error;

use crate::conversation::{ConversationKey, Message, MessageId};

/// Raw byte chunks of an opened event stream
///
/// Dropping the stream closes the underlying connection.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// Default model requested when none is configured
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Default sampling temperature
pub const DEFAULT_TEMPERATURE: f32 = 0.3;

/// Default response token limit
pub const DEFAULT_MAX_TOKENS: u32 = 4000;

/// Transport-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection could not be made or broke
    #[error("network error: {0}")]
    Network(String),

    /// Backend answered with a non-success status
    #[error("backend returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body (possibly truncated)
        body: String,
    },

    /// No usable credentials
    #[error("credentials unavailable: {0}")]
    Credentials(String),

    /// Timed out
    #[error("request timed out")]
    Timeout,

    /// Stream closed by the peer
    #[error("stream closed")]
    Closed,

    /// Response body could not be interpreted
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    /// Whether opening again might succeed
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout)
    }

    /// HTTP status, if the backend answered
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// One turn: a user message and its generation parameters
#[derive(Clone, Debug, PartialEq)]
pub struct TurnRequest {
    /// Client correlation id (also the optimistic message id)
    pub request_id: MessageId,
    /// Signed-in user
    pub user_id: String,
    /// Target conversation, `None` for a new one
    pub conversation_id: Option<String>,
    /// Workflow being edited, if any
    pub workflow_id: Option<String>,
    /// The user's text
    pub user_message: String,
    /// Model identifier
    pub model: String,
    /// Sampling temperature (0.0-2.0)
    pub temperature: f32,
    /// Response token limit
    pub max_tokens: u32,
}

impl TurnRequest {
    /// Start building a request
    pub fn builder(user_id: impl Into<String>, message: impl Into<String>) -> TurnRequestBuilder {
        TurnRequestBuilder::new(user_id, message)
    }

    /// Store key of the conversation this turn belongs to
    #[must_use]
    pub fn key(&self) -> ConversationKey {
        ConversationKey::resolve(self.conversation_id.as_deref(), &self.user_id)
    }

    /// JSON body sent to the backend
    #[must_use]
    pub fn wire_body(&self) -> TurnRequestBody<'_> {
        TurnRequestBody {
            conversation_id: self.conversation_id.as_deref(),
            workflow_id: self.workflow_id.as_deref(),
            message: &self.user_message,
            model: &self.model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            client_message_id: self.request_id.as_str(),
        }
    }
}

/// Wire form of a [`TurnRequest`]
#[derive(Debug, Serialize)]
pub struct TurnRequestBody<'a> {
    conversation_id: Option<&'a str>,
    workflow_id: Option<&'a str>,
    message: &'a str,
    model: &'a str,
    temperature: f32,
    max_tokens: u32,
    client_message_id: &'a str,
}

/// Builder for [`TurnRequest`]
#[derive(Clone, Debug)]
pub struct TurnRequestBuilder {
    request: TurnRequest,
}

impl TurnRequestBuilder {
    /// Create a builder with default generation parameters
    pub fn new(user_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            request: TurnRequest {
                request_id: MessageId::new(),
                user_id: user_id.into(),
                conversation_id: None,
                workflow_id: None,
                user_message: message.into(),
                model: DEFAULT_MODEL.to_string(),
                temperature: DEFAULT_TEMPERATURE,
                max_tokens: DEFAULT_MAX_TOKENS,
            },
        }
    }

    /// Target an existing conversation
    #[must_use]
    pub fn conversation(mut self, id: impl Into<String>) -> Self {
        self.request.conversation_id = Some(id.into());
        self
    }

    /// Attach the workflow being edited
    #[must_use]
    pub fn workflow(mut self, id: impl Into<String>) -> Self {
        self.request.workflow_id = Some(id.into());
        self
    }

    /// Set the model
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.request.model = model.into();
        self
    }

    /// Set temperature
    #[must_use]
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.request.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.request.max_tokens = max_tokens;
        self
    }

    /// Use a specific correlation id
    #[must_use]
    pub fn request_id(mut self, id: MessageId) -> Self {
        self.request.request_id = id;
        self
    }

    /// Finish building
    #[must_use]
    pub fn build(self) -> TurnRequest {
        self.request
    }
}

/// Opens the event stream of one turn
#[async_trait]
pub trait TurnTransport: Send + Sync {
    /// Transport name for logging
    fn name(&self) -> &str;

    /// Open the stream for `request`
    ///
    /// Resolves once the backend accepted the request; the returned stream
    /// yields raw chunks until the backend closes it.
    async fn open(&self, request: &TurnRequest) -> Result<ByteStream, TransportError>;
}

/// Reads authoritative message lists
#[async_trait]
pub trait ConversationFetcher: Send + Sync {
    /// Fetch the full message list of a conversation
    async fn fetch_messages(&self, key: &ConversationKey) -> Result<Vec<Message>, TransportError>;
}

/// Supplies the `Authorization` header value
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Current authorization value, `None` for anonymous access
    async fn authorization(&self) -> Result<Option<String>, TransportError>;
}

/// Fixed bearer token
#[derive(Clone)]
pub struct StaticCredentials {
    token: String,
}

impl StaticCredentials {
    /// Create from a bearer token
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn authorization(&self) -> Result<Option<String>, TransportError> {
        if self.token.trim().is_empty() {
            return Err(TransportError::Credentials("empty token".to_string()));
        }
        Ok(Some(format!("Bearer {}", self.token)))
    }
}

/// Anonymous access
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCredentials;

#[async_trait]
impl CredentialProvider for NoCredentials {
    async fn authorization(&self) -> Result<Option<String>, TransportError> {
        Ok(None)
    }
}
