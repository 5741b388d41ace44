//! Chat Engine - The Client Core
//!
//! Front door for a UI. The engine owns the conversation store for one
//! signed-in user, the supervisor that runs streaming turns, and the fetcher
//! used to pull authoritative message lists.
//!
//! # Design Philosophy
//!
//! The engine is UI-agnostic. Surfaces start and stop turns through it and
//! render whatever the `watch` receivers it hands out currently hold:
//! - [`ChatEngine::conversation`]: the message list
//! - [`ChatEngine::streaming_state`]: text and progress of the turn in flight
//! - [`ChatEngine::artifact`]: the latest workflow produced

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;

use crate::backend::{
    ConversationFetcher, CredentialProvider, HttpBackend, NoCredentials, StaticCredentials,
    TransportError, TurnRequest, TurnRequestBuilder, TurnTransport, DEFAULT_MAX_TOKENS,
    DEFAULT_MODEL, DEFAULT_TEMPERATURE,
};
use crate::config::{ClientConfig, ConfigError};
use crate::conversation::{Conversation, ConversationKey, ConversationStore, MessageId, Reconciler};
use crate::protocol::WorkflowArtifact;
use crate::streaming::{SessionOptions, SessionOutcome, StreamingState};
use crate::supervisor::{SessionSupervisor, SupervisorError, DEFAULT_MAX_MESSAGE_LENGTH};

/// Errors surfaced by [`ChatEngine`]
#[derive(Debug, Error)]
pub enum EngineError {
    /// The turn was rejected before it started
    #[error(transparent)]
    Rejected(#[from] SupervisorError),

    /// Backend call failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Configuration is unusable
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No fetcher was configured for refetching
    #[error("no conversation fetcher configured")]
    NoFetcher,
}

/// Engine configuration
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Per-session tuning
    pub session: SessionOptions,
    /// Maximum user message length in bytes
    pub max_message_length: usize,
    /// Default model for new turns
    pub model: String,
    /// Default temperature for new turns
    pub temperature: f32,
    /// Default token limit for new turns
    pub max_tokens: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            session: SessionOptions::default(),
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl EngineOptions {
    /// Derive from a loaded client configuration
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            session: config.session_options(),
            max_message_length: config.max_message_length,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

/// The client engine
pub struct ChatEngine {
    user_id: String,
    options: EngineOptions,
    store: Arc<ConversationStore>,
    reconciler: Reconciler,
    supervisor: SessionSupervisor,
    fetcher: Option<Arc<dyn ConversationFetcher>>,
}

impl ChatEngine {
    /// Create an engine for `user_id`
    pub fn new(
        user_id: impl Into<String>,
        options: EngineOptions,
        transport: Arc<dyn TurnTransport>,
        fetcher: Option<Arc<dyn ConversationFetcher>>,
    ) -> Self {
        let store = Arc::new(ConversationStore::new());
        let reconciler = Reconciler::new(store.clone());
        let supervisor = SessionSupervisor::new(transport, reconciler.clone(), options.session)
            .with_max_message_length(options.max_message_length);

        Self {
            user_id: user_id.into(),
            options,
            store,
            reconciler,
            supervisor,
            fetcher,
        }
    }

    /// Create an engine talking HTTP to the configured backend
    ///
    /// # Errors
    ///
    /// Fails if the configuration does not validate or the HTTP client
    /// cannot be built.
    pub fn from_config(user_id: impl Into<String>, config: &ClientConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let credentials: Arc<dyn CredentialProvider> = match &config.api_token {
            Some(token) => Arc::new(StaticCredentials::new(token.expose())),
            None => Arc::new(NoCredentials),
        };
        let backend = Arc::new(
            HttpBackend::new(config.base_url.clone(), config.connect_timeout)?
                .with_credentials(credentials)
                .with_retry(config.retry.clone()),
        );
        tracing::info!(base_url = %backend.base_url(), model = %config.model, "Chat engine configured");

        Ok(Self::new(
            user_id,
            EngineOptions::from_config(config),
            backend.clone(),
            Some(backend),
        ))
    }

    /// Signed-in user
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Engine options
    #[must_use]
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Start building a turn with the engine's defaults
    pub fn request(&self, text: impl Into<String>) -> TurnRequestBuilder {
        TurnRequest::builder(self.user_id.clone(), text)
            .model(self.options.model.clone())
            .temperature(self.options.temperature)
            .max_tokens(self.options.max_tokens)
    }

    /// Start a turn, superseding any turn in flight for its conversation
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rejected`] for empty or oversized messages.
    pub fn start_turn(&self, request: TurnRequest) -> Result<MessageId, EngineError> {
        Ok(self.supervisor.send(request)?)
    }

    /// Stop the turn in flight for `key`
    pub fn stop_turn(&self, key: &ConversationKey) -> bool {
        self.supervisor.stop(key)
    }

    /// Wait for the current turn of `key` to end
    ///
    /// The turn can still be stopped or superseded while this is pending;
    /// it then reports [`SessionOutcome::Cancelled`]. Returns `None` if no
    /// turn was started.
    pub async fn wait_turn(&self, key: &ConversationKey) -> Option<SessionOutcome> {
        self.supervisor.wait(key).await
    }

    /// Whether a turn is in flight for `key`
    #[must_use]
    pub fn is_active(&self, key: &ConversationKey) -> bool {
        self.supervisor.is_active(key)
    }

    /// Number of turns in flight
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.supervisor.active_count()
    }

    /// Observe the streaming state of a conversation
    pub fn streaming_state(&self, key: &ConversationKey) -> watch::Receiver<StreamingState> {
        self.reconciler.subscribe_streaming(key)
    }

    /// Observe the message list of a conversation
    pub fn conversation(&self, key: &ConversationKey) -> watch::Receiver<Conversation> {
        self.reconciler.subscribe_conversation(key)
    }

    /// Observe the workflow artifact of a conversation
    pub fn artifact(&self, key: &ConversationKey) -> watch::Receiver<Option<WorkflowArtifact>> {
        self.reconciler.subscribe_artifact(key)
    }

    /// Current message list, if cached
    #[must_use]
    pub fn conversation_snapshot(&self, key: &ConversationKey) -> Option<Conversation> {
        self.store.snapshot(key)
    }

    /// Replace the cached message list with the backend's
    ///
    /// Returns the number of messages fetched.
    ///
    /// # Errors
    ///
    /// Fails if no fetcher is configured or the fetch fails; the cache is
    /// left untouched in that case.
    pub async fn refresh(&self, key: &ConversationKey) -> Result<usize, EngineError> {
        let fetcher = self.fetcher.as_ref().ok_or(EngineError::NoFetcher)?;
        let messages = fetcher.fetch_messages(key).await.map_err(|e| {
            tracing::warn!(conversation = %key, error = %e, "Refetch failed");
            e
        })?;
        let count = messages.len();
        self.reconciler.apply_refetch(key, messages);
        Ok(count)
    }

    /// Stop every turn and drop all cached conversations
    pub fn sign_out(&self) {
        self.supervisor.stop_all();
        self.store.clear();
        tracing::info!(user = %self.user_id, "Signed out");
    }
}

impl std::fmt::Debug for ChatEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatEngine")
            .field("user_id", &self.user_id)
            .field("options", &self.options)
            .field("conversations", &self.store.len())
            .field("supervisor", &self.supervisor)
            .finish_non_exhaustive()
    }
}
