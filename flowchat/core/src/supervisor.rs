//! Session Supervisor
//!
//! At most one streaming session per conversation. Sending a new turn for a
//! conversation supersedes the one in flight; sessions of other
//! conversations are never affected.
//!
//! Whether a conversation is active is read from the stored handle's task,
//! never tracked separately, so it cannot drift from reality.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::backend::{TurnRequest, TurnTransport};
use crate::conversation::{ConversationKey, MessageId, Reconciler};
use crate::streaming::session::wait_outcome;
use crate::streaming::{SessionHandle, SessionOptions, SessionOutcome, StreamingSession};

/// Default upper bound on a user message, in bytes
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 32_768;

/// Errors from [`SessionSupervisor::send`]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SupervisorError {
    /// Nothing to send
    #[error("message is empty")]
    EmptyMessage,

    /// Message exceeds the configured limit
    #[error("message is {length} bytes, limit is {limit}")]
    MessageTooLong {
        /// Actual length
        length: usize,
        /// Configured limit
        limit: usize,
    },
}

/// Starts, supersedes and stops streaming sessions
pub struct SessionSupervisor {
    transport: Arc<dyn TurnTransport>,
    reconciler: Reconciler,
    options: SessionOptions,
    max_message_length: usize,
    sessions: Mutex<HashMap<ConversationKey, SessionHandle>>,
}

impl SessionSupervisor {
    /// Create a supervisor
    #[must_use]
    pub fn new(
        transport: Arc<dyn TurnTransport>,
        reconciler: Reconciler,
        options: SessionOptions,
    ) -> Self {
        Self {
            transport,
            reconciler,
            options,
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Set the message length limit
    #[must_use]
    pub fn with_max_message_length(mut self, limit: usize) -> Self {
        self.max_message_length = limit;
        self
    }

    /// Reconciler shared with the sessions
    #[must_use]
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    fn validate(&self, request: &TurnRequest) -> Result<(), SupervisorError> {
        if request.user_message.trim().is_empty() {
            return Err(SupervisorError::EmptyMessage);
        }
        let length = request.user_message.len();
        if length > self.max_message_length {
            return Err(SupervisorError::MessageTooLong {
                length,
                limit: self.max_message_length,
            });
        }
        Ok(())
    }

    /// Start a turn, superseding any turn in flight for the same conversation
    ///
    /// Returns the request's correlation id. Must be called inside a tokio
    /// runtime.
    pub fn send(&self, request: TurnRequest) -> Result<MessageId, SupervisorError> {
        self.validate(&request)?;

        let key = request.key();
        let request_id = request.request_id.clone();
        let mut sessions = self.sessions.lock();

        if let Some(previous) = sessions.remove(&key) {
            if !previous.is_finished() {
                tracing::info!(
                    conversation = %key,
                    superseded = %previous.request_id(),
                    "Superseding active turn"
                );
            }
            previous.cancel();
        }

        let token = self.reconciler.begin_turn(&key);
        let handle = StreamingSession::start(
            request,
            self.transport.clone(),
            self.reconciler.clone(),
            token,
            self.options,
        );
        sessions.insert(key, handle);
        drop(sessions);

        tracing::debug!(request_id = %request_id, "Turn sent");
        Ok(request_id)
    }

    /// Cancel the turn for `key` without starting another
    ///
    /// Returns `true` if a session was still running.
    pub fn stop(&self, key: &ConversationKey) -> bool {
        let handle = self.sessions.lock().remove(key);
        let was_active = handle.as_ref().is_some_and(|h| !h.is_finished());
        if let Some(handle) = handle {
            handle.cancel();
        }
        self.reconciler.clear_streaming(key);
        if was_active {
            tracing::info!(conversation = %key, "Turn stopped");
        }
        was_active
    }

    /// Whether a session is running for `key`
    #[must_use]
    pub fn is_active(&self, key: &ConversationKey) -> bool {
        self.sessions
            .lock()
            .get(key)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Number of running sessions
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Correlation id of the turn for `key`, if one was started
    #[must_use]
    pub fn current_request(&self, key: &ConversationKey) -> Option<MessageId> {
        self.sessions
            .lock()
            .get(key)
            .map(|handle| handle.request_id().clone())
    }

    /// Wait for the turn of `key` to end
    ///
    /// The session stays registered, so [`Self::stop`] and [`Self::send`]
    /// still reach it while this is pending. A superseded or stopped turn
    /// reports [`SessionOutcome::Cancelled`]. Returns `None` if no turn was
    /// started for `key`.
    pub async fn wait(&self, key: &ConversationKey) -> Option<SessionOutcome> {
        let outcome = self
            .sessions
            .lock()
            .get(key)
            .map(SessionHandle::outcome_receiver)?;
        Some(wait_outcome(outcome).await)
    }

    /// Remove the handle for `key` so the caller can await it
    pub fn take_handle(&self, key: &ConversationKey) -> Option<SessionHandle> {
        self.sessions.lock().remove(key)
    }

    /// Cancel every session
    pub fn stop_all(&self) {
        let handles: Vec<SessionHandle> = self.sessions.lock().drain().map(|(_, h)| h).collect();
        let count = handles.len();
        for handle in handles {
            handle.cancel();
        }
        tracing::debug!(sessions = count, "All sessions stopped");
    }
}

impl Drop for SessionSupervisor {
    fn drop(&mut self) {
        for handle in self.sessions.get_mut().values() {
            handle.cancel();
        }
    }
}

impl std::fmt::Debug for SessionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSupervisor")
            .field("transport", &self.transport.name())
            .field("options", &self.options)
            .field("max_message_length", &self.max_message_length)
            .field("sessions", &self.sessions.lock().len())
            .finish()
    }
}
