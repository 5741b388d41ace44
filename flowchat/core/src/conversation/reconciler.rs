//! Conversation Cache Reconciler
//!
//! The only writer of cached conversations while a turn streams. Every
//! session-driven mutation carries the session's [`LivenessToken`] and is
//! applied only if the token is still live; each method reports whether it
//! changed anything.
//!
//! # Reconciliation rules
//!
//! - The optimistic user message uses the request id as both `id` and
//!   `client_id`, and is confirmed in place when the final response arrives.
//! - An assistant message is not appended twice for the same turn: the
//!   correlation id is checked first, then content equality within the
//!   current turn (messages after the most recent user message).
//! - An authoritative refetch replaces the list wholesale in one publication.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;

use super::model::{Conversation, ConversationKey, Message, MessageRole, MessageType};
use super::store::{ConversationStore, LivenessToken};
use crate::backend::TurnRequest;
use crate::protocol::WorkflowArtifact;
use crate::streaming::StreamingState;

/// Authoritative result of a turn
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FinalResponse {
    /// Assistant text
    pub message: String,
    /// Workflow attached to the answer
    pub workflow_data: Option<WorkflowArtifact>,
    /// Tokens consumed, if reported
    pub tokens_used: Option<u64>,
}

impl FinalResponse {
    /// Text-only response
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

/// User-facing text of the inline error message
#[must_use]
pub fn error_notice(detail: &str) -> String {
    format!("Sorry, I couldn't finish that response ({detail}). Please try again.")
}

/// Applies session events and refetches to the conversation store
#[derive(Clone, Debug)]
pub struct Reconciler {
    store: Arc<ConversationStore>,
}

impl Reconciler {
    /// Create a reconciler over `store`
    #[must_use]
    pub fn new(store: Arc<ConversationStore>) -> Self {
        Self { store }
    }

    /// Underlying store
    #[must_use]
    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Start a new turn for `key`
    ///
    /// Supersedes any earlier token and resets the streaming state.
    pub fn begin_turn(&self, key: &ConversationKey) -> LivenessToken {
        let token = self.store.issue(key);
        self.store.with_live(&token, |slot| {
            slot.streaming.send_replace(StreamingState::started());
        });
        tracing::debug!(
            conversation = %key,
            generation = token.generation(),
            "Turn started"
        );
        token
    }

    /// Append the optimistic user message
    pub fn on_session_start(&self, token: &LivenessToken, request: &TurnRequest) -> bool {
        self.store
            .with_live(token, |slot| {
                slot.conversation.send_modify(|conv| {
                    conv.messages.push(Message::optimistic_user(
                        &request.request_id,
                        request.user_message.clone(),
                    ));
                });
            })
            .is_some()
    }

    /// Publish a produced workflow
    ///
    /// The message list is not touched.
    pub fn on_workflow_produced(&self, token: &LivenessToken, artifact: WorkflowArtifact) -> bool {
        self.store
            .with_live(token, |slot| {
                slot.streaming
                    .send_modify(|state| state.workflow = Some(artifact.clone()));
                slot.artifact.send_replace(Some(artifact));
            })
            .is_some()
    }

    /// Record the final response of a turn
    ///
    /// Returns `true` only if an assistant message was appended.
    pub fn on_final_response(
        &self,
        token: &LivenessToken,
        request: &TurnRequest,
        response: FinalResponse,
    ) -> bool {
        if response.message.trim().is_empty() {
            tracing::debug!(conversation = %token.key(), "Empty final response ignored");
            self.confirm_user_message(token, request);
            return false;
        }

        let outcome = self.store.with_live(token, |slot| {
            let mut appended = false;
            slot.conversation.send_modify(|conv| {
                confirm(conv, request);
                if is_duplicate(conv, request, &response.message) {
                    tracing::debug!(
                        conversation = %conv.key,
                        request_id = %request.request_id,
                        "Final response already present, skipping"
                    );
                    return;
                }
                let mut message = Message::assistant(response.message.clone())
                    .with_client_id(request.request_id.clone());
                if let Some(workflow) = response.workflow_data.clone() {
                    message = message.with_workflow(workflow);
                }
                conv.messages.push(message);
                appended = true;
            });
            if let Some(workflow) = response.workflow_data {
                slot.artifact.send_replace(Some(workflow));
            }
            appended
        });
        outcome.unwrap_or(false)
    }

    /// Roll back the optimistic message and report the failure inline
    pub fn on_error(&self, token: &LivenessToken, request: &TurnRequest, detail: &str) -> bool {
        self.store
            .with_live(token, |slot| {
                slot.conversation.send_modify(|conv| {
                    conv.messages
                        .retain(|m| !(m.optimistic && m.correlates_with(&request.request_id)));
                    conv.messages.push(
                        Message::new(MessageRole::Assistant, MessageType::Error, error_notice(detail))
                            .with_client_id(request.request_id.clone()),
                    );
                });
                tracing::debug!(conversation = %token.key(), error = %detail, "Turn rolled back");
            })
            .is_some()
    }

    /// Mutate the streaming state
    pub fn update_streaming(
        &self,
        token: &LivenessToken,
        f: impl FnOnce(&mut StreamingState),
    ) -> bool {
        self.store
            .with_live(token, |slot| slot.streaming.send_modify(f))
            .is_some()
    }

    /// Mark the turn's streaming state as finished, keeping its text
    pub fn freeze_streaming(&self, token: &LivenessToken) -> bool {
        self.update_streaming(token, StreamingState::freeze)
    }

    /// Replace the message list with an authoritative one
    ///
    /// Allowed at any time. The streaming state is left alone.
    pub fn apply_refetch(&self, key: &ConversationKey, messages: Vec<Message>) {
        let count = messages.len();
        self.store.with_slot(key, |slot| {
            slot.conversation.send_modify(|conv| {
                conv.messages = messages;
                conv.synced_at = Some(Utc::now());
            });
        });
        tracing::debug!(conversation = %key, messages = count, "Applied authoritative refetch");
    }

    /// Reset the streaming state to idle
    pub fn clear_streaming(&self, key: &ConversationKey) {
        self.store.with_slot(key, |slot| {
            slot.streaming.send_if_modified(|state| {
                if *state == StreamingState::default() {
                    return false;
                }
                *state = StreamingState::default();
                true
            });
        });
    }

    /// Make `token` stale so its session can no longer mutate anything
    pub fn retire(&self, token: &LivenessToken) -> bool {
        self.store.retire(token)
    }

    /// Whether `token` is still live
    #[must_use]
    pub fn is_live(&self, token: &LivenessToken) -> bool {
        self.store.is_live(token)
    }

    /// Observe the message list
    pub fn subscribe_conversation(&self, key: &ConversationKey) -> watch::Receiver<Conversation> {
        self.store.subscribe_conversation(key)
    }

    /// Observe the streaming state
    pub fn subscribe_streaming(&self, key: &ConversationKey) -> watch::Receiver<StreamingState> {
        self.store.subscribe_streaming(key)
    }

    /// Observe the workflow artifact
    pub fn subscribe_artifact(
        &self,
        key: &ConversationKey,
    ) -> watch::Receiver<Option<WorkflowArtifact>> {
        self.store.subscribe_artifact(key)
    }

    fn confirm_user_message(&self, token: &LivenessToken, request: &TurnRequest) {
        self.store.with_live(token, |slot| {
            slot.conversation.send_if_modified(|conv| confirm(conv, request));
        });
    }
}

/// Confirm the optimistic user message of `request`, returning whether it changed
fn confirm(conv: &mut Conversation, request: &TurnRequest) -> bool {
    let mut changed = false;
    for message in conv
        .messages
        .iter_mut()
        .filter(|m| m.optimistic && m.correlates_with(&request.request_id))
    {
        message.optimistic = false;
        changed = true;
    }
    changed
}

fn is_duplicate(conv: &Conversation, request: &TurnRequest, content: &str) -> bool {
    let assistant = |m: &&Message| m.role == MessageRole::Assistant;

    conv.messages
        .iter()
        .filter(assistant)
        .any(|m| m.correlates_with(&request.request_id))
        || conv
            .current_turn()
            .iter()
            .filter(assistant)
            .any(|m| m.content == content)
}
