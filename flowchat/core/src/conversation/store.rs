//! Conversation Store
//!
//! Explicit owner of every locally cached conversation. Created with the
//! engine, scoped to one signed-in user, and torn down with [`ConversationStore::clear`].
//!
//! Each conversation has a slot holding three `watch` channels (message list,
//! streaming state, workflow artifact) and the generation of the session that
//! is currently allowed to mutate it. Generations come from one store-wide
//! counter, so a token that has been superseded or retired never matches
//! again, not even after the slot was dropped and recreated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;

use super::model::{Conversation, ConversationKey};
use crate::protocol::WorkflowArtifact;
use crate::streaming::StreamingState;

/// Permission for one session to mutate one conversation
///
/// Compared against the slot's live generation under the store lock before
/// every guarded mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LivenessToken {
    key: ConversationKey,
    generation: u64,
}

impl LivenessToken {
    /// Conversation this token guards
    #[must_use]
    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    /// Generation number
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Channels and liveness of one conversation
#[derive(Debug)]
pub(crate) struct ConversationSlot {
    pub(crate) generation: u64,
    pub(crate) conversation: watch::Sender<Conversation>,
    pub(crate) streaming: watch::Sender<StreamingState>,
    pub(crate) artifact: watch::Sender<Option<WorkflowArtifact>>,
}

impl ConversationSlot {
    fn new(key: ConversationKey, generation: u64) -> Self {
        let (conversation, _) = watch::channel(Conversation::new(key));
        let (streaming, _) = watch::channel(StreamingState::default());
        let (artifact, _) = watch::channel(None);
        Self {
            generation,
            conversation,
            streaming,
            artifact,
        }
    }
}

/// Store of cached conversations
#[derive(Debug, Default)]
pub struct ConversationStore {
    slots: Mutex<HashMap<ConversationKey, ConversationSlot>>,
    next_generation: AtomicU64,
}

impl ConversationStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Run `f` on the slot for `key`, creating it if absent
    pub(crate) fn with_slot<R>(
        &self,
        key: &ConversationKey,
        f: impl FnOnce(&mut ConversationSlot) -> R,
    ) -> R {
        let mut slots = self.slots.lock();
        let slot = slots.entry(key.clone()).or_insert_with(|| {
            tracing::debug!(conversation = %key, "Creating conversation slot");
            ConversationSlot::new(key.clone(), 0)
        });
        f(slot)
    }

    /// Run `f` only if `token` is still the live generation for its conversation
    ///
    /// Returns `None` when the token is stale; nothing is touched in that case.
    pub(crate) fn with_live<R>(
        &self,
        token: &LivenessToken,
        f: impl FnOnce(&mut ConversationSlot) -> R,
    ) -> Option<R> {
        let mut slots = self.slots.lock();
        match slots.get_mut(&token.key) {
            Some(slot) if slot.generation == token.generation => Some(f(slot)),
            _ => {
                tracing::trace!(
                    conversation = %token.key,
                    generation = token.generation,
                    "Ignoring mutation from stale session"
                );
                None
            }
        }
    }

    /// Issue a new token for `key`, superseding any previous one
    pub fn issue(&self, key: &ConversationKey) -> LivenessToken {
        let generation = self.fresh_generation();
        self.with_slot(key, |slot| slot.generation = generation);
        LivenessToken {
            key: key.clone(),
            generation,
        }
    }

    /// Make `token` stale
    ///
    /// Returns `true` if it was the live token.
    pub fn retire(&self, token: &LivenessToken) -> bool {
        let generation = self.fresh_generation();
        self.with_live(token, |slot| slot.generation = generation)
            .is_some()
    }

    /// Whether `token` may still mutate its conversation
    #[must_use]
    pub fn is_live(&self, token: &LivenessToken) -> bool {
        self.slots
            .lock()
            .get(&token.key)
            .is_some_and(|slot| slot.generation == token.generation)
    }

    /// Observe the message list of a conversation
    pub fn subscribe_conversation(&self, key: &ConversationKey) -> watch::Receiver<Conversation> {
        self.with_slot(key, |slot| slot.conversation.subscribe())
    }

    /// Observe the streaming state of a conversation
    pub fn subscribe_streaming(&self, key: &ConversationKey) -> watch::Receiver<StreamingState> {
        self.with_slot(key, |slot| slot.streaming.subscribe())
    }

    /// Observe the workflow artifact of a conversation
    pub fn subscribe_artifact(
        &self,
        key: &ConversationKey,
    ) -> watch::Receiver<Option<WorkflowArtifact>> {
        self.with_slot(key, |slot| slot.artifact.subscribe())
    }

    /// Current message list, if the conversation is cached
    #[must_use]
    pub fn snapshot(&self, key: &ConversationKey) -> Option<Conversation> {
        self.slots
            .lock()
            .get(key)
            .map(|slot| slot.conversation.borrow().clone())
    }

    /// Current streaming state, if the conversation is cached
    #[must_use]
    pub fn streaming_snapshot(&self, key: &ConversationKey) -> Option<StreamingState> {
        self.slots
            .lock()
            .get(key)
            .map(|slot| slot.streaming.borrow().clone())
    }

    /// Whether a conversation is cached
    #[must_use]
    pub fn contains(&self, key: &ConversationKey) -> bool {
        self.slots.lock().contains_key(key)
    }

    /// Number of cached conversations
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether no conversation is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Drop every cached conversation (sign-out)
    ///
    /// Outstanding receivers observe their sender closing.
    pub fn clear(&self) {
        let dropped = {
            let mut slots = self.slots.lock();
            std::mem::take(&mut *slots)
        };
        tracing::debug!(conversations = dropped.len(), "Conversation store cleared");
    }
}
