//! Conversation Model
//!
//! Messages and conversations as the UI sees them. The same types are used
//! for the optimistic local copy and for lists fetched from the backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::WorkflowArtifact;

// ============================================================================
// Identifiers
// ============================================================================

/// Message identifier
///
/// Client-generated ids are UUID v4 strings; server ids are kept verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// Generate a new unique client-side message ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the raw id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Key of a conversation in the local store
///
/// Turns sent before the backend has assigned a conversation id land in the
/// user's orphan bucket.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKey {
    /// A backend conversation
    Conversation(String),
    /// Messages not yet attached to a conversation
    Orphan {
        /// Owner of the bucket
        user_id: String,
    },
}

impl ConversationKey {
    /// Key for a known conversation id
    pub fn conversation(id: impl Into<String>) -> Self {
        Self::Conversation(id.into())
    }

    /// Orphan bucket for a user
    pub fn orphan(user_id: impl Into<String>) -> Self {
        Self::Orphan {
            user_id: user_id.into(),
        }
    }

    /// Derive the key from an optional conversation id
    #[must_use]
    pub fn resolve(conversation_id: Option<&str>, user_id: &str) -> Self {
        match conversation_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => Self::conversation(id),
            None => Self::orphan(user_id),
        }
    }

    /// Backend conversation id, if this is not the orphan bucket
    #[must_use]
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::Conversation(id) => Some(id),
            Self::Orphan { .. } => None,
        }
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conversation(id) => write!(f, "{id}"),
            Self::Orphan { user_id } => write!(f, "orphan:{user_id}"),
        }
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Who sent a message
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// The human
    #[default]
    User,
    /// The AI
    Assistant,
    /// System notices stored by the backend
    System,
}

/// How a message should be rendered
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Plain text
    #[default]
    Text,
    /// Text with an attached workflow
    Workflow,
    /// Inline failure notice
    Error,
    /// Documentation search results
    SearchResults,
}

/// A message in a conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: MessageId,
    /// Message content
    pub content: String,
    /// Who sent this message
    pub role: MessageRole,
    /// Rendering hint
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    /// Workflow attached to the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_data: Option<WorkflowArtifact>,
    /// When the message was created
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Correlation id of the turn that produced this message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<MessageId>,
    /// Shown locally but not yet confirmed by the backend
    #[serde(skip)]
    pub optimistic: bool,
}

impl Message {
    /// Create a new message
    pub fn new(role: MessageRole, message_type: MessageType, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            content: content.into(),
            role,
            message_type,
            workflow_data: None,
            created_at: Utc::now(),
            client_id: None,
            optimistic: false,
        }
    }

    /// Create a user text message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, MessageType::Text, content)
    }

    /// Create an assistant text message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, MessageType::Text, content)
    }

    /// Optimistic user message for a turn, keyed by the request id
    pub fn optimistic_user(request_id: &MessageId, content: impl Into<String>) -> Self {
        Self {
            id: request_id.clone(),
            client_id: Some(request_id.clone()),
            optimistic: true,
            ..Self::user(content)
        }
    }

    /// Attach a workflow (switches the type to `workflow`)
    #[must_use]
    pub fn with_workflow(mut self, workflow: WorkflowArtifact) -> Self {
        self.workflow_data = Some(workflow);
        self.message_type = MessageType::Workflow;
        self
    }

    /// Tag with the turn's correlation id
    #[must_use]
    pub fn with_client_id(mut self, client_id: MessageId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Whether this message belongs to the given turn
    #[must_use]
    pub fn correlates_with(&self, request_id: &MessageId) -> bool {
        self.client_id.as_ref() == Some(request_id)
    }
}

// ============================================================================
// Conversation
// ============================================================================

/// Ordered message history of one conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Store key
    pub key: ConversationKey,
    /// Messages in display order
    pub messages: Vec<Message>,
    /// When the list was last replaced by an authoritative fetch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
}

impl Conversation {
    /// Create an empty conversation
    #[must_use]
    pub fn new(key: ConversationKey) -> Self {
        Self {
            key,
            messages: Vec::new(),
            synced_at: None,
        }
    }

    /// Number of messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether there are no messages
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Most recent message
    #[must_use]
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Find a message by id
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    /// Messages still awaiting confirmation
    pub fn optimistic(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.optimistic)
    }

    /// Messages after the most recent user message (the current turn)
    #[must_use]
    pub fn current_turn(&self) -> &[Message] {
        let start = self
            .messages
            .iter()
            .rposition(|m| m.role == MessageRole::User)
            .map_or(0, |idx| idx + 1);
        &self.messages[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_resolution() {
        assert_eq!(
            ConversationKey::resolve(Some("conv-1"), "u1"),
            ConversationKey::conversation("conv-1")
        );
        assert_eq!(
            ConversationKey::resolve(None, "u1"),
            ConversationKey::orphan("u1")
        );
        assert_eq!(
            ConversationKey::resolve(Some("  "), "u1"),
            ConversationKey::orphan("u1")
        );
        assert_eq!(ConversationKey::orphan("u1").to_string(), "orphan:u1");
        assert_eq!(ConversationKey::conversation("c").conversation_id(), Some("c"));
    }

    #[test]
    fn test_message_ids_unique() {
        let a = MessageId::new();
        let b = MessageId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_optimistic_user_message() {
        let request_id = MessageId::new();
        let msg = Message::optimistic_user(&request_id, "hi");

        assert_eq!(msg.id, request_id);
        assert!(msg.optimistic);
        assert!(msg.correlates_with(&request_id));
        assert_eq!(msg.role, MessageRole::User);
        assert_eq!(msg.message_type, MessageType::Text);
    }

    #[test]
    fn test_deserialize_backend_message() {
        let msg: Message = serde_json::from_value(json!({
            "id": "srv-1",
            "content": "Here you go",
            "role": "assistant",
            "type": "workflow",
            "workflow_data": {"name": "wf"},
            "created_at": "2025-01-02T03:04:05Z"
        }))
        .unwrap();

        assert_eq!(msg.id, MessageId::from("srv-1"));
        assert_eq!(msg.message_type, MessageType::Workflow);
        assert!(msg.workflow_data.is_some());
        assert!(!msg.optimistic);
        assert!(msg.client_id.is_none());
    }

    #[test]
    fn test_deserialize_minimal_message() {
        let msg: Message = serde_json::from_value(json!({
            "id": "srv-2",
            "content": "results",
            "role": "system",
            "type": "search_results"
        }))
        .unwrap();

        assert_eq!(msg.role, MessageRole::System);
        assert_eq!(msg.message_type, MessageType::SearchResults);
    }

    #[test]
    fn test_current_turn_window() {
        let mut conv = Conversation::new(ConversationKey::conversation("c"));
        assert!(conv.current_turn().is_empty());

        conv.messages.push(Message::user("first"));
        conv.messages.push(Message::assistant("answer"));
        conv.messages.push(Message::user("second"));
        assert!(conv.current_turn().is_empty());

        conv.messages.push(Message::assistant("reply"));
        let turn = conv.current_turn();
        assert_eq!(turn.len(), 1);
        assert_eq!(turn[0].content, "reply");
    }
}
