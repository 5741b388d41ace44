//! Conversations
//!
//! Local cache of conversations and the rules for keeping it consistent with
//! the backend while turns stream.
//!
//! - [`model`]: messages, conversations and their keys
//! - [`store`]: the cache itself and liveness tokens
//! - [`reconciler`]: the only writer during a session

pub mod model;
pub mod reconciler;
pub mod store;

pub use model::{Conversation, ConversationKey, Message, MessageId, MessageRole, MessageType};
pub use reconciler::{FinalResponse, Reconciler};
pub use store::{ConversationStore, LivenessToken};
