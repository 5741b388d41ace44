//! Generation Backend
//!
//! Everything the engine needs from the outside world: opening a turn's
//! event stream, fetching authoritative message lists, credentials, and the
//! retry policy for opening streams.

pub mod http;
pub mod in_process;
pub mod retry;
pub mod traits;

pub use http::{HttpBackend, DEFAULT_BASE_URL};
pub use in_process::{ChannelTransport, OpenedStream, ScriptedTransport};
pub use retry::RetryPolicy;
pub use traits::{
    ByteStream, ConversationFetcher, CredentialProvider, NoCredentials, StaticCredentials,
    TransportError, TurnRequest, TurnRequestBuilder, TurnTransport, DEFAULT_MAX_TOKENS,
    DEFAULT_MODEL, DEFAULT_TEMPERATURE,
};
