//! Flowchat Core - Streaming Chat and Conversation Sync
//!
//! Client-side engine for a conversational workflow generator. A user sends a
//! message, the backend streams back an assistant reply as a sequence of
//! `data:` records (progress, thinking, message deltas, a produced workflow,
//! then a terminal record), and the engine keeps a local conversation list in
//! step with the server: optimistic insert on send, confirmation on the final
//! response, authoritative refetch on demand.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         UI Surface                           │
//! │   watch::Receiver<Conversation>  watch::Receiver<Streaming>  │
//! └──────────────┬────────────────────────────────▲──────────────┘
//!                │ start_turn / stop_turn         │ publish
//! ┌──────────────▼────────────────────────────────┴──────────────┐
//! │                         ChatEngine                           │
//! │  ┌─────────────────┐   ┌──────────────┐   ┌───────────────┐  │
//! │  │SessionSupervisor│──▶│ Streaming    │──▶│  Reconciler   │  │
//! │  │ one per convo   │   │ Session      │   │  + Store      │  │
//! │  └─────────────────┘   │ decoder      │   │  liveness     │  │
//! │                        │ throttler    │   └───────────────┘  │
//! │                        └──────▲───────┘                      │
//! └───────────────────────────────┼──────────────────────────────┘
//!                                 │ ByteStream
//!                      ┌──────────┴──────────┐
//!                      │   TurnTransport     │
//!                      │ (HTTP / in-process) │
//!                      └─────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`ChatEngine`]: front door owning the store, supervisor and fetcher
//! - [`StreamingSession`]: consumes one turn's event stream
//! - [`FrameDecoder`]: splits raw bytes into [`ProtocolEvent`]s
//! - [`UpdateThrottler`]: coalesces text deltas into bounded-rate updates
//! - [`Reconciler`]: every mutation of cached conversation state
//! - [`ConversationStore`]: per-conversation cache with liveness tokens
//!
//! # Quick Start
//!
//! ```ignore
//! use flowchat_core::{config::load_config, ChatEngine, ConversationKey};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config()?;
//!     let engine = ChatEngine::from_config("user-1", &config)?;
//!
//!     let key = ConversationKey::conversation("c-42");
//!     let mut streaming = engine.streaming_state(&key);
//!     engine.start_turn(engine.request("Build me a workflow").conversation("c-42").build())?;
//!
//!     while streaming.changed().await.is_ok() {
//!         let state = streaming.borrow_and_update().clone();
//!         println!("{}", state.message_text);
//!         if !state.is_streaming {
//!             break;
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`protocol`]: wire records and the frame decoder
//! - [`streaming`]: sessions, throttling and the published streaming state
//! - [`conversation`]: messages, the store and the reconciler
//! - [`backend`]: transports, fetchers, credentials and retry
//! - [`supervisor`]: one session per conversation, supersede on send
//! - [`engine`]: the facade a UI talks to
//! - [`config`]: TOML, environment and default configuration

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod protocol;
pub mod streaming;
pub mod supervisor;

// Re-exports for convenience
pub use backend::{
    ConversationFetcher, CredentialProvider, HttpBackend, RetryPolicy, TransportError,
    TurnRequest, TurnTransport,
};
pub use config::{ClientConfig, ConfigError, ConfigOverrides};
pub use conversation::{
    Conversation, ConversationKey, ConversationStore, FinalResponse, LivenessToken, Message,
    MessageId, MessageRole, MessageType, Reconciler,
};
pub use engine::{ChatEngine, EngineError, EngineOptions};
pub use protocol::{FrameDecoder, ProtocolEvent, WorkflowArtifact};
pub use streaming::{
    SessionHandle, SessionOptions, SessionOutcome, StreamingSession, StreamingState,
    UpdateThrottler,
};
pub use supervisor::{SessionSupervisor, SupervisorError};
