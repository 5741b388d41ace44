//! Streaming Infrastructure
//!
//! One [`StreamingSession`] per in-flight turn. The session owns a decoder
//! and an [`UpdateThrottler`], and publishes a coalesced [`StreamingState`]
//! through the reconciler.
//!
//! # Features
//!
//! - **Throttled updates**: at most one update per text field per interval
//! - **No lost deltas**: pending text is flushed before every terminal event
//! - **Explicit cancellation**: a retired session can no longer mutate state

pub mod session;
pub mod state;
pub mod throttle;

pub use session::{
    SessionHandle, SessionOptions, SessionOutcome, StreamingSession, CLOSED_EARLY,
    DEFAULT_IDLE_TIMEOUT,
};
pub use state::StreamingState;
pub use throttle::{Flush, StreamField, UpdateThrottler, DEFAULT_THROTTLE_INTERVAL};
