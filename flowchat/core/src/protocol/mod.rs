//! Generation Stream Protocol
//!
//! Wire format spoken by the generation backend: newline-delimited
//! `data: {json}` records, each carrying one [`ProtocolEvent`].
//!
//! - [`event`]: the typed event union and its wire encoding
//! - [`decoder`]: incremental byte-stream decoder

pub mod decoder;
pub mod event;

pub use decoder::FrameDecoder;
pub use event::{ProtocolEvent, WorkflowArtifact, RECORD_PREFIX};
