//! Streaming State
//!
//! Transient per-conversation view of the turn being generated. It is not
//! part of the persisted message list.

use serde::Serialize;

use super::throttle::{Flush, StreamField};
use crate::protocol::WorkflowArtifact;

/// Observable state of an in-flight turn
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StreamingState {
    /// A session is producing events
    pub is_streaming: bool,
    /// Accumulated reasoning text
    pub thinking_text: String,
    /// Accumulated assistant text
    pub message_text: String,
    /// Latest status line
    pub progress_label: Option<String>,
    /// Tools started during the turn, in order
    pub tools_started: Vec<String>,
    /// Workflow produced by the turn
    pub workflow: Option<WorkflowArtifact>,
    /// The reasoning phase has ended
    pub thinking_complete: bool,
}

impl StreamingState {
    /// Empty state for a turn that just started
    #[must_use]
    pub fn started() -> Self {
        Self {
            is_streaming: true,
            ..Self::default()
        }
    }

    /// Append flushed text to its field
    pub fn apply_flush(&mut self, flush: &Flush) {
        match flush.field {
            StreamField::Thinking => self.thinking_text.push_str(&flush.text),
            StreamField::Message => self.message_text.push_str(&flush.text),
        }
    }

    /// Stop streaming, keeping the accumulated text
    pub fn freeze(&mut self) {
        self.is_streaming = false;
        self.progress_label = None;
    }

    /// Whether nothing has been produced yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.thinking_text.is_empty()
            && self.message_text.is_empty()
            && self.tools_started.is_empty()
            && self.workflow.is_none()
    }
}
