//! Protocol Events
//!
//! Typed events carried by the generation backend's event stream. Each wire
//! record is a single line `data: {json}` whose JSON object has a `type` tag
//! naming one of the variants below.

use serde::{Deserialize, Serialize};

/// Opaque workflow graph produced by a turn
///
/// The engine never inspects the artifact; it is handed to observers (the
/// canvas) as-is.
pub type WorkflowArtifact = serde_json::Value;

/// Prefix every wire record starts with
pub const RECORD_PREFIX: &str = "data: ";

/// Event decoded from the generation stream
///
/// `Done`, `Error` and `FinalResponse` are terminal: nothing after them is
/// valid for the same turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolEvent {
    /// Incremental reasoning text
    Thinking {
        /// Text delta
        content: String,
    },

    /// Reasoning phase ended
    ThinkingComplete,

    /// Human-readable status line
    Progress {
        /// Status text
        #[serde(alias = "message")]
        label: String,
    },

    /// A tool began executing
    #[serde(rename = "tool_start", alias = "tool_started")]
    ToolStarted {
        /// Tool name
        #[serde(alias = "tool")]
        name: String,
    },

    /// Incremental assistant-visible text
    #[serde(rename = "message", alias = "message_delta")]
    MessageDelta {
        /// Text delta
        content: String,
    },

    /// The workflow artifact became available
    #[serde(rename = "workflow", alias = "workflow_produced")]
    WorkflowProduced {
        /// The generated workflow graph
        #[serde(alias = "workflow")]
        workflow_data: WorkflowArtifact,
    },

    /// Stream ended successfully
    Done,

    /// Stream failed
    Error {
        /// Failure description
        message: String,
    },

    /// Authoritative summary of the turn
    FinalResponse {
        /// Final assistant text
        message: String,
        /// Workflow attached to the answer, if any
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workflow_data: Option<WorkflowArtifact>,
        /// Tokens consumed by the turn
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens_used: Option<u64>,
    },
}

/// Wire tags of the terminal variants
pub(crate) const TERMINAL_TAGS: &[&str] = &["done", "error", "final_response"];

impl ProtocolEvent {
    /// Whether no further events may follow this one
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Error { .. } | Self::FinalResponse { .. }
        )
    }

    /// Short name for logging
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Thinking { .. } => "thinking",
            Self::ThinkingComplete => "thinking_complete",
            Self::Progress { .. } => "progress",
            Self::ToolStarted { .. } => "tool_start",
            Self::MessageDelta { .. } => "message",
            Self::WorkflowProduced { .. } => "workflow",
            Self::Done => "done",
            Self::Error { .. } => "error",
            Self::FinalResponse { .. } => "final_response",
        }
    }

    /// Encode as a wire record (`data: {json}\n\n`)
    ///
    /// Serializing these variants cannot fail: every payload is plain JSON.
    #[must_use]
    pub fn to_record(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"));
        format!("{RECORD_PREFIX}{json}\n\n")
    }

    /// Convenience constructor for a message delta
    pub fn message(content: impl Into<String>) -> Self {
        Self::MessageDelta {
            content: content.into(),
        }
    }

    /// Convenience constructor for a thinking delta
    pub fn thinking(content: impl Into<String>) -> Self {
        Self::Thinking {
            content: content.into(),
        }
    }

    /// Convenience constructor for a final response without artifact
    pub fn final_text(message: impl Into<String>) -> Self {
        Self::FinalResponse {
            message: message.into(),
            workflow_data: None,
            tokens_used: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parse_wire_tags() {
        let cases = [
            (
                r#"{"type":"thinking","content":"hmm"}"#,
                ProtocolEvent::thinking("hmm"),
            ),
            (
                r#"{"type":"thinking_complete"}"#,
                ProtocolEvent::ThinkingComplete,
            ),
            (
                r#"{"type":"progress","message":"Searching docs"}"#,
                ProtocolEvent::Progress {
                    label: "Searching docs".to_string(),
                },
            ),
            (
                r#"{"type":"tool_start","tool":"workflow_generator"}"#,
                ProtocolEvent::ToolStarted {
                    name: "workflow_generator".to_string(),
                },
            ),
            (
                r#"{"type":"message","content":"Hi"}"#,
                ProtocolEvent::message("Hi"),
            ),
            (r#"{"type":"done"}"#, ProtocolEvent::Done),
            (
                r#"{"type":"error","message":"boom"}"#,
                ProtocolEvent::Error {
                    message: "boom".to_string(),
                },
            ),
        ];

        for (wire, expected) in cases {
            let parsed: ProtocolEvent = serde_json::from_str(wire).unwrap();
            assert_eq!(parsed, expected, "wire: {wire}");
        }
    }

    #[test]
    fn test_final_response_optional_fields() {
        let parsed: ProtocolEvent = serde_json::from_str(
            r#"{"type":"final_response","message":"Done!","workflow_data":{"name":"wf","nodes":[]},"tokens_used":42,"extra":true}"#,
        )
        .unwrap();

        assert_eq!(
            parsed,
            ProtocolEvent::FinalResponse {
                message: "Done!".to_string(),
                workflow_data: Some(json!({"name": "wf", "nodes": []})),
                tokens_used: Some(42),
            }
        );
        assert!(parsed.is_terminal());
    }

    #[test]
    fn test_workflow_alias() {
        let parsed: ProtocolEvent =
            serde_json::from_str(r#"{"type":"workflow_produced","workflow":{"nodes":[1]}}"#)
                .unwrap();
        assert_eq!(
            parsed,
            ProtocolEvent::WorkflowProduced {
                workflow_data: json!({"nodes": [1]}),
            }
        );
        assert!(!parsed.is_terminal());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let parsed = serde_json::from_str::<ProtocolEvent>(r#"{"type":"heartbeat"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_to_record_format() {
        let record = ProtocolEvent::message("Hello").to_record();
        assert_eq!(record, "data: {\"type\":\"message\",\"content\":\"Hello\"}\n\n");

        let record = ProtocolEvent::Done.to_record();
        assert_eq!(record, "data: {\"type\":\"done\"}\n\n");
    }

    #[test]
    fn test_terminal_classification() {
        assert!(ProtocolEvent::Done.is_terminal());
        assert!(ProtocolEvent::final_text("x").is_terminal());
        assert!(!ProtocolEvent::ThinkingComplete.is_terminal());
        assert!(!ProtocolEvent::message("x").is_terminal());
        for tag in TERMINAL_TAGS {
            assert!(["done", "error", "final_response"].contains(tag));
        }
    }
}
