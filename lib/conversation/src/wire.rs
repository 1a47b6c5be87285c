//! Wire events streamed to the client.
//!
//! Each event is framed as `data: ` + compact JSON + a blank line.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use speda_core::ConversationId;

/// One event of a turn's outbound stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireEvent {
    /// First event of every stream.
    Start { conversation_id: ConversationId },
    /// Incremental answer text.
    Chunk { content: String },
    /// A tool is about to run.
    FunctionStart { name: String },
    /// A tool call was resolved.
    FunctionResult { name: String, result: JsonValue },
    /// The conversation got a title.
    TitleGenerated { title: String },
    /// The turn completed; carries the full final text.
    Done { content: String },
    /// The turn failed.
    Error { message: String },
}

impl WireEvent {
    /// Returns true for the events that end a stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// Encodes the event as one SSE frame.
    #[must_use]
    pub fn to_sse_frame(&self) -> String {
        // Serializing a tagged enum of strings and JSON values cannot fail.
        let json = serde_json::to_string(self).unwrap_or_else(|e| {
            serde_json::json!({ "type": "error", "message": e.to_string() }).to_string()
        });
        format!("data: {json}\n\n")
    }
}
