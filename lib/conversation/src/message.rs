//! Message types for conversations.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use speda_core::MessageId;
use std::fmt;

/// The role of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// User/human message.
    User,
    /// Assistant/AI message.
    Assistant,
    /// Tool call and its result.
    Tool,
}

impl MessageRole {
    /// Returns the lowercase role name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            other => Err(format!("unknown message role '{other}'")),
        }
    }
}

/// A message in a conversation.
///
/// Messages are immutable once appended to a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Message role.
    pub role: MessageRole,
    /// Message content. For tool messages, the JSON result handed to the model.
    pub content: String,
    /// Image attachments (user messages only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// The resolved call (tool messages only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallRecord>,
    /// When the message was created.
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content: content.into(),
            attachments: Vec::new(),
            tool_call: None,
            created_at: Utc::now(),
        }
    }

    /// Creates a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Creates an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// Creates a tool message from a resolved call.
    #[must_use]
    pub fn tool(record: ToolCallRecord) -> Self {
        let mut msg = Self::new(MessageRole::Tool, record.result_payload().to_string());
        msg.tool_call = Some(record);
        msg
    }

    /// Adds attachments.
    #[must_use]
    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Reference to binary image content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// A `data:` URL or an external reference such as a file-service URL.
    pub reference: String,
    /// MIME type of the content.
    pub mime_type: String,
}

/// Error returned when a submitted image cannot be interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidAttachment {
    /// Why the image was rejected.
    pub reason: String,
}

impl fmt::Display for InvalidAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid image attachment: {}", self.reason)
    }
}

impl std::error::Error for InvalidAttachment {}

impl Attachment {
    /// Normalizes an image submitted with a turn.
    ///
    /// Inline base64 becomes a `data:` URL with a sniffed MIME type. `data:`
    /// URLs and external references are passed through.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAttachment` for empty input, malformed `data:` URLs,
    /// or inline content that is not valid base64.
    pub fn from_submitted(raw: &str) -> Result<Self, InvalidAttachment> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(InvalidAttachment {
                reason: "empty image".to_string(),
            });
        }

        if let Some(rest) = raw.strip_prefix("data:") {
            let (header, _) = rest.split_once(',').ok_or_else(|| InvalidAttachment {
                reason: "data URL has no payload".to_string(),
            })?;
            let mime_type = header.split(';').next().unwrap_or_default();
            return Ok(Self {
                reference: raw.to_string(),
                mime_type: if mime_type.is_empty() {
                    "application/octet-stream".to_string()
                } else {
                    mime_type.to_string()
                },
            });
        }

        if raw.starts_with("http://") || raw.starts_with("https://") || raw.starts_with('/') {
            return Ok(Self {
                reference: raw.to_string(),
                mime_type: mime_from_extension(raw).to_string(),
            });
        }

        let bytes = STANDARD.decode(raw).map_err(|e| InvalidAttachment {
            reason: e.to_string(),
        })?;
        let mime_type = sniff_image_mime(&bytes);
        Ok(Self {
            reference: format!("data:{mime_type};base64,{raw}"),
            mime_type: mime_type.to_string(),
        })
    }

    /// Returns true if the content is embedded in the reference.
    #[must_use]
    pub fn is_inline(&self) -> bool {
        self.reference.starts_with("data:")
    }
}

fn sniff_image_mime(bytes: &[u8]) -> &'static str {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ => "image/jpeg",
    }
}

fn mime_from_extension(reference: &str) -> &'static str {
    let path = reference.split(['?', '#']).next().unwrap_or(reference);
    let ext = path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

/// How a tool call was resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    /// The tool ran and returned a payload.
    Success { result: JsonValue },
    /// The tool ran and failed; the message is shown to the model.
    Error { message: String },
    /// The tool was not run because the action needs explicit confirmation.
    NeedsConfirmation { message: String },
}

impl ToolOutcome {
    /// Returns true for a successful execution.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// A tool call requested by the model together with its resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Call identifier assigned by the model.
    pub call_id: String,
    /// The tool name.
    pub name: String,
    /// Arguments for the tool.
    pub arguments: JsonValue,
    /// The resolution.
    pub outcome: ToolOutcome,
}

impl ToolCallRecord {
    /// Returns the result object sent to the client and the model.
    ///
    /// Non-object success payloads are wrapped as `{"result": ...}`.
    #[must_use]
    pub fn result_payload(&self) -> JsonValue {
        match &self.outcome {
            ToolOutcome::Success { result } if result.is_object() => result.clone(),
            ToolOutcome::Success { result } => json!({ "result": result }),
            ToolOutcome::Error { message } => json!({ "error": message }),
            ToolOutcome::NeedsConfirmation { message } => json!({
                "status": "needs_confirmation",
                "tool": self.name,
                "arguments": self.arguments,
                "message": message,
            }),
        }
    }
}
