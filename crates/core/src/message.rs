//! Message domain types.
//!
//! Messages are the value objects that flow through the whole engine:
//! the user asks, the provider answers or requests tools, tools report back.
//! Once appended to a session history a message is only ever touched by
//! compaction, and compaction only rewrites `tool` content and image lists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an agent session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// System preamble (instructions, recalled experience)
    System,
    /// Tool execution result
    Tool,
}

/// A multimodal attachment carried by a user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    /// MIME type, e.g. `image/png`.
    pub media_type: String,

    /// Either a URL or base64 payload, passed through to the provider untouched.
    pub source: String,
}

impl ImageRef {
    pub fn new(media_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            source: source.into(),
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,

    /// Image attachments (user messages only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageRef>,

    /// Tool calls requested by the assistant (if any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,

    /// If this is a tool result, which tool call it responds to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Cached token estimate; cleared whenever compaction rewrites the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_estimate: Option<usize>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,

    /// Optional metadata (compaction markers, provider info, etc.)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Message {
    fn new(role: Role, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            images: Vec::new(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            token_estimate: None,
            timestamp: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content.into())
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content.into())
    }

    /// Create an assistant message that requests tool calls.
    pub fn assistant_with_tools(
        content: impl Into<String>,
        tool_calls: Vec<MessageToolCall>,
    ) -> Self {
        let mut msg = Self::new(Role::Assistant, content.into());
        msg.tool_calls = tool_calls;
        msg
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content.into())
    }

    /// Create a tool result message.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Tool, content.into());
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    /// Attach images to this message.
    pub fn with_images(mut self, images: Vec<ImageRef>) -> Self {
        self.images = images;
        self
    }

    /// Whether compaction already collapsed this tool message.
    pub fn is_collapsed(&self) -> bool {
        self.metadata
            .get(COLLAPSED_KEY)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Mark this message as collapsed and drop the cached estimate.
    pub fn mark_collapsed(&mut self) {
        self.metadata
            .insert(COLLAPSED_KEY.into(), serde_json::Value::Bool(true));
        self.token_estimate = None;
    }
}

/// Metadata key set on tool messages whose content has been collapsed.
pub const COLLAPSED_KEY: &str = "collapsed";

/// A tool call embedded in an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageToolCall {
    /// Unique ID for this tool call
    pub id: String,

    /// Name of the tool to invoke
    pub name: String,

    /// Arguments as JSON string
    pub arguments: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_user_message() {
        let msg = Message::user("Hello, agent!");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "Hello, agent!");
        assert!(msg.tool_calls.is_empty());
        assert!(msg.images.is_empty());
    }

    #[test]
    fn message_serialization_roundtrip() {
        let msg = Message::user("Test message").with_images(vec![ImageRef::new(
            "image/png",
            "https://example.invalid/a.png",
        )]);
        let json = serde_json::to_string(&msg).unwrap();
        let deserialized: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.content, "Test message");
        assert_eq!(deserialized.role, Role::User);
        assert_eq!(deserialized.images.len(), 1);
    }

    #[test]
    fn collapse_marker_clears_estimate() {
        let mut msg = Message::tool_result("call_1", "lots of output");
        msg.token_estimate = Some(42);
        assert!(!msg.is_collapsed());
        msg.mark_collapsed();
        assert!(msg.is_collapsed());
        assert!(msg.token_estimate.is_none());
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
        assert_eq!(SessionId::from("abc").to_string(), "abc");
    }
}
