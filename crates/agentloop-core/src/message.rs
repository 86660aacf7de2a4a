//! Conversation Messages
//!
//! Standard message format used across the agent system. Messages are
//! provider-agnostic; the runtime crate maps them onto a wire dialect.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a message sender
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt/instructions
    System,
    /// User input
    User,
    /// Assistant (LLM) response
    Assistant,
    /// Tool result (injected as context)
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// Kind of non-text content
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Document,
}

/// Where the bytes of a media part live
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaSource {
    /// Raw bytes carried in the message
    Inline(Vec<u8>),
    /// Remote location the provider fetches itself
    Uri(String),
}

/// Image, audio, video or document attached to a message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPart {
    pub kind: MediaKind,

    /// MIME type, e.g. `image/png` or `audio/wav`
    pub mime_type: String,

    pub source: MediaSource,
}

impl MediaPart {
    pub fn inline(kind: MediaKind, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            kind,
            mime_type: mime_type.into(),
            source: MediaSource::Inline(data),
        }
    }

    pub fn uri(kind: MediaKind, mime_type: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            kind,
            mime_type: mime_type.into(),
            source: MediaSource::Uri(uri.into()),
        }
    }

    /// Subtype half of the MIME type (`wav` for `audio/wav`)
    pub fn mime_subtype(&self) -> Option<&str> {
        self.mime_type
            .split_once('/')
            .map(|(_, sub)| sub.split(';').next().unwrap_or(sub).trim())
            .filter(|sub| !sub.is_empty())
    }
}

/// One element of multimodal message content
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Media(MediaPart),
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Scalar text or ordered content parts
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for Content {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl Content {
    /// Text view of the content; text parts are joined, media is skipped
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Media(_) => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Parts(parts) => parts.is_empty(),
        }
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

/// Function name and JSON-encoded arguments of a tool call
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,

    /// Arguments as a JSON string, not yet parsed
    pub arguments: String,
}

/// Tool call request from the LLM
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned ID; empty when recovered from plain text
    #[serde(default)]
    pub id: String,

    /// Call type, currently always `function`
    #[serde(rename = "type", default = "function_call_type")]
    pub call_type: String,

    pub function: FunctionCall,
}

fn function_call_type() -> String {
    "function".into()
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: function_call_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// Tool name
    pub fn name(&self) -> &str {
        &self.function.name
    }

    /// Raw arguments string
    pub fn arguments(&self) -> &str {
        &self.function.arguments
    }
}

/// A single message in a conversation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    /// Message role
    pub role: Role,

    /// Text or multimodal content
    #[serde(default)]
    pub content: Content,

    /// Chain-of-thought returned separately from the answer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    /// Refusal text, when the model declined
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refusal: Option<String>,

    /// Tool calls requested by an assistant message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Tool call this tool-role message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Function name of the answered tool call (tool role only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Timestamp
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a new message
    pub fn new(role: Role, content: impl Into<Content>) -> Self {
        Self {
            role,
            content: content.into(),
            reasoning: None,
            refusal: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<Content>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<Content>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<Content>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create a tool result message answering `call`
    pub fn tool(call: &ToolCall, content: impl Into<Content>) -> Self {
        let mut msg = Self::new(Role::Tool, content);
        msg.tool_call_id = Some(call.id.clone());
        msg.name = Some(call.function.name.clone());
        msg
    }

    /// Attach tool calls (assistant messages)
    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    /// Attach separately returned reasoning
    pub fn with_reasoning(mut self, reasoning: Option<String>) -> Self {
        self.reasoning = reasoning;
        self
    }

    /// Text view of the content
    pub fn text(&self) -> String {
        self.content.as_text()
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = Message::user("Hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.text(), "Hello");
    }

    #[test]
    fn test_tool_message_links_call() {
        let call = ToolCall::new("call_1", "weather", r#"{"city":"Oslo"}"#);
        let msg = Message::tool(&call, "sunny");
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(msg.name.as_deref(), Some("weather"));
    }

    #[test]
    fn test_parts_text_view_skips_media() {
        let content = Content::Parts(vec![
            ContentPart::text("look at this"),
            ContentPart::Media(MediaPart::uri(MediaKind::Image, "image/png", "https://x/y.png")),
            ContentPart::text("and this"),
        ]);
        assert_eq!(content.as_text(), "look at this\nand this");
    }

    #[test]
    fn test_mime_subtype() {
        let part = MediaPart::inline(MediaKind::Audio, "audio/wav; codecs=1", vec![1, 2]);
        assert_eq!(part.mime_subtype(), Some("wav"));
        let bare = MediaPart::inline(MediaKind::Audio, "audio", vec![]);
        assert_eq!(bare.mime_subtype(), None);
    }

    #[test]
    fn test_tool_call_defaults_type_on_deserialize() {
        let call: ToolCall =
            serde_json::from_str(r#"{"function":{"name":"calc","arguments":"{}"}}"#).unwrap();
        assert_eq!(call.call_type, "function");
        assert!(call.id.is_empty());
    }
}
