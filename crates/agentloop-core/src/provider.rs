//! LLM Provider Strategy Pattern
//!
//! Defines the provider-agnostic request/response contract and the common
//! interface every wire dialect implements, so the agent works with any
//! backend without code changes.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agentloop_core::provider::{ChatRequest, LlmProvider};
//!
//! let request = ChatRequest::new("gpt-4o-mini").with_messages(vec![Message::user("Hi")]);
//! let response = provider.send(&CallContext::new(), &request).await?;
//! ```

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::context::CallContext;
use crate::error::Result;
use crate::message::{Content, MediaPart, Message, Role, ToolCall};
use crate::schema::Schema;
use crate::tool::ToolDescription;

/// Sampling parameters. Unset fields fall back to the provider default.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Temperature for sampling (0.0 = deterministic, 1.0 = creative)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Top-p nucleus sampling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Stop sequences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

/// Built-in tool choice modes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoiceMode {
    Auto,
    None,
    Required,
}

/// An explicit tool choice value sent as-is
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForcedToolChoice {
    Mode(ToolChoiceMode),
    /// Force one tool by name
    Tool(String),
}

/// Tool choice policy.
///
/// Encoders honour the first populated field in this order: `forced`,
/// `at_least_one`, `required_tools`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolChoice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forced: Option<ForcedToolChoice>,

    /// The model must call at least one tool
    #[serde(default)]
    pub at_least_one: bool,

    /// The model must call one of these tools
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_tools: Vec<String>,
}

impl ToolChoice {
    pub fn forced(choice: ForcedToolChoice) -> Self {
        Self {
            forced: Some(choice),
            ..Default::default()
        }
    }

    pub fn at_least_one() -> Self {
        Self {
            at_least_one: true,
            ..Default::default()
        }
    }

    pub fn required(tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            required_tools: tools.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.forced.is_none() && !self.at_least_one && self.required_tools.is_empty()
    }
}

/// Schema the final answer must conform to
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputSchema {
    /// Name reported to the provider
    pub name: String,
    pub schema: Arc<Schema>,
    /// Ask the provider to enforce the schema exactly
    pub strict: bool,
}

/// Desired shape of the model's answer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Free-form type hint such as `text` or `json_object`
    Type(String),
    /// Binding schema
    Schema(OutputSchema),
}

/// Provider-agnostic chat request
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model identifier (e.g., "gpt-4o-mini", "llama3.2")
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    pub messages: Vec<Message>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDescription>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<GenerationConfig>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDescription>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = Some(choice);
        self
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = Some(format);
        self
    }

    pub fn with_generation(mut self, generation: GenerationConfig) -> Self {
        self.generation = Some(generation);
        self
    }
}

/// Reason for completion finishing
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    #[default]
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Error,
    Cancelled,
}

impl FinishReason {
    /// The turn ended and no further model call is expected
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stop | Self::Length | Self::ContentFilter)
    }
}

/// Token usage statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u32>,
}

impl Usage {
    /// Accumulate another turn's usage into this one
    pub fn add(&mut self, other: &Self) {
        fn sum(a: Option<u32>, b: Option<u32>) -> Option<u32> {
            match (a, b) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or(0).saturating_add(b.unwrap_or(0))),
            }
        }

        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
        self.reasoning_tokens = sum(self.reasoning_tokens, other.reasoning_tokens);
        self.cached_tokens = sum(self.cached_tokens, other.cached_tokens);
    }
}

/// Normalized response from any provider
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,

    /// Model that generated this response
    pub model: String,

    /// The generated text
    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refusal: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    pub finish_reason: FinishReason,

    /// Token usage statistics (if available)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    /// Generated media such as audio output
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaPart>,
}

impl ChatResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Assistant message carrying this response's content and tool calls
    pub fn to_message(&self) -> Message {
        Message {
            role: Role::Assistant,
            content: Content::Text(self.content.clone()),
            reasoning: self.reasoning.clone(),
            refusal: self.refusal.clone(),
            tool_calls: self.tool_calls.clone(),
            tool_call_id: None,
            name: None,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// One tool-call fragment within a stream
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    /// Position of the call; stable across its fragments
    pub index: u32,

    /// Present on the first fragment only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Present on the first fragment only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Arguments fragment, concatenated in arrival order
    #[serde(default)]
    pub arguments: String,
}

/// Incremental event from a streaming completion
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Content(String),
    Reasoning(String),
    ToolCallDelta(ToolCallDelta),
    Usage(Usage),
    Done(FinishReason),
}

/// Stream type for completion streaming
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Strategy trait for LLM providers
///
/// Implement this trait to add support for new LLM backends.
/// The agent works exclusively through this interface.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name used in logs and metrics
    fn name(&self) -> &str;

    /// Send a request and wait for the complete response
    async fn send(&self, ctx: &CallContext, request: &ChatRequest) -> Result<ChatResponse>;

    /// Start a streaming completion
    async fn start_stream(&self, ctx: &CallContext, request: &ChatRequest) -> Result<EventStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_reason_terminal() {
        assert!(FinishReason::Stop.is_terminal());
        assert!(FinishReason::Length.is_terminal());
        assert!(!FinishReason::ToolCalls.is_terminal());
        assert!(!FinishReason::Error.is_terminal());
    }

    #[test]
    fn test_usage_add() {
        let mut total = Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
            reasoning_tokens: None,
            cached_tokens: Some(2),
        };
        total.add(&Usage {
            prompt_tokens: 1,
            completion_tokens: 1,
            total_tokens: 2,
            reasoning_tokens: Some(4),
            cached_tokens: None,
        });
        assert_eq!(total.total_tokens, 17);
        assert_eq!(total.reasoning_tokens, Some(4));
        assert_eq!(total.cached_tokens, Some(2));
    }

    #[test]
    fn test_shared_output_schema_serde() {
        let format = ResponseFormat::Schema(OutputSchema {
            name: "Answer".into(),
            schema: Arc::new(Schema::object().property("answer", Schema::string(), true)),
            strict: true,
        });

        let value = serde_json::to_value(&format).unwrap();
        assert_eq!(value["schema"]["name"], "Answer");
        assert_eq!(value["schema"]["schema"]["required"][0], "answer");
        let back: ResponseFormat = serde_json::from_value(value).unwrap();
        assert_eq!(back, format);
    }

    #[test]
    fn test_usage_add_saturates() {
        let mut total = Usage {
            prompt_tokens: u32::MAX - 1,
            completion_tokens: 1,
            total_tokens: u32::MAX,
            reasoning_tokens: Some(u32::MAX),
            cached_tokens: None,
        };
        let turn = Usage {
            prompt_tokens: 5,
            completion_tokens: 5,
            total_tokens: 10,
            reasoning_tokens: Some(1),
            cached_tokens: None,
        };
        total.add(&turn);
        assert_eq!(total.prompt_tokens, u32::MAX);
        assert_eq!(total.completion_tokens, 6);
        assert_eq!(total.total_tokens, u32::MAX);
        assert_eq!(total.reasoning_tokens, Some(u32::MAX));
    }

    #[test]
    fn test_response_to_message_keeps_tool_calls() {
        let response = ChatResponse {
            content: "checking".into(),
            tool_calls: vec![ToolCall::new("c1", "lookup", "{}")],
            finish_reason: FinishReason::ToolCalls,
            ..Default::default()
        };
        let msg = response.to_message();
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(msg.tool_calls.len(), 1);
    }
}
