//! Per-host dialect capabilities
//!
//! OpenAI-compatible servers differ in which parts of the API they accept.
//! The capability record is derived once from the base URL and then drives
//! request encoding and response post-processing.

use serde::{Deserialize, Serialize};
use url::Url;

/// Wire features a provider endpoint understands
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    /// `tools` / `tool_choice`; otherwise legacy `functions` / `function_call`
    pub tools: bool,

    /// `tool_choice` of type `allowed_tools`
    pub allowed_tools: bool,

    /// `response_format` of type `json_schema`; otherwise `json_object`
    pub json_schema: bool,

    /// Tool calls may arrive as JSON text inside the content
    pub text_tool_calls: bool,

    /// Chain-of-thought may arrive wrapped in `<think>` tags
    pub reasoning_tags: bool,

    /// `max_completion_tokens` instead of `max_tokens`
    pub max_completion_tokens: bool,

    /// `stream_options.include_usage`
    pub stream_usage: bool,
}

impl Default for ProviderCapabilities {
    /// Conservative OpenAI-compatible baseline
    fn default() -> Self {
        Self {
            tools: true,
            allowed_tools: false,
            json_schema: false,
            text_tool_calls: false,
            reasoning_tags: true,
            max_completion_tokens: false,
            stream_usage: false,
        }
    }
}

impl ProviderCapabilities {
    /// Full feature set of the canonical OpenAI API
    pub const fn openai() -> Self {
        Self {
            tools: true,
            allowed_tools: true,
            json_schema: true,
            text_tool_calls: false,
            reasoning_tags: false,
            max_completion_tokens: true,
            stream_usage: true,
        }
    }

    /// Capabilities for a base URL
    pub fn from_base_url(base_url: &Url) -> Self {
        let host = base_url.host_str().unwrap_or_default();

        match host {
            "api.openai.com" => Self::openai(),
            // NVIDIA NIM: tool calls come back as <TOOLCALL>[...]</TOOLCALL> text
            "integrate.api.nvidia.com" => Self {
                json_schema: true,
                text_tool_calls: true,
                ..Self::default()
            },
            // Reasoning arrives in a separate `reasoning_content` field
            "api.deepseek.com" => Self {
                reasoning_tags: false,
                stream_usage: true,
                ..Self::default()
            },
            _ if base_url.port() == Some(11434) => Self {
                json_schema: true,
                text_tool_calls: true,
                ..Self::default()
            },
            _ => Self::default(),
        }
    }
}
