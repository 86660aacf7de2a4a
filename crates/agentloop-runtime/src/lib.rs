//! # agentloop-runtime
//!
//! OpenAI-compatible wire dialect for the agentloop core.
//!
//! ## Components
//!
//! - **capabilities**: per-host feature flags derived from the base URL
//! - **convert**: request encoding and response decoding
//! - **fallback**: `<think>` reasoning split and text tool-call recovery
//! - **sse**: server-sent event decoding for streamed completions
//! - **openai**: the `reqwest` transport implementing `LlmProvider`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agentloop_runtime::{OpenAiConfig, OpenAiProvider};
//!
//! let config = OpenAiConfig::with_base_url("http://localhost:11434/v1".parse()?);
//! let provider = OpenAiProvider::new(config)?;
//! let agent = Agent::builder()
//!     .provider(Arc::new(provider))
//!     .model("llama3.2")
//!     .build()?;
//! ```

pub mod capabilities;
pub mod convert;
pub mod fallback;
pub mod openai;
pub mod protocol;
pub mod sse;

pub use capabilities::ProviderCapabilities;
pub use openai::{OpenAiConfig, OpenAiProvider};
pub use sse::decode_sse;

// Re-export core types for convenience
pub use agentloop_core::{Agent, AgentError, CallContext, ChatRequest, ChatResponse, LlmProvider, Result};
