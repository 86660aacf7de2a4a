//! # agentloop-core
//!
//! Provider-agnostic LLM agent core: request/response model, schema
//! synthesis, tool execution, conversation memory, resilience middleware
//! and the ReAct agent loop.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Agent                               │
//! │  ┌─────────────┐  ┌─────────────┐  ┌──────────────────────┐  │
//! │  │  Reasoning  │  │    Tool     │  │  Middleware chain    │  │
//! │  │    Loop     │──│   Catalog   │  │  Timeout → Retry →   │  │
//! │  │             │──┼─────────────┼──│  Logging → Provider  │  │
//! │  └─────────────┘  └─────────────┘  └──────────────────────┘  │
//! │         │                                                    │
//! │  ┌─────────────┐  ┌─────────────┐                            │
//! │  │Conversation │  │   Schema    │                            │
//! │  │   Memory    │  │ Synthesizer │                            │
//! │  └─────────────┘  └─────────────┘                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `LlmProvider` trait enables swapping between OpenAI-compatible
//! endpoints, local servers, or any other backend without changing agent
//! logic. Wire dialects live in `agentloop-runtime`.

pub mod config;
pub mod context;
pub mod error;
pub mod memory;
pub mod message;
pub mod middleware;
pub mod provider;
pub mod reasoning;
pub mod schema;
pub mod stream;
pub mod tool;

pub use config::{AgentConfig, RetryConfig, TimeoutConfig};
pub use context::CallContext;
pub use error::{AgentError, ErrorPhase, Result};
pub use memory::{Conversation, LinkageViolation};
pub use message::{Content, ContentPart, MediaKind, MediaPart, Message, Role, ToolCall};
pub use middleware::{LoggingMiddleware, Middleware, RetryMiddleware, SendFn, TimeoutMiddleware};
pub use provider::{ChatRequest, ChatResponse, FinishReason, LlmProvider, StreamEvent, Usage};
pub use reasoning::{Agent, AgentBuilder, AgentOutcome, TypedAgent, TypedOutcome};
pub use schema::{Describe, Schema, SchemaError, schema_for};
pub use tool::{FunctionTool, Tool, ToolCatalog, ToolDescription, ToolErrorKind, ToolResult};
