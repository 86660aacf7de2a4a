//! Error Types
//!
//! One error enum for every fatal condition the agent stack can surface.
//! Each variant belongs to exactly one [`ErrorPhase`] so callers can tell a
//! transport hiccup from a parse failure or an exhausted iteration budget.

use std::time::Duration;

use thiserror::Error;

use crate::provider::ChatResponse;
use crate::schema::SchemaError;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// The stage of a call in which an error occurred
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorPhase {
    /// Building the provider request
    RequestEncoding,
    /// Talking to the provider
    Transport,
    /// Turning provider output into a response
    Decoding,
    /// Running a tool
    ToolExecution,
    /// Parsing structured output
    Parsing,
    /// Synthesizing a schema
    Schema,
    /// The agent loop itself (iteration budget, model-reported failures)
    Agent,
    /// Deadline or caller cancellation
    Cancellation,
    /// Invalid setup
    Configuration,
}

impl std::fmt::Display for ErrorPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::RequestEncoding => "request encoding",
            Self::Transport => "transport",
            Self::Decoding => "decoding",
            Self::ToolExecution => "tool execution",
            Self::Parsing => "parsing",
            Self::Schema => "schema generation",
            Self::Agent => "agent loop",
            Self::Cancellation => "cancellation",
            Self::Configuration => "configuration",
        };
        f.write_str(name)
    }
}

/// Agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// The request could not be expressed in the provider's wire format
    #[error("Request encoding error: {0}")]
    RequestEncoding(String),

    /// Connection failure or non-2xx status from the provider
    #[error("Transport error{}: {message}", .status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Transport {
        /// HTTP status, when the provider answered at all
        status: Option<u16>,
        message: String,
        /// Whether the retry middleware may try again
        retryable: bool,
    },

    /// Provider answered with something we cannot interpret
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// A stream broke off; what arrived before the failure is kept
    #[error("Stream aborted: {source}")]
    Stream {
        partial: Box<ChatResponse>,
        #[source]
        source: Box<AgentError>,
    },

    /// Tool not found in the catalog
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Tool execution failed and the agent is configured to stop on it
    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// Schema synthesis failed
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Structured output could not be parsed, even after repair
    #[error("Output parse error: {message}")]
    OutputParse { message: String, content: String },

    /// The model reported an error finish reason
    #[error("Model error: {0}")]
    Model(String),

    /// Maximum iterations reached in reasoning loop
    #[error("Iteration limit exceeded ({0} iterations)")]
    IterationLimit(usize),

    /// Deadline expired
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    /// Transport error that the retry middleware may retry
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            status: None,
            message: message.into(),
            retryable: true,
        }
    }

    /// Transport error for an HTTP status. 408, 429 and 5xx are retryable.
    pub fn http_status(status: u16, body: impl Into<String>) -> Self {
        Self::Transport {
            status: Some(status),
            message: body.into(),
            retryable: status == 408 || status == 429 || status >= 500,
        }
    }

    /// Which phase of the call failed; a broken stream reports its cause
    pub fn phase(&self) -> ErrorPhase {
        match self {
            Self::Stream { source, .. } => source.phase(),
            Self::RequestEncoding(_) => ErrorPhase::RequestEncoding,
            Self::Transport { .. } => ErrorPhase::Transport,
            Self::MalformedResponse(_) | Self::Json(_) => ErrorPhase::Decoding,
            Self::ToolNotFound(_) | Self::ToolExecution { .. } => ErrorPhase::ToolExecution,
            Self::Schema(_) => ErrorPhase::Schema,
            Self::OutputParse { .. } => ErrorPhase::Parsing,
            Self::Model(_) | Self::IterationLimit(_) => ErrorPhase::Agent,
            Self::Timeout(_) | Self::Cancelled => ErrorPhase::Cancellation,
            Self::Config(_) => ErrorPhase::Configuration,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Stream { source, .. } => source.is_retryable(),
            other => matches!(other, Self::Transport { retryable: true, .. }),
        }
    }

    /// Deadline expiry or caller cancellation
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Stream { source, .. } => source.is_cancellation(),
            other => matches!(other, Self::Timeout(_) | Self::Cancelled),
        }
    }

    /// Partial response carried by a broken stream
    pub fn partial_response(&self) -> Option<&ChatResponse> {
        match self {
            Self::Stream { partial, .. } => Some(partial.as_ref()),
            _ => None,
        }
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            Self::Transport { .. } => "The AI service is currently unavailable. Please try again.".into(),
            Self::Stream { source, .. } => source.user_message(),
            Self::MalformedResponse(_) => "The AI service returned a response that could not be read.".into(),
            Self::ToolNotFound(name) => format!("The tool '{name}' is not available."),
            Self::ToolExecution { tool, message } => format!("Tool '{tool}' failed: {message}"),
            Self::OutputParse { .. } => "The AI response did not match the expected format.".into(),
            Self::IterationLimit(_) => {
                "The request took too many steps to process. Please try a simpler query.".into()
            }
            Self::Timeout(_) => "The request timed out. Please try again.".into(),
            Self::Cancelled => "The request was cancelled.".into(),
            _ => format!("An unexpected error occurred during {}.", self.phase()),
        }
    }
}
