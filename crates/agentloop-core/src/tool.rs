//! Tool System
//!
//! Extensible tool framework for agent capabilities.
//! Tools are registered at runtime and invoked by the reasoning loop.
//! Execution never fails outward: every outcome, including an unknown tool,
//! becomes a [`ToolResult`] that can be fed back to the model.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::CallContext;
use crate::error::{AgentError, Result};
use crate::schema::{Describe, Schema, SchemaError, schema_for};

/// Tool definition (for LLM function calling)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescription {
    /// Unique tool identifier
    pub name: String,

    /// Human-readable description (shown to LLM)
    pub description: String,

    /// Parameter schema, always an object
    pub parameters: Schema,

    /// Ask the automatic tool-choice policy to require this tool
    #[serde(default)]
    pub required: bool,
}

impl ToolDescription {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Schema) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            required: false,
        }
    }

    #[must_use]
    pub const fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }
}

/// Short machine token describing a failed tool call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    ToolNotFound,
    ToolExecutionFailed,
    InvalidArguments,
}

impl std::fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ToolNotFound => write!(f, "tool_not_found"),
            Self::ToolExecutionFailed => write!(f, "tool_execution_failed"),
            Self::InvalidArguments => write!(f, "invalid_arguments"),
        }
    }
}

/// Result from tool execution
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireToolResult", try_from = "WireToolResult")]
pub enum ToolResult {
    /// Raw output of the tool
    Success(Value),
    Failure { kind: ToolErrorKind, message: String },
}

impl ToolResult {
    pub fn success(payload: impl Into<Value>) -> Self {
        Self::Success(payload.into())
    }

    pub fn failure(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
        }
    }

    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// JSON text sent back to the model as the tool message content
    pub fn to_content(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"success":false,"error":{{"kind":"tool_execution_failed","message":"{e}"}}}}"#)
        })
    }
}

#[derive(Serialize, Deserialize)]
struct WireToolError {
    kind: ToolErrorKind,
    message: String,
}

#[derive(Serialize, Deserialize)]
struct WireToolResult {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<WireToolError>,
}

impl From<ToolResult> for WireToolResult {
    fn from(result: ToolResult) -> Self {
        match result {
            ToolResult::Success(payload) => Self {
                success: true,
                result: Some(payload),
                error: None,
            },
            ToolResult::Failure { kind, message } => Self {
                success: false,
                result: None,
                error: Some(WireToolError { kind, message }),
            },
        }
    }
}

impl TryFrom<WireToolResult> for ToolResult {
    type Error = String;

    fn try_from(wire: WireToolResult) -> std::result::Result<Self, Self::Error> {
        if wire.success {
            return Ok(Self::Success(wire.result.unwrap_or(Value::Null)));
        }
        wire.error
            .map(|e| Self::Failure {
                kind: e.kind,
                message: e.message,
            })
            .ok_or_else(|| "failed tool result without error".to_owned())
    }
}

/// Tool trait - implement to add new capabilities
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name, description and parameter schema for LLM function calling
    fn description(&self) -> ToolDescription;

    /// Run the tool with JSON-encoded arguments
    async fn call(&self, ctx: &CallContext, arguments: &str) -> anyhow::Result<Value>;
}

/// Tool backed by an async function taking a typed argument struct
pub struct FunctionTool<A, F> {
    name: String,
    description: String,
    required: bool,
    parameters: Arc<Schema>,
    func: F,
    _args: PhantomData<fn(A)>,
}

impl<A, F, Fut> FunctionTool<A, F>
where
    A: Describe + DeserializeOwned + Send,
    F: Fn(A) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    /// Parameter schema is synthesized from `A`
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        func: F,
    ) -> std::result::Result<Self, SchemaError> {
        Ok(Self {
            name: name.into(),
            description: description.into(),
            required: false,
            parameters: schema_for::<A>()?,
            func,
            _args: PhantomData,
        })
    }

    #[must_use]
    pub const fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }
}

#[async_trait]
impl<A, F, Fut> Tool for FunctionTool<A, F>
where
    A: Describe + DeserializeOwned + Send,
    F: Fn(A) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    fn description(&self) -> ToolDescription {
        ToolDescription {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: (*self.parameters).clone(),
            required: self.required,
        }
    }

    /// The function's future is dropped as soon as `ctx` is cancelled
    async fn call(&self, ctx: &CallContext, arguments: &str) -> anyhow::Result<Value> {
        let args: A = serde_json::from_str(arguments)?;
        tokio::select! {
            biased;
            () = ctx.cancelled() => Err(AgentError::Cancelled.into()),
            result = (self.func)(args) => result,
        }
    }
}

/// Catalog of available tools, keyed case-insensitively by name
#[derive(Default)]
pub struct ToolCatalog {
    tools: DashMap<String, Arc<dyn Tool>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new tool
    pub fn register<T: Tool + 'static>(&self, tool: T) -> Result<()> {
        self.register_arc(Arc::new(tool))
    }

    /// Register a shared tool. Names are unique regardless of case.
    pub fn register_arc(&self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.description().name;
        match self.tools.entry(name.to_lowercase()) {
            Entry::Occupied(_) => Err(AgentError::Config(format!("tool '{name}' is already registered"))),
            Entry::Vacant(slot) => {
                tracing::debug!(tool = %name, "registered tool");
                slot.insert(tool);
                Ok(())
            }
        }
    }

    /// Get a tool by name, ignoring case
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(&name.to_lowercase()).map(|t| Arc::clone(t.value()))
    }

    /// Descriptions of all tools, sorted by name
    pub fn descriptions(&self) -> Vec<ToolDescription> {
        let mut descriptions: Vec<_> = self.tools.iter().map(|t| t.value().description()).collect();
        descriptions.sort_by(|a, b| a.name.cmp(&b.name));
        descriptions
    }

    /// Get tool names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tools.iter().map(|t| t.value().description().name).collect();
        names.sort();
        names
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute a tool call; failures come back as [`ToolResult::Failure`]
    pub async fn execute(&self, ctx: &CallContext, name: &str, arguments: &str) -> ToolResult {
        let Some(tool) = self.get(name) else {
            tracing::warn!(tool = %name, "tool not found");
            return ToolResult::failure(ToolErrorKind::ToolNotFound, format!("tool '{name}' is not registered"));
        };

        let arguments = if arguments.trim().is_empty() { "{}" } else { arguments };
        match serde_json::from_str::<Value>(arguments) {
            Ok(Value::Object(_)) => {}
            Ok(other) => {
                return ToolResult::failure(
                    ToolErrorKind::InvalidArguments,
                    format!("arguments must be a JSON object, got {other}"),
                );
            }
            Err(e) => {
                return ToolResult::failure(ToolErrorKind::InvalidArguments, format!("arguments are not valid JSON: {e}"));
            }
        }

        match tool.call(ctx, arguments).await {
            Ok(output) => ToolResult::Success(output),
            Err(e) => {
                tracing::debug!(tool = %name, error = %e, "tool execution failed");
                ToolResult::failure(ToolErrorKind::ToolExecutionFailed, format!("{e:#}"))
            }
        }
    }
}
