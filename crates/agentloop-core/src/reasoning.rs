//! Reasoning Loop
//!
//! Implements the ReAct (Reason + Act) pattern for agent behavior.
//! The agent asks the model, runs the tools it requests, feeds the results
//! back and repeats until the model answers without tool calls.
//!
//! ```text
//! AwaitingModel ──tool calls──▶ ExecutingTools
//!      ▲                              │
//!      └──────────────────────────────┘
//!      │
//!      ├──final answer──▶ Done
//!      └──error / limit─▶ Failed
//! ```

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::context::CallContext;
use crate::error::{AgentError, Result};
use crate::memory::Conversation;
use crate::message::{Content, Message, ToolCall};
use crate::middleware::{Middleware, SendFn, chain};
use crate::provider::{
    ChatRequest, ChatResponse, FinishReason, GenerationConfig, LlmProvider, OutputSchema, ResponseFormat,
    ToolChoice, Usage,
};
use crate::schema::{Describe, Schema, schema_for};
use crate::tool::{Tool, ToolCatalog, ToolErrorKind, ToolResult};

/// Result of a completed agent run
#[derive(Clone, Debug)]
pub struct AgentOutcome {
    /// The model's final answer
    pub response: ChatResponse,

    /// Completed tool cycles
    pub iterations: usize,

    /// Token usage summed over every model call of the run
    pub usage: Usage,
}

/// Result of a structured run
#[derive(Clone, Debug)]
pub struct TypedOutcome<T> {
    pub output: T,
    pub outcome: AgentOutcome,
}

enum AgentState {
    AwaitingModel,
    ExecutingTools(Vec<ToolCall>),
    Done(ChatResponse),
    Failed(AgentError),
}

impl AgentState {
    const fn name(&self) -> &'static str {
        match self {
            Self::AwaitingModel => "awaiting_model",
            Self::ExecutingTools(_) => "executing_tools",
            Self::Done(_) => "done",
            Self::Failed(_) => "failed",
        }
    }
}

/// The main Agent struct
pub struct Agent {
    send: SendFn,
    provider_name: String,
    tools: Arc<ToolCatalog>,
    config: AgentConfig,
    tool_choice: Option<ToolChoice>,
    /// Tool choice was derived from required-tool hints
    auto_tool_choice: bool,
    response_format: Option<ResponseFormat>,
}

impl Agent {
    /// Start building an agent
    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    /// Append `prompt` as a user turn and run the loop
    pub async fn run(
        &self,
        ctx: &CallContext,
        conversation: &mut Conversation,
        prompt: impl Into<Content>,
    ) -> Result<AgentOutcome> {
        conversation.append(Message::user(prompt));
        self.resume(ctx, conversation).await
    }

    /// Run the loop on the conversation as it stands, without a new user turn
    pub async fn resume(&self, ctx: &CallContext, conversation: &mut Conversation) -> Result<AgentOutcome> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "agent.run",
            run_id = %run_id,
            provider = %self.provider_name,
            model = %self.config.model,
        );
        self.drive(ctx, conversation).instrument(span).await
    }

    /// Run with a simple string input (creates temporary conversation)
    pub async fn ask(&self, question: &str) -> Result<String> {
        let mut conversation = Conversation::new();
        let outcome = self.run(&CallContext::new(), &mut conversation, question).await?;
        Ok(outcome.response.content)
    }

    async fn drive(&self, ctx: &CallContext, conversation: &mut Conversation) -> Result<AgentOutcome> {
        let template = self.request_template();
        let mut usage = Usage::default();
        let mut iterations = 0;
        let mut state = AgentState::AwaitingModel;

        loop {
            tracing::debug!(state = state.name(), iterations, "agent step");
            state = match state {
                AgentState::AwaitingModel => {
                    if iterations >= self.config.max_iterations {
                        AgentState::Failed(AgentError::IterationLimit(self.config.max_iterations))
                    } else {
                        let mut request = conversation.continue_request(&template);
                        if iterations > 0 && self.auto_tool_choice {
                            // Required tools only bind the first model turn
                            request.tool_choice = None;
                        }
                        match self.call_model(ctx, request, &mut usage).await {
                            Ok(response) => self.observe(response, conversation),
                            Err(e) => AgentState::Failed(e),
                        }
                    }
                }
                AgentState::ExecutingTools(calls) => match self.execute_tools(ctx, calls, conversation).await {
                    Ok(()) => {
                        iterations += 1;
                        AgentState::AwaitingModel
                    }
                    Err(e) => AgentState::Failed(e),
                },
                AgentState::Done(response) => {
                    tracing::info!(iterations, total_tokens = usage.total_tokens, "agent finished");
                    return Ok(AgentOutcome {
                        response,
                        iterations,
                        usage,
                    });
                }
                AgentState::Failed(e) => {
                    tracing::warn!(iterations, phase = %e.phase(), error = %e, "agent failed");
                    return Err(e);
                }
            };
        }
    }

    async fn call_model(&self, ctx: &CallContext, request: ChatRequest, usage: &mut Usage) -> Result<ChatResponse> {
        ctx.check()?;
        let response = (self.send)(ctx.clone(), request).await?;
        if let Some(turn) = &response.usage {
            usage.add(turn);
        }
        Ok(response)
    }

    /// Decide the next state from a model response
    fn observe(&self, response: ChatResponse, conversation: &mut Conversation) -> AgentState {
        if response.has_tool_calls() {
            let calls = response.tool_calls.clone();
            conversation.append(response.to_message());
            return AgentState::ExecutingTools(calls);
        }

        match response.finish_reason {
            FinishReason::Error => AgentState::Failed(AgentError::Model(if response.content.is_empty() {
                "model finished with an error".into()
            } else {
                response.content
            })),
            FinishReason::Cancelled => AgentState::Failed(AgentError::Cancelled),
            FinishReason::Stop | FinishReason::Length | FinishReason::ContentFilter | FinishReason::ToolCalls => {
                conversation.append(response.to_message());
                AgentState::Done(response)
            }
        }
    }

    /// Run calls in order, appending one tool message per call
    async fn execute_tools(
        &self,
        ctx: &CallContext,
        calls: Vec<ToolCall>,
        conversation: &mut Conversation,
    ) -> Result<()> {
        for call in calls {
            ctx.check()?;
            tracing::debug!(tool = %call.name(), call_id = %call.id, "executing tool");
            let result = self.tools.execute(ctx, call.name(), call.arguments()).await;
            conversation.append(Message::tool(&call, result.to_content()));

            if let ToolResult::Failure { kind, message } = result {
                tracing::debug!(tool = %call.name(), %kind, %message, "tool call failed");
                if self.config.stop_on_tool_error {
                    return Err(match kind {
                        ToolErrorKind::ToolNotFound => AgentError::ToolNotFound(call.function.name),
                        ToolErrorKind::ToolExecutionFailed | ToolErrorKind::InvalidArguments => {
                            AgentError::ToolExecution {
                                tool: call.function.name,
                                message,
                            }
                        }
                    });
                }
            }
        }
        Ok(())
    }

    fn request_template(&self) -> ChatRequest {
        ChatRequest {
            model: self.config.model.clone(),
            system_prompt: self.config.system_prompt.clone(),
            messages: Vec::new(),
            tools: self.tools.descriptions(),
            tool_choice: self.tool_choice.clone(),
            response_format: self.response_format.clone(),
            generation: (self.config.generation != GenerationConfig::default()).then(|| self.config.generation.clone()),
        }
    }

    /// Get the tool catalog
    pub fn tools(&self) -> &ToolCatalog {
        &self.tools
    }

    /// Get configuration
    pub const fn config(&self) -> &AgentConfig {
        &self.config
    }
}

/// Agent whose final answer is parsed into `T`
pub struct TypedAgent<T> {
    agent: Agent,
    schema: Arc<Schema>,
    _output: PhantomData<fn() -> T>,
}

impl<T: Describe + DeserializeOwned> TypedAgent<T> {
    /// Run the loop, then parse the final answer. A malformed answer gets
    /// exactly one repair turn.
    pub async fn run(
        &self,
        ctx: &CallContext,
        conversation: &mut Conversation,
        prompt: impl Into<Content>,
    ) -> Result<TypedOutcome<T>> {
        let mut outcome = self.agent.run(ctx, conversation, prompt).await?;

        let parse_error = match parse_output::<T>(&outcome.response.content) {
            Ok(output) => return Ok(TypedOutcome { output, outcome }),
            Err(e) => e,
        };
        tracing::debug!(error = %parse_error, "structured output did not parse, requesting repair");

        conversation.append(Message::user(self.repair_prompt(&parse_error)));
        let request = ChatRequest {
            tools: Vec::new(),
            tool_choice: None,
            ..conversation.continue_request(&self.agent.request_template())
        };
        let repaired = self.agent.call_model(ctx, request, &mut outcome.usage).await?;
        conversation.append(repaired.to_message());

        match parse_output::<T>(&repaired.content) {
            Ok(output) => {
                outcome.response = repaired;
                Ok(TypedOutcome { output, outcome })
            }
            Err(e) => Err(AgentError::OutputParse {
                message: e.to_string(),
                content: repaired.content,
            }),
        }
    }

    /// Run with a simple string input (creates temporary conversation)
    pub async fn ask(&self, question: &str) -> Result<T> {
        let mut conversation = Conversation::new();
        Ok(self.run(&CallContext::new(), &mut conversation, question).await?.output)
    }

    /// Schema the answer must conform to
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The underlying untyped agent
    pub const fn agent(&self) -> &Agent {
        &self.agent
    }

    fn repair_prompt(&self, error: &serde_json::Error) -> String {
        format!(
            "Your previous answer could not be parsed ({error}). Reply again with only a JSON value \
             that conforms to this JSON Schema, without any other text:\n{}",
            schema_text(&self.schema)
        )
    }
}

/// Parse a model answer as JSON, tolerating a surrounding Markdown fence
fn parse_output<T: DeserializeOwned>(content: &str) -> std::result::Result<T, serde_json::Error> {
    serde_json::from_str(strip_code_fence(content))
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (```json)
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn schema_text(schema: &Schema) -> String {
    serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_value().to_string())
}

/// Builder for Agent configuration
pub struct AgentBuilder {
    provider: Option<Arc<dyn LlmProvider>>,
    middleware: Vec<Arc<dyn Middleware>>,
    catalog: Option<Arc<ToolCatalog>>,
    tools: Vec<Arc<dyn Tool>>,
    tool_choice: Option<ToolChoice>,
    config: AgentConfig,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            provider: None,
            middleware: Vec::new(),
            catalog: None,
            tools: Vec::new(),
            tool_choice: None,
            config: AgentConfig::default(),
        }
    }

    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Add a middleware; the first one added is the outermost
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn tool<T: Tool + 'static>(mut self, tool: T) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    /// Use a shared catalog; tools added with [`Self::tool`] are registered
    /// into it on build
    pub fn tools(mut self, catalog: Arc<ToolCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Override the automatic tool choice
    pub fn tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = Some(choice);
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub const fn temperature(mut self, temp: f32) -> Self {
        self.config.generation.temperature = Some(temp);
        self
    }

    pub const fn max_iterations(mut self, max: usize) -> Self {
        self.config.max_iterations = max;
        self
    }

    pub const fn stop_on_tool_error(mut self, stop: bool) -> Self {
        self.config.stop_on_tool_error = stop;
        self
    }

    pub fn build(self) -> Result<Agent> {
        let provider = self
            .provider
            .ok_or_else(|| AgentError::Config("Provider is required".into()))?;
        if self.config.max_iterations == 0 {
            return Err(AgentError::Config("max_iterations must be at least 1".into()));
        }

        let catalog = self.catalog.unwrap_or_default();
        for tool in self.tools {
            catalog.register_arc(tool)?;
        }

        let auto_tool_choice = self.tool_choice.is_none();
        let tool_choice = self.tool_choice.or_else(|| {
            let required: Vec<_> = catalog
                .descriptions()
                .into_iter()
                .filter(|d| d.required)
                .map(|d| d.name)
                .collect();
            (!required.is_empty()).then(|| ToolChoice::required(required))
        });

        Ok(Agent {
            provider_name: provider.name().to_owned(),
            send: chain(provider, &self.middleware),
            tools: catalog,
            config: self.config,
            auto_tool_choice: auto_tool_choice && tool_choice.is_some(),
            tool_choice,
            response_format: None,
        })
    }

    /// Build an agent whose answers are parsed into `T`. The schema of `T`
    /// is appended to the system prompt and sent as the response format.
    pub fn build_typed<T: Describe + DeserializeOwned>(mut self) -> Result<TypedAgent<T>> {
        let schema = schema_for::<T>()?;

        let instruction = format!(
            "Respond with a JSON value that conforms to this JSON Schema:\n{}",
            schema_text(&schema)
        );
        self.config.system_prompt = Some(match self.config.system_prompt.take() {
            Some(prompt) if !prompt.is_empty() => format!("{prompt}\n\n{instruction}"),
            _ => instruction,
        });

        let name = output_name::<T>();
        let mut agent = self.build()?;
        agent.response_format = Some(ResponseFormat::Schema(OutputSchema {
            name,
            schema: Arc::clone(&schema),
            strict: true,
        }));

        Ok(TypedAgent {
            agent,
            schema,
            _output: PhantomData,
        })
    }
}

/// Response format name: the declared struct name, else `output`
fn output_name<T: Describe>() -> String {
    match T::shape() {
        crate::schema::TypeShape::Struct(shape) if !shape.name.is_empty() => shape.name,
        _ => "output".into(),
    }
}
