use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use agentloop_core::provider::{EventStream, ResponseFormat};
use agentloop_core::schema::{FieldShape, StructShape, TypeShape};
use agentloop_core::{
    Agent, AgentError, CallContext, ChatRequest, ChatResponse, Conversation, Describe, FinishReason, FunctionTool,
    LlmProvider, Role, ToolCall, Usage,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

/// Replays canned responses and records every request
struct ScriptedProvider {
    script: Mutex<VecDeque<ChatResponse>>,
    /// Answer once the script runs out
    fallback: Option<ChatResponse>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    fn new(script: Vec<ChatResponse>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn repeating(response: ChatResponse) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(response),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn request(&self, index: usize) -> ChatRequest {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(&self, _ctx: &CallContext, request: &ChatRequest) -> agentloop_core::Result<ChatResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self.script.lock().unwrap().pop_front();
        next.or_else(|| self.fallback.clone())
            .ok_or_else(|| AgentError::MalformedResponse("script exhausted".into()))
    }

    async fn start_stream(&self, _ctx: &CallContext, _request: &ChatRequest) -> agentloop_core::Result<EventStream> {
        Err(AgentError::Config("streaming not scripted".into()))
    }
}

fn text(content: &str) -> ChatResponse {
    ChatResponse {
        content: content.into(),
        finish_reason: FinishReason::Stop,
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn calls(tool_calls: Vec<ToolCall>) -> ChatResponse {
    ChatResponse {
        tool_calls,
        finish_reason: FinishReason::ToolCalls,
        usage: Some(Usage {
            prompt_tokens: 8,
            completion_tokens: 4,
            total_tokens: 12,
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[derive(Deserialize)]
struct WeatherArgs {
    city: String,
}

impl Describe for WeatherArgs {
    fn shape() -> TypeShape {
        StructShape::new("WeatherArgs")
            .field(FieldShape::of::<String>("city").description("City name"))
            .into()
    }
}

fn weather_tool() -> impl agentloop_core::Tool {
    FunctionTool::new("get_weather", "Current weather for a city", |args: WeatherArgs| async move {
        Ok::<_, anyhow::Error>(json!({"city": args.city, "sky": "sunny"}))
    })
    .unwrap()
}

#[derive(Deserialize)]
struct NoArgs {}

impl Describe for NoArgs {
    fn shape() -> TypeShape {
        StructShape::new("NoArgs").into()
    }
}

fn broken_tool() -> impl agentloop_core::Tool {
    FunctionTool::new("broken", "Always fails", |_: NoArgs| async move {
        Err::<serde_json::Value, _>(anyhow::anyhow!("database offline"))
    })
    .unwrap()
}

fn agent_with(provider: Arc<ScriptedProvider>) -> agentloop_core::AgentBuilder {
    Agent::builder().provider(provider).model("test-model").tool(weather_tool())
}

#[tokio::test]
async fn test_single_tool_round_trip() {
    let provider = ScriptedProvider::new(vec![
        calls(vec![ToolCall::new("call_1", "get_weather", r#"{"city":"Oslo"}"#)]),
        text("It is sunny in Oslo."),
    ]);
    let agent = agent_with(provider.clone()).build().unwrap();

    let mut conversation = Conversation::new();
    let outcome = agent
        .run(&CallContext::new(), &mut conversation, "Weather in Oslo?")
        .await
        .unwrap();

    assert_eq!(outcome.response.content, "It is sunny in Oslo.");
    assert_eq!(outcome.iterations, 1);
    assert_eq!(outcome.usage.total_tokens, 27);
    assert_eq!(provider.calls(), 2);

    let roles: Vec<Role> = conversation.messages().iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
    assert_eq!(conversation.check_tool_linkage(), Ok(()));

    let tool_message = &conversation.messages()[2];
    assert_eq!(tool_message.tool_call_id.as_deref(), Some("call_1"));
    let payload: serde_json::Value = serde_json::from_str(&tool_message.text()).unwrap();
    assert_eq!(payload, json!({"success": true, "result": {"city": "Oslo", "sky": "sunny"}}));

    let second = provider.request(1);
    assert_eq!(second.messages.len(), 3);
    assert_eq!(second.tools.len(), 1);
    assert_eq!(second.tools[0].name, "get_weather");
}

#[tokio::test]
async fn test_iteration_limit() {
    let provider = ScriptedProvider::repeating(calls(vec![ToolCall::new(
        "call_x",
        "get_weather",
        r#"{"city":"Bergen"}"#,
    )]));
    let agent = agent_with(provider.clone()).max_iterations(3).build().unwrap();

    let mut conversation = Conversation::new();
    let err = agent
        .run(&CallContext::new(), &mut conversation, "Loop forever")
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::IterationLimit(3)));
    assert_eq!(provider.calls(), 3);
    // user + 3 x (assistant, tool)
    assert_eq!(conversation.len(), 7);
}

#[tokio::test]
async fn test_tool_failure_fed_back_by_default() {
    let provider = ScriptedProvider::new(vec![
        calls(vec![ToolCall::new("call_1", "broken", "{}")]),
        text("The database is offline."),
    ]);
    let agent = agent_with(provider.clone()).tool(broken_tool()).build().unwrap();

    let mut conversation = Conversation::new();
    let outcome = agent
        .run(&CallContext::new(), &mut conversation, "Query it")
        .await
        .unwrap();

    assert_eq!(outcome.response.content, "The database is offline.");
    let payload: serde_json::Value = serde_json::from_str(&conversation.messages()[2].text()).unwrap();
    assert_eq!(payload["success"], false);
    assert_eq!(payload["error"]["kind"], "tool_execution_failed");
    assert_eq!(payload["error"]["message"], "database offline");
}

#[tokio::test]
async fn test_stop_on_tool_error() {
    let provider = ScriptedProvider::new(vec![
        calls(vec![ToolCall::new("call_1", "broken", "{}")]),
        text("unreachable"),
    ]);
    let agent = agent_with(provider.clone())
        .tool(broken_tool())
        .stop_on_tool_error(true)
        .build()
        .unwrap();

    let mut conversation = Conversation::new();
    let err = agent
        .run(&CallContext::new(), &mut conversation, "Query it")
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::ToolExecution { ref tool, .. } if tool == "broken"));
    assert_eq!(provider.calls(), 1);
    // The failed result is still recorded
    assert_eq!(conversation.last().map(|m| m.role), Some(Role::Tool));
}

#[tokio::test]
async fn test_unknown_tool_is_reported_to_model() {
    let provider = ScriptedProvider::new(vec![
        calls(vec![ToolCall::new("call_1", "teleport", "{}")]),
        text("I cannot teleport."),
    ]);
    let agent = agent_with(provider.clone()).build().unwrap();

    let mut conversation = Conversation::new();
    agent
        .run(&CallContext::new(), &mut conversation, "Beam me up")
        .await
        .unwrap();

    let payload: serde_json::Value = serde_json::from_str(&conversation.messages()[2].text()).unwrap();
    assert_eq!(payload["error"]["kind"], "tool_not_found");
}

#[tokio::test]
async fn test_error_finish_reason_fails_run() {
    let provider = ScriptedProvider::new(vec![ChatResponse {
        finish_reason: FinishReason::Error,
        ..Default::default()
    }]);
    let agent = agent_with(provider).build().unwrap();

    let mut conversation = Conversation::new();
    let err = agent
        .run(&CallContext::new(), &mut conversation, "Hi")
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Model(_)));
}

#[tokio::test]
async fn test_cancelled_before_first_call() {
    let provider = ScriptedProvider::new(vec![text("never sent")]);
    let agent = agent_with(provider.clone()).build().unwrap();

    let ctx = CallContext::new();
    ctx.cancel();
    let mut conversation = Conversation::new();
    let err = agent.run(&ctx, &mut conversation, "Hi").await.unwrap_err();

    assert!(err.is_cancellation());
    assert_eq!(provider.calls(), 0);
    assert_eq!(conversation.len(), 1);
}

#[derive(Debug, Deserialize, PartialEq)]
struct Forecast {
    city: String,
    celsius: f64,
}

impl Describe for Forecast {
    fn shape() -> TypeShape {
        StructShape::new("Forecast")
            .field(FieldShape::of::<String>("city"))
            .field(FieldShape::of::<f64>("celsius"))
            .into()
    }
}

#[tokio::test]
async fn test_typed_output_parses_first_answer() {
    let provider = ScriptedProvider::new(vec![text(r#"{"city": "Oslo", "celsius": 21.5}"#)]);
    let agent = agent_with(provider.clone())
        .system_prompt("You are a forecaster.")
        .build_typed::<Forecast>()
        .unwrap();

    let forecast = agent.ask("Forecast for Oslo").await.unwrap();
    assert_eq!(
        forecast,
        Forecast {
            city: "Oslo".into(),
            celsius: 21.5
        }
    );

    let request = provider.request(0);
    let system = request.system_prompt.unwrap();
    assert!(system.starts_with("You are a forecaster."));
    assert!(system.contains("\"celsius\""));
    match request.response_format {
        Some(ResponseFormat::Schema(format)) => {
            assert_eq!(format.name, "Forecast");
            assert!(format.strict);
        }
        other => panic!("unexpected response format: {other:?}"),
    }
}

#[tokio::test]
async fn test_typed_output_single_repair() {
    let provider = ScriptedProvider::new(vec![
        text("Oslo will be warm, about 21 degrees."),
        text("```json\n{\"city\": \"Oslo\", \"celsius\": 21.0}\n```"),
    ]);
    let agent = agent_with(provider.clone()).build_typed::<Forecast>().unwrap();

    let mut conversation = Conversation::new();
    let typed = agent
        .run(&CallContext::new(), &mut conversation, "Forecast for Oslo")
        .await
        .unwrap();

    assert_eq!(typed.output.celsius, 21.0);
    assert_eq!(typed.outcome.usage.total_tokens, 30);
    assert_eq!(provider.calls(), 2);

    let repair = provider.request(1);
    assert!(repair.tools.is_empty());
    assert!(repair.response_format.is_some());
    assert_eq!(repair.messages.last().map(|m| m.role), Some(Role::User));
    // user, answer, repair instruction, repaired answer
    assert_eq!(conversation.len(), 4);
}

#[tokio::test]
async fn test_typed_output_fails_after_one_repair() {
    let provider = ScriptedProvider::new(vec![text("no json here"), text("still no json"), text("{}")]);
    let agent = agent_with(provider.clone()).build_typed::<Forecast>().unwrap();

    let err = agent.ask("Forecast for Oslo").await.unwrap_err();
    match err {
        AgentError::OutputParse { content, .. } => assert_eq!(content, "still no json"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(provider.calls(), 2);
}
