//! Conversion between agentloop core types and the `OpenAI` wire format

use agentloop_core::message::{FunctionCall, MediaSource};
use agentloop_core::provider::{ForcedToolChoice, ResponseFormat, ToolCallDelta, ToolChoice, ToolChoiceMode};
use agentloop_core::{
    AgentError, ChatRequest, ChatResponse, Content, ContentPart, FinishReason, MediaKind, MediaPart, Message,
    Result, Role, StreamEvent, ToolCall, ToolDescription, Usage,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};

use crate::capabilities::ProviderCapabilities;
use crate::fallback;
use crate::protocol::{
    WireChunk, WireContent, WireFile, WireFunction, WireFunctionCall, WireInputAudio, WireMessage, WirePart,
    WireRequest, WireResponse, WireStreamOptions, WireTool, WireToolCall, WireUrl, WireUsage,
};

/// MIME type assumed for generated audio
const GENERATED_AUDIO_MIME: &str = "audio/wav";

// -- Request encoding --

/// Encode a provider-agnostic request into the `OpenAI` wire format
pub fn encode_request(request: &ChatRequest, caps: &ProviderCapabilities, stream: bool) -> Result<WireRequest> {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.is_empty()) {
        messages.push(WireMessage {
            role: "system".to_owned(),
            content: Some(WireContent::Text(system.to_owned())),
            ..Default::default()
        });
    }
    for message in &request.messages {
        messages.push(encode_message(message, caps)?);
    }

    let mut wire = WireRequest {
        model: request.model.clone(),
        messages,
        ..Default::default()
    };

    if !request.tools.is_empty() {
        let functions: Vec<WireFunction> = request.tools.iter().map(encode_function).collect();
        if caps.tools {
            wire.tools = Some(
                functions
                    .into_iter()
                    .map(|function| WireTool {
                        tool_type: "function".to_owned(),
                        function,
                    })
                    .collect(),
            );
            wire.tool_choice = request.tool_choice.as_ref().and_then(|c| encode_tool_choice(c, caps));
        } else {
            wire.functions = Some(functions);
            wire.function_call = request.tool_choice.as_ref().and_then(encode_function_call_choice);
        }
    }

    wire.response_format = request.response_format.as_ref().map(|f| encode_response_format(f, caps));

    if let Some(generation) = &request.generation {
        wire.temperature = generation.temperature;
        wire.top_p = generation.top_p;
        wire.frequency_penalty = generation.frequency_penalty;
        wire.presence_penalty = generation.presence_penalty;
        if caps.max_completion_tokens {
            wire.max_completion_tokens = generation.max_tokens;
        } else {
            wire.max_tokens = generation.max_tokens;
        }
        wire.stop = (!generation.stop.is_empty()).then(|| generation.stop.clone());
        wire.seed = generation.seed;
    }

    if stream {
        wire.stream = Some(true);
        if caps.stream_usage {
            wire.stream_options = Some(WireStreamOptions { include_usage: true });
        }
    }

    Ok(wire)
}

fn encode_message(message: &Message, caps: &ProviderCapabilities) -> Result<WireMessage> {
    match message.role {
        Role::System => Ok(WireMessage {
            role: "system".to_owned(),
            content: Some(WireContent::Text(message.text())),
            ..Default::default()
        }),
        Role::User => Ok(WireMessage {
            role: "user".to_owned(),
            content: Some(encode_content(&message.content)?),
            ..Default::default()
        }),
        Role::Assistant => Ok(encode_assistant(message, caps)),
        Role::Tool => {
            let call_id = message.tool_call_id.clone().filter(|id| !id.is_empty());
            if caps.tools {
                Ok(WireMessage {
                    role: "tool".to_owned(),
                    content: Some(WireContent::Text(message.text())),
                    // Calls recovered from text have no ID; link them by name
                    name: if call_id.is_none() { message.name.clone() } else { None },
                    tool_call_id: call_id,
                    ..Default::default()
                })
            } else {
                Ok(WireMessage {
                    role: "function".to_owned(),
                    content: Some(WireContent::Text(message.text())),
                    name: message.name.clone(),
                    ..Default::default()
                })
            }
        }
    }
}

fn encode_assistant(message: &Message, caps: &ProviderCapabilities) -> WireMessage {
    let text = message.text();
    let content = if text.is_empty() && message.has_tool_calls() {
        None
    } else {
        Some(WireContent::Text(text))
    };

    let mut wire = WireMessage {
        role: "assistant".to_owned(),
        content,
        ..Default::default()
    };

    if caps.tools {
        if message.tool_calls.iter().all(|call| !call.id.is_empty()) && message.has_tool_calls() {
            wire.tool_calls = Some(message.tool_calls.iter().map(encode_tool_call).collect());
        }
    } else if let Some(call) = message.tool_calls.first() {
        wire.function_call = Some(WireFunctionCall {
            name: call.function.name.clone(),
            arguments: call.function.arguments.clone(),
        });
    }

    wire
}

fn encode_tool_call(call: &ToolCall) -> WireToolCall {
    WireToolCall {
        id: call.id.clone(),
        tool_type: call.call_type.clone(),
        function: WireFunctionCall {
            name: call.function.name.clone(),
            arguments: call.function.arguments.clone(),
        },
    }
}

fn encode_content(content: &Content) -> Result<WireContent> {
    match content {
        Content::Text(text) => Ok(WireContent::Text(text.clone())),
        Content::Parts(parts) => parts
            .iter()
            .map(encode_part)
            .collect::<Result<Vec<_>>>()
            .map(WireContent::Parts),
    }
}

fn encode_part(part: &ContentPart) -> Result<WirePart> {
    let media = match part {
        ContentPart::Text { text } => return Ok(WirePart::Text { text: text.clone() }),
        ContentPart::Media(media) => media,
    };

    match (media.kind, &media.source) {
        (MediaKind::Image, source) => Ok(WirePart::ImageUrl {
            image_url: WireUrl {
                url: media_url(media, source),
            },
        }),
        (MediaKind::Video, source) => Ok(WirePart::VideoUrl {
            video_url: WireUrl {
                url: media_url(media, source),
            },
        }),
        (MediaKind::Audio, MediaSource::Inline(data)) => Ok(WirePart::InputAudio {
            input_audio: WireInputAudio {
                data: STANDARD.encode(data),
                format: audio_format(media).to_owned(),
            },
        }),
        (MediaKind::Document, MediaSource::Inline(_)) => Ok(WirePart::File {
            file: WireFile {
                filename: None,
                file_data: media_url(media, &media.source),
            },
        }),
        (MediaKind::Audio | MediaKind::Document, MediaSource::Uri(uri)) => Err(AgentError::RequestEncoding(format!(
            "{} parts must carry inline data, got URI {uri}",
            if media.kind == MediaKind::Audio { "audio" } else { "document" },
        ))),
    }
}

/// Remote URI as-is, inline bytes as a base64 data URI
fn media_url(media: &MediaPart, source: &MediaSource) -> String {
    match source {
        MediaSource::Uri(uri) => uri.clone(),
        MediaSource::Inline(data) => format!("data:{};base64,{}", media.mime_type, STANDARD.encode(data)),
    }
}

fn audio_format(media: &MediaPart) -> &str {
    match media.mime_subtype() {
        None => "wav",
        Some("mpeg" | "mp3") => "mp3",
        Some("x-wav" | "wave" | "wav") => "wav",
        Some(other) => other,
    }
}

fn encode_function(tool: &ToolDescription) -> WireFunction {
    WireFunction {
        name: tool.name.clone(),
        description: (!tool.description.is_empty()).then(|| tool.description.clone()),
        parameters: Some(tool.parameters.to_value()),
    }
}

fn named_function(name: &str) -> Value {
    json!({"type": "function", "function": {"name": name}})
}

const fn mode_str(mode: ToolChoiceMode) -> &'static str {
    match mode {
        ToolChoiceMode::Auto => "auto",
        ToolChoiceMode::None => "none",
        ToolChoiceMode::Required => "required",
    }
}

/// `tool_choice` value, honouring forced > at-least-one > required tools
pub fn encode_tool_choice(choice: &ToolChoice, caps: &ProviderCapabilities) -> Option<Value> {
    if let Some(forced) = &choice.forced {
        return Some(match forced {
            ForcedToolChoice::Mode(mode) => Value::from(mode_str(*mode)),
            ForcedToolChoice::Tool(name) => named_function(name),
        });
    }
    if choice.at_least_one {
        return Some(Value::from("required"));
    }

    match choice.required_tools.as_slice() {
        [] => None,
        [only] => Some(named_function(only)),
        several if caps.allowed_tools => Some(json!({
            "type": "allowed_tools",
            "allowed_tools": {
                "mode": "required",
                "tools": several.iter().map(|name| named_function(name)).collect::<Vec<_>>(),
            },
        })),
        // No allow-list support: any tool will do
        _ => Some(Value::from("required")),
    }
}

/// Legacy `function_call` value; there is no "required" mode, so it degrades to `auto`
fn encode_function_call_choice(choice: &ToolChoice) -> Option<Value> {
    if let Some(forced) = &choice.forced {
        return Some(match forced {
            ForcedToolChoice::Mode(ToolChoiceMode::None) => Value::from("none"),
            ForcedToolChoice::Mode(_) => Value::from("auto"),
            ForcedToolChoice::Tool(name) => json!({"name": name}),
        });
    }
    match choice.required_tools.as_slice() {
        [only] if !choice.at_least_one => Some(json!({"name": only})),
        [] if !choice.at_least_one => None,
        _ => Some(Value::from("auto")),
    }
}

fn encode_response_format(format: &ResponseFormat, caps: &ProviderCapabilities) -> Value {
    match format {
        ResponseFormat::Type(hint) => json!({"type": hint}),
        ResponseFormat::Schema(output) if caps.json_schema => json!({
            "type": "json_schema",
            "json_schema": {
                "name": output.name,
                "schema": output.schema.to_value(),
                "strict": output.strict,
            },
        }),
        ResponseFormat::Schema(_) => json!({"type": "json_object"}),
    }
}

// -- Response decoding --

/// Decode a complete `OpenAI` response; `tools` are the tools the request declared
pub fn decode_response(
    wire: WireResponse,
    caps: &ProviderCapabilities,
    tools: &[ToolDescription],
) -> Result<ChatResponse> {
    let choice = wire
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| AgentError::MalformedResponse("response contained no choices".into()))?;
    let message = choice.message;

    let tool_calls = match (message.tool_calls, message.function_call) {
        (Some(calls), _) if !calls.is_empty() => calls.into_iter().map(decode_tool_call).collect(),
        (_, Some(call)) => vec![ToolCall::new(String::new(), call.name, call.arguments)],
        _ => Vec::new(),
    };

    let media = match message.audio {
        Some(audio) => {
            let data = STANDARD
                .decode(audio.data.as_bytes())
                .map_err(|e| AgentError::MalformedResponse(format!("invalid audio payload: {e}")))?;
            vec![MediaPart::inline(MediaKind::Audio, GENERATED_AUDIO_MIME, data)]
        }
        None => Vec::new(),
    };

    let response = ChatResponse {
        id: wire.id,
        model: wire.model,
        content: message.content.unwrap_or_default(),
        reasoning: message.reasoning_content.filter(|r| !r.is_empty()),
        refusal: message.refusal,
        tool_calls,
        finish_reason: parse_finish_reason(choice.finish_reason.as_deref()),
        usage: wire.usage.map(decode_usage),
        media,
    };

    Ok(postprocess(response, caps, tools))
}

fn decode_tool_call(call: WireToolCall) -> ToolCall {
    ToolCall {
        id: call.id,
        call_type: call.tool_type,
        function: FunctionCall {
            name: call.function.name,
            arguments: call.function.arguments,
        },
    }
}

/// Reasoning-tag split and text tool-call recovery, shared by the
/// non-streaming and collected-stream paths. Only calls to one of the
/// declared `tools` are recovered from text.
pub fn postprocess(mut response: ChatResponse, caps: &ProviderCapabilities, tools: &[ToolDescription]) -> ChatResponse {
    if caps.reasoning_tags && response.content.contains("think>") {
        let (content, reasoning) = fallback::split_reasoning(&response.content);
        response.content = content;
        response.reasoning = match (response.reasoning.take(), reasoning) {
            (Some(existing), Some(tagged)) => Some(format!("{existing}\n{tagged}")),
            (existing, tagged) => existing.or(tagged),
        };
    }

    if caps.text_tool_calls && response.tool_calls.is_empty() && !tools.is_empty() {
        let declared: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        if let Some((content, calls)) = fallback::recover_tool_calls(&response.content, &declared) {
            tracing::debug!(count = calls.len(), "recovered tool calls from content");
            response.content = content;
            response.tool_calls = calls;
        }
    }

    if response.has_tool_calls() {
        response.finish_reason = FinishReason::ToolCalls;
    }
    response
}

/// Map an `OpenAI` finish reason string; unknown values count as `stop`
pub fn parse_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        Some("tool_calls" | "function_call") => FinishReason::ToolCalls,
        Some("error") => FinishReason::Error,
        Some("cancelled" | "canceled") => FinishReason::Cancelled,
        _ => FinishReason::Stop,
    }
}

pub fn decode_usage(usage: WireUsage) -> Usage {
    Usage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        reasoning_tokens: usage.completion_tokens_details.and_then(|d| d.reasoning_tokens),
        cached_tokens: usage.prompt_tokens_details.and_then(|d| d.cached_tokens),
    }
}

// -- Streaming --

/// Fan one streaming chunk out into stream events
pub fn chunk_events(chunk: WireChunk) -> Vec<StreamEvent> {
    let mut events = Vec::new();

    for choice in chunk.choices {
        let delta = choice.delta;
        if let Some(reasoning) = delta.reasoning_content.filter(|r| !r.is_empty()) {
            events.push(StreamEvent::Reasoning(reasoning));
        }
        if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
            events.push(StreamEvent::Content(content));
        }
        for call in delta.tool_calls.unwrap_or_default() {
            let function = call.function.unwrap_or_default();
            events.push(StreamEvent::ToolCallDelta(ToolCallDelta {
                index: call.index,
                id: call.id.filter(|id| !id.is_empty()),
                name: function.name.filter(|n| !n.is_empty()),
                arguments: function.arguments.unwrap_or_default(),
            }));
        }
        if let Some(function) = delta.function_call {
            events.push(StreamEvent::ToolCallDelta(ToolCallDelta {
                index: 0,
                id: None,
                name: function.name.filter(|n| !n.is_empty()),
                arguments: function.arguments.unwrap_or_default(),
            }));
        }
        if let Some(reason) = choice.finish_reason {
            events.push(StreamEvent::Done(parse_finish_reason(Some(&reason))));
        }
    }

    if let Some(usage) = chunk.usage {
        events.push(StreamEvent::Usage(decode_usage(usage)));
    }

    events
}
