//! Stream Accumulation
//!
//! Folds [`StreamEvent`]s back into a [`ChatResponse`]. Tool-call fragments
//! are merged by index; the first fragment of a call carries its ID and name,
//! later ones only extend the arguments.

use std::collections::BTreeMap;

use futures::StreamExt;

use crate::error::{AgentError, Result};
use crate::message::ToolCall;
use crate::provider::{ChatResponse, EventStream, FinishReason, StreamEvent, Usage};

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Incrementally rebuilt response
#[derive(Default)]
pub struct StreamAccumulator {
    content: String,
    reasoning: String,
    calls: BTreeMap<u32, PartialCall>,
    usage: Option<Usage>,
    finish_reason: Option<FinishReason>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Content(delta) => self.content.push_str(&delta),
            StreamEvent::Reasoning(delta) => self.reasoning.push_str(&delta),
            StreamEvent::ToolCallDelta(delta) => {
                let call = self.calls.entry(delta.index).or_default();
                if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
                    call.id = id;
                }
                if let Some(name) = delta.name.filter(|name| !name.is_empty()) {
                    call.name = name;
                }
                call.arguments.push_str(&delta.arguments);
            }
            StreamEvent::Usage(usage) => self.usage = Some(usage),
            // With several choices the first one decides
            StreamEvent::Done(reason) => {
                self.finish_reason.get_or_insert(reason);
            }
        }
    }

    /// Content accumulated so far
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Snapshot of what has arrived, without consuming the accumulator
    pub fn partial(&self) -> ChatResponse {
        self.build(self.finish_reason.unwrap_or_default())
    }

    /// Final response. A stream that ended without a finish reason counts
    /// as a normal stop.
    pub fn finish(self) -> ChatResponse {
        self.build(self.finish_reason.unwrap_or_default())
    }

    fn build(&self, finish_reason: FinishReason) -> ChatResponse {
        let tool_calls: Vec<ToolCall> = self
            .calls
            .values()
            .map(|c| {
                let arguments = if c.arguments.is_empty() { "{}" } else { c.arguments.as_str() };
                ToolCall::new(c.id.clone(), c.name.clone(), arguments)
            })
            .collect();

        let finish_reason = if tool_calls.is_empty() {
            finish_reason
        } else {
            FinishReason::ToolCalls
        };

        ChatResponse {
            content: self.content.clone(),
            reasoning: (!self.reasoning.is_empty()).then(|| self.reasoning.clone()),
            tool_calls,
            finish_reason,
            usage: self.usage,
            ..Default::default()
        }
    }
}

/// Drain a stream into a complete response.
///
/// A failing stream yields [`AgentError::Stream`] carrying everything that
/// arrived before the failure.
pub async fn collect(mut stream: EventStream) -> Result<ChatResponse> {
    let mut acc = StreamAccumulator::new();

    while let Some(event) = stream.next().await {
        match event {
            Ok(event) => acc.push(event),
            Err(e) => {
                tracing::debug!(error = %e, received = acc.content().len(), "stream aborted");
                return Err(AgentError::Stream {
                    partial: Box::new(acc.partial()),
                    source: Box::new(e),
                });
            }
        }
    }

    Ok(acc.finish())
}
