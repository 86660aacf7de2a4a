//! Server-sent event decoding for streamed chat completions
//!
//! Frames come from `eventsource-stream`; each `data:` payload is one
//! `OpenAI` chunk, fanned out into [`StreamEvent`]s. `[DONE]` ends the stream.

use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;

use agentloop_core::provider::EventStream;
use agentloop_core::{AgentError, StreamEvent};
use eventsource_stream::{EventStreamError, Eventsource};
use futures::{Stream, StreamExt, stream};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::convert::chunk_events;
use crate::protocol::{WireChunk, WireErrorResponse};

const DONE_MARKER: &str = "[DONE]";

type Frames<E> = Pin<Box<dyn Stream<Item = Result<eventsource_stream::Event, EventStreamError<E>>> + Send>>;

struct DecodeState<E> {
    frames: Frames<E>,
    cancel: CancellationToken,
    pending: VecDeque<StreamEvent>,
}

/// Decode an SSE byte stream into stream events.
///
/// Cancellation is checked before every read; a cancelled token yields one
/// `Cancelled` error and drops the source. A frame that fails to decode
/// yields an error and ends the stream.
pub fn decode_sse<S, B, E>(source: S, cancel: CancellationToken) -> EventStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = DecodeState {
        frames: Box::pin(source.eventsource()),
        cancel,
        pending: VecDeque::new(),
    };

    Box::pin(stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), Some(state)));
            }

            let frame = tokio::select! {
                biased;
                () = state.cancel.cancelled() => return Some((Err(AgentError::Cancelled), None)),
                frame = state.frames.next() => frame,
            };

            let event = match frame {
                None => return None,
                Some(Ok(event)) => event,
                Some(Err(EventStreamError::Transport(e))) => {
                    return Some((Err(AgentError::transport(format!("stream read failed: {e}"))), None));
                }
                Some(Err(e)) => {
                    return Some((Err(AgentError::MalformedResponse(format!("invalid SSE framing: {e}"))), None));
                }
            };

            let data = event.data.trim();
            if data == DONE_MARKER {
                tracing::trace!("stream finished");
                return None;
            }
            if data.is_empty() {
                continue;
            }

            match decode_frame(data) {
                Ok(events) => state.pending.extend(events),
                Err(err) => return Some((Err(err), None)),
            }
        }
    }))
}

fn decode_frame(data: &str) -> agentloop_core::Result<Vec<StreamEvent>> {
    let value: Value = serde_json::from_str(data)
        .map_err(|e| AgentError::MalformedResponse(format!("invalid stream chunk: {e}")))?;

    if value.get("error").is_some() {
        let message = serde_json::from_value::<WireErrorResponse>(value)
            .map_or_else(|_| "provider reported a stream error".to_owned(), |body| body.error.message);
        return Err(AgentError::Transport {
            status: None,
            message,
            retryable: false,
        });
    }

    let chunk: WireChunk = serde_json::from_value(value)
        .map_err(|e| AgentError::MalformedResponse(format!("invalid stream chunk: {e}")))?;
    Ok(chunk_events(chunk))
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::time::Duration;

    use agentloop_core::FinishReason;
    use agentloop_core::stream::collect;

    use super::*;

    fn frames(chunks: &[&str]) -> impl Stream<Item = Result<Vec<u8>, Infallible>> + Send + 'static {
        let owned: Vec<Result<Vec<u8>, Infallible>> = chunks.iter().map(|c| Ok(c.as_bytes().to_vec())).collect();
        stream::iter(owned)
    }

    fn content_frame(text: &str) -> String {
        format!("data: {{\"choices\":[{{\"index\":0,\"delta\":{{\"content\":\"{text}\"}}}}]}}\n\n")
    }

    #[tokio::test]
    async fn test_hello_world_reconstruction() {
        let hello = content_frame("Hello");
        let world = content_frame(" world!");
        let done = "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n";
        // Frame boundaries deliberately split across reads
        let (head, tail) = world.split_at(10);
        let source = frames(&[&hello, head, tail, done, "data: [DONE]\n\n"]);

        let response = collect(decode_sse(source, CancellationToken::new())).await.unwrap();
        assert_eq!(response.content, "Hello world!");
        assert_eq!(response.finish_reason, FinishReason::Stop);
    }

    #[tokio::test]
    async fn test_tool_call_fragments_accumulate() {
        let first = r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"calc","arguments":"{\"a\":"}}]}}]}"#;
        let second = r#"data: {"choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"2}"}}]}}]}"#;
        let usage = r#"data: {"choices":[],"usage":{"prompt_tokens":4,"completion_tokens":6,"total_tokens":10}}"#;
        let body = format!("{first}\n\n{second}\n\n{usage}\n\ndata: [DONE]\n\n");

        let response = collect(decode_sse(frames(&[&body]), CancellationToken::new()))
            .await
            .unwrap();
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].id, "call_1");
        assert_eq!(response.tool_calls[0].arguments(), r#"{"a":2}"#);
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert_eq!(response.usage.map(|u| u.total_tokens), Some(10));
    }

    #[tokio::test]
    async fn test_bad_frame_surfaces_partial_content() {
        let hello = content_frame("Hello");
        let source = frames(&[&hello, "data: {not json\n\n", &content_frame("never")]);

        let err = collect(decode_sse(source, CancellationToken::new())).await.unwrap_err();
        assert!(matches!(err, AgentError::Stream { .. }));
        assert_eq!(err.partial_response().map(|p| p.content.as_str()), Some("Hello"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_promptly() {
        let cancel = CancellationToken::new();
        let hello = content_frame("Hello");
        let source = frames(&[&hello]).chain(stream::pending());
        let mut events = decode_sse(source, cancel.clone());

        assert_eq!(
            events.next().await.unwrap().unwrap(),
            StreamEvent::Content("Hello".into())
        );

        let waiter = tokio::spawn(async move { events.next().await.map(|r| r.unwrap_err().is_cancellation()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let cancelled = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(cancelled, Some(true));
    }

    #[tokio::test]
    async fn test_error_frame() {
        let source = frames(&["data: {\"error\":{\"message\":\"overloaded\",\"type\":\"server_error\"}}\n\n"]);
        let mut events = decode_sse(source, CancellationToken::new());

        let err = events.next().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("overloaded"));
        assert!(events.next().await.is_none());
    }
}
