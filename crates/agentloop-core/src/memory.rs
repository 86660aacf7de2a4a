//! Conversation Memory
//!
//! Append-only history of one conversation. Messages are never edited or
//! removed, so the sequence can be replayed as the messages of the next
//! request.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{Message, Role, ToolCall};
use crate::provider::ChatRequest;

/// Broken link between a tool message and the call it answers
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LinkageViolation {
    #[error("message {index}: tool result without a preceding assistant tool call")]
    NoPrecedingCall { index: usize },

    #[error("message {index}: tool result answers unknown call '{call_id}'")]
    UnknownCall { index: usize, call_id: String },

    #[error("message {index}: tool result named '{found}' answers call to '{expected}'")]
    NameMismatch {
        index: usize,
        expected: String,
        found: String,
    },

    #[error("message {index}: call '{call_id}' already has a result")]
    DuplicateResult { index: usize, call_id: String },
}

/// Conversation history
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message
    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Get all messages, oldest first
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Get the last message
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Request that continues the conversation without a new user turn.
    ///
    /// Everything but the messages is taken from `template`.
    pub fn continue_request(&self, template: &ChatRequest) -> ChatRequest {
        ChatRequest {
            messages: self.messages.clone(),
            ..template.clone()
        }
    }

    /// Verify every tool message answers exactly one call of the most
    /// recent assistant message with tool calls.
    ///
    /// Calls recovered from plain text carry no ID and are matched by name.
    pub fn check_tool_linkage(&self) -> Result<(), LinkageViolation> {
        let mut open: Option<&[ToolCall]> = None;
        let mut answered: HashSet<usize> = HashSet::new();

        for (index, message) in self.messages.iter().enumerate() {
            match message.role {
                Role::Assistant => {
                    open = message.has_tool_calls().then_some(message.tool_calls.as_slice());
                    answered.clear();
                }
                Role::Tool => {
                    let Some(calls) = open else {
                        return Err(LinkageViolation::NoPrecedingCall { index });
                    };
                    let position = find_call(index, message, calls, &answered)?;
                    if !answered.insert(position) {
                        return Err(LinkageViolation::DuplicateResult {
                            index,
                            call_id: display_id(&calls[position]),
                        });
                    }
                }
                Role::System | Role::User => {}
            }
        }
        Ok(())
    }
}

fn find_call(
    index: usize,
    message: &Message,
    calls: &[ToolCall],
    answered: &HashSet<usize>,
) -> Result<usize, LinkageViolation> {
    let call_id = message.tool_call_id.as_deref().unwrap_or_default();

    if call_id.is_empty() {
        let name = message.name.as_deref().unwrap_or_default();
        let mut candidates = calls
            .iter()
            .enumerate()
            .filter(|(_, c)| c.id.is_empty() && c.name() == name)
            .map(|(i, _)| i);
        let first = candidates.clone().next();
        return candidates
            .find(|i| !answered.contains(i))
            .or(first)
            .ok_or_else(|| LinkageViolation::UnknownCall {
                index,
                call_id: name.to_owned(),
            });
    }

    let position = calls
        .iter()
        .position(|c| c.id == call_id)
        .ok_or_else(|| LinkageViolation::UnknownCall {
            index,
            call_id: call_id.to_owned(),
        })?;

    if let Some(found) = message.name.as_deref() {
        let expected = calls[position].name();
        if found != expected {
            return Err(LinkageViolation::NameMismatch {
                index,
                expected: expected.to_owned(),
                found: found.to_owned(),
            });
        }
    }
    Ok(position)
}

fn display_id(call: &ToolCall) -> String {
    if call.id.is_empty() {
        call.name().to_owned()
    } else {
        call.id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_call(calls: Vec<ToolCall>) -> Conversation {
        let mut conv = Conversation::new();
        conv.append(Message::user("What's the weather in Oslo?"));
        conv.append(Message::assistant("").with_tool_calls(calls));
        conv
    }

    #[test]
    fn test_append_only_history() {
        let mut conv = Conversation::new();
        conv.append(Message::user("Hi"));
        conv.append(Message::assistant("Hello"));
        assert_eq!(conv.len(), 2);
        assert_eq!(conv.last().map(Message::text).as_deref(), Some("Hello"));
    }

    #[test]
    fn test_continue_request_replays_history() {
        let mut conv = Conversation::new();
        conv.append(Message::user("Hi"));
        let template = ChatRequest::new("gpt-4o-mini").with_system_prompt("Be brief");
        let request = conv.continue_request(&template);
        assert_eq!(request.model, "gpt-4o-mini");
        assert_eq!(request.system_prompt.as_deref(), Some("Be brief"));
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.messages[0].role, Role::User);
    }

    #[test]
    fn test_valid_linkage() {
        let call = ToolCall::new("call_1", "weather", r#"{"city":"Oslo"}"#);
        let mut conv = with_call(vec![call.clone()]);
        conv.append(Message::tool(&call, "sunny"));
        conv.append(Message::assistant("It is sunny."));
        assert_eq!(conv.check_tool_linkage(), Ok(()));
    }

    #[test]
    fn test_unknown_call_id() {
        let call = ToolCall::new("call_1", "weather", "{}");
        let mut conv = with_call(vec![call]);
        conv.append(Message::tool(&ToolCall::new("call_9", "weather", "{}"), "sunny"));
        assert_eq!(
            conv.check_tool_linkage(),
            Err(LinkageViolation::UnknownCall {
                index: 2,
                call_id: "call_9".into()
            })
        );
    }

    #[test]
    fn test_name_mismatch() {
        let call = ToolCall::new("call_1", "weather", "{}");
        let mut conv = with_call(vec![call]);
        conv.append(Message::tool(&ToolCall::new("call_1", "calendar", "{}"), "busy"));
        assert!(matches!(conv.check_tool_linkage(), Err(LinkageViolation::NameMismatch { .. })));
    }

    #[test]
    fn test_result_without_call() {
        let mut conv = Conversation::new();
        conv.append(Message::user("Hi"));
        conv.append(Message::tool(&ToolCall::new("call_1", "weather", "{}"), "sunny"));
        assert_eq!(conv.check_tool_linkage(), Err(LinkageViolation::NoPrecedingCall { index: 1 }));
    }

    #[test]
    fn test_duplicate_result() {
        let call = ToolCall::new("call_1", "weather", "{}");
        let mut conv = with_call(vec![call.clone()]);
        conv.append(Message::tool(&call, "sunny"));
        conv.append(Message::tool(&call, "rainy"));
        assert!(matches!(conv.check_tool_linkage(), Err(LinkageViolation::DuplicateResult { index: 3, .. })));
    }

    #[test]
    fn test_recovered_calls_link_by_name() {
        let first = ToolCall::new("", "Calculator", r#"{"expression":"2+2"}"#);
        let second = ToolCall::new("", "Calculator", r#"{"expression":"3*3"}"#);
        let mut conv = with_call(vec![first.clone(), second.clone()]);
        conv.append(Message::tool(&first, "4"));
        conv.append(Message::tool(&second, "9"));
        assert_eq!(conv.check_tool_linkage(), Ok(()));

        conv.append(Message::tool(&second, "9"));
        assert!(matches!(conv.check_tool_linkage(), Err(LinkageViolation::DuplicateResult { .. })));
    }

    #[test]
    fn test_names_compare_exactly() {
        let call = ToolCall::new("call_1", "weather", "{}");
        let mut conv = with_call(vec![call]);
        conv.append(Message::tool(&ToolCall::new("call_1", "Weather", "{}"), "sunny"));
        assert_eq!(
            conv.check_tool_linkage(),
            Err(LinkageViolation::NameMismatch {
                index: 2,
                expected: "weather".into(),
                found: "Weather".into(),
            })
        );

        let recovered = ToolCall::new("", "Calculator", "{}");
        let mut conv = with_call(vec![recovered]);
        conv.append(Message::tool(&ToolCall::new("", "calculator", "{}"), "4"));
        assert!(matches!(conv.check_tool_linkage(), Err(LinkageViolation::UnknownCall { index: 2, .. })));
    }
}
