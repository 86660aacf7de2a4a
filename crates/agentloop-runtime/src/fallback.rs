//! Recovery of structure that some servers leave inside plain text
//!
//! Reasoning models served through OpenAI-compatible endpoints often wrap
//! their chain-of-thought in `<think>` tags, and several hosts (NVIDIA NIM,
//! Ollama) emit tool calls as a JSON array in the content instead of the
//! `tool_calls` field.

use agentloop_core::ToolCall;
use serde_json::Value;

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Delimiter pairs that wrap a JSON array of tool calls
const TOOL_CALL_TAGS: [(&str, &str); 2] = [("<TOOLCALL>", "</TOOLCALL>"), ("<tool_call>", "</tool_call>")];

/// Truncated call arrays are retried at most this many times
const MAX_TRUNCATION_CANDIDATES: usize = 3;

/// Split `<think>` reasoning out of the content.
///
/// Returns the remaining content and the reasoning, if any. A close tag
/// without an opening tag before it marks everything before it as
/// reasoning; an open tag that is never closed runs to the end.
pub fn split_reasoning(content: &str) -> (String, Option<String>) {
    let open = content.find(THINK_OPEN);
    let close = content.find(THINK_CLOSE);

    let (before, reasoning, after) = match (open, close) {
        (Some(start), Some(end)) if start < end => (
            &content[..start],
            &content[start + THINK_OPEN.len()..end],
            &content[end + THINK_CLOSE.len()..],
        ),
        (Some(_), Some(end)) => {
            // Orphan close first; whatever follows may hold its own block
            let (rest, later) = split_reasoning(&content[end + THINK_CLOSE.len()..]);
            let reasoning = join_reasoning(content[..end].trim(), later.as_deref().unwrap_or_default());
            return (rest, reasoning);
        }
        (None, Some(end)) => ("", &content[..end], &content[end + THINK_CLOSE.len()..]),
        (Some(start), None) => (&content[..start], &content[start + THINK_OPEN.len()..], ""),
        (None, None) => return (content.to_owned(), None),
    };

    let remaining = match (before.trim(), after.trim()) {
        ("", rest) | (rest, "") => rest.to_owned(),
        (head, tail) => format!("{head}\n{tail}"),
    };
    (remaining, join_reasoning(reasoning.trim(), ""))
}

fn join_reasoning(first: &str, second: &str) -> Option<String> {
    match (first, second) {
        ("", "") => None,
        ("", only) | (only, "") => Some(only.to_owned()),
        (first, second) => Some(format!("{first}\n{second}")),
    }
}

/// Recover tool calls encoded as JSON text.
///
/// Tried in order: a delimiter-wrapped array (or single call object), the
/// whole content as an array, the first `[` onwards. Every recovered call
/// must name one of the `declared` tools; with no declared tools nothing is
/// recovered. On success returns the content that preceded the calls and
/// the calls themselves, which carry no ID.
pub fn recover_tool_calls(content: &str, declared: &[&str]) -> Option<(String, Vec<ToolCall>)> {
    if declared.is_empty() {
        return None;
    }
    let known = |calls: Vec<ToolCall>| calls.iter().all(|c| declared.contains(&c.name())).then_some(calls);

    for (open, close) in TOOL_CALL_TAGS {
        if let Some(start) = content.find(open) {
            let body = &content[start + open.len()..];
            let body = body.find(close).map_or(body, |end| &body[..end]);
            if let Some(calls) = parse_calls(body, true).and_then(known) {
                return Some((content[..start].trim().to_owned(), calls));
            }
        }
    }

    if let Some(calls) = parse_calls(content, false).and_then(known) {
        return Some((String::new(), calls));
    }

    let start = content.find('[')?;
    parse_calls(&content[start..], false)
        .and_then(known)
        .map(|calls| (content[..start].trim().to_owned(), calls))
}

/// Parse a call array, tolerating trailing junk. A single call object is
/// accepted only when `allow_object` is set.
fn parse_calls(text: &str, allow_object: bool) -> Option<Vec<ToolCall>> {
    let text = text.trim();
    let array = text.starts_with('[');
    if !array && !(allow_object && text.starts_with('{')) {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return calls_from_value(value);
    }

    // Cut back to the last complete calls, closing the array ourselves
    let ends = element_ends(text, usize::from(array));
    ends.iter().rev().take(MAX_TRUNCATION_CANDIDATES).find_map(|&end| {
        let candidate = &text[..=end];
        let parsed = if array {
            serde_json::from_str::<Value>(&format!("{candidate}]"))
        } else {
            serde_json::from_str::<Value>(candidate)
        };
        parsed.ok().and_then(calls_from_value)
    })
}

/// Byte offsets of each `}` that brings the nesting depth back to `base`,
/// stopping once the outermost bracket closes. String literals are skipped.
fn element_ends(text: &str, base: usize) -> Vec<usize> {
    let mut ends = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' | '{' => depth += 1,
            ']' | '}' => {
                depth = depth.saturating_sub(1);
                if ch == '}' && depth == base {
                    ends.push(offset);
                }
                if depth == 0 {
                    break;
                }
            }
            _ => {}
        }
    }
    ends
}

fn calls_from_value(value: Value) -> Option<Vec<ToolCall>> {
    let calls = match value {
        Value::Array(items) => items.into_iter().map(call_from_value).collect::<Option<Vec<_>>>()?,
        object @ Value::Object(_) => vec![call_from_value(object)?],
        _ => return None,
    };
    (!calls.is_empty()).then_some(calls)
}

fn call_from_value(value: Value) -> Option<ToolCall> {
    let Value::Object(mut fields) = value else {
        return None;
    };
    let name = match fields.remove("name")? {
        Value::String(name) if !name.is_empty() => name,
        _ => return None,
    };

    let arguments = match fields.remove("arguments").or_else(|| fields.remove("parameters")) {
        None | Some(Value::Null) => "{}".to_owned(),
        // Stringified arguments are re-encoded compactly when they are JSON
        Some(Value::String(raw)) => serde_json::from_str::<Value>(&raw)
            .map_or(raw, |parsed| parsed.to_string()),
        Some(other) => other.to_string(),
    };

    Some(ToolCall::new(String::new(), name, arguments))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_reasoning_tags() {
        let (content, reasoning) = split_reasoning("<think>\nUser wants 2+2.\n</think>\n\nThe answer is 4.");
        assert_eq!(content, "The answer is 4.");
        assert_eq!(reasoning.as_deref(), Some("User wants 2+2."));
    }

    #[test]
    fn test_split_reasoning_missing_tags() {
        // Some servers strip the opening tag from the template
        let (content, reasoning) = split_reasoning("thinking hard</think>Done.");
        assert_eq!(content, "Done.");
        assert_eq!(reasoning.as_deref(), Some("thinking hard"));

        let (content, reasoning) = split_reasoning("Answer first <think>then musing");
        assert_eq!(content, "Answer first");
        assert_eq!(reasoning.as_deref(), Some("then musing"));

        let (content, reasoning) = split_reasoning("plain answer");
        assert_eq!(content, "plain answer");
        assert!(reasoning.is_none());
    }

    #[test]
    fn test_recover_delimited_calls() {
        let content = r#"Let me compute that.<TOOLCALL>[{"name": "Calculator", "arguments": {"a": 2, "b": 3, "op": "add"}}]</TOOLCALL>"#;
        let (rest, calls) = recover_tool_calls(content, &["Calculator"]).unwrap();

        assert_eq!(rest, "Let me compute that.");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name(), "Calculator");
        assert!(calls[0].id.is_empty());
        let args: Value = serde_json::from_str(calls[0].arguments()).unwrap();
        assert_eq!(args, serde_json::json!({"a": 2, "b": 3, "op": "add"}));
    }

    #[test]
    fn test_recover_unclosed_delimiter_and_parameters_key() {
        let content = r#"<tool_call>[{"name": "search", "parameters": {"q": "rust"}}"#;
        let (_, calls) = recover_tool_calls(content, &["search"]).unwrap();
        assert_eq!(calls[0].name(), "search");
        assert_eq!(calls[0].arguments(), r#"{"q":"rust"}"#);
    }

    #[test]
    fn test_recover_raw_array_and_embedded_array() {
        let content = r#"[{"name":"a","arguments":"{ \"x\": 1 }"},{"name":"b"}]"#;
        let (_, calls) = recover_tool_calls(content, &["a", "b"]).unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].arguments(), r#"{"x":1}"#);
        assert_eq!(calls[1].arguments(), "{}");

        let content = r#"Calling now: [{"name":"lookup","arguments":{}}] ok"#;
        let (rest, calls) = recover_tool_calls(content, &["lookup"]).unwrap();
        assert_eq!(rest, "Calling now:");
        assert_eq!(calls[0].name(), "lookup");
    }

    #[test]
    fn test_recover_tolerates_trailing_junk() {
        let content = r#"[{"name":"a","arguments":{"x":1}}, {"name":"b","argu"#;
        let (_, calls) = recover_tool_calls(content, &["a", "b"]).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name(), "a");
    }

    #[test]
    fn test_plain_text_is_not_a_call() {
        let declared = ["title"];
        assert!(recover_tool_calls("The weather is fine [citation needed].", &declared).is_none());
        assert!(recover_tool_calls("[]", &declared).is_none());
        assert!(recover_tool_calls(r#"[{"title": "not a call"}]"#, &declared).is_none());
    }

    #[test]
    fn test_split_reasoning_close_before_open() {
        let (content, reasoning) = split_reasoning("a</think>b<think>c");
        assert_eq!(content, "b");
        assert_eq!(reasoning.as_deref(), Some("a\nc"));

        let (content, reasoning) = split_reasoning("early</think>answer<think>late</think>");
        assert_eq!(content, "answer");
        assert_eq!(reasoning.as_deref(), Some("early\nlate"));
    }

    #[test]
    fn test_bare_object_needs_delimiters() {
        // A structured answer whose field happens to be called `name`
        assert!(recover_tool_calls(r#"{"name": "Alice", "age": 30}"#, &["Alice"]).is_none());

        let content = r#"<tool_call>{"name": "search", "arguments": {"q": "rust"}}</tool_call>"#;
        let (_, calls) = recover_tool_calls(content, &["search"]).unwrap();
        assert_eq!(calls[0].name(), "search");
    }

    #[test]
    fn test_only_declared_tools_are_recovered() {
        let content = r#"[{"name": "Alice", "age": 30}]"#;
        assert!(recover_tool_calls(content, &[]).is_none());
        assert!(recover_tool_calls(content, &["Calculator"]).is_none());
        assert!(recover_tool_calls(r#"<TOOLCALL>[{"name": "calculator"}]</TOOLCALL>"#, &["Calculator"]).is_none());
    }

    #[test]
    fn test_code_after_calls_is_scanned_once() {
        let mut content = r#"[{"name": "lookup", "arguments": {"id": 7}}]"#.to_owned();
        for _ in 0..20_000 {
            content.push_str(" if x { y } else { \"}\" }");
        }
        let (rest, calls) = recover_tool_calls(&content, &["lookup"]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(calls[0].arguments(), r#"{"id":7}"#);

        assert_eq!(element_ends(r#"[{"a": "}"}, {"b": {}}, {"c"#, 1), vec![10, 21]);
    }
}
