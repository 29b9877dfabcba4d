//! Textual tool-call extraction
//!
//! Some providers answer tool-capable prompts with the tool invocation
//! embedded in plain assistant text instead of a structured `tool_calls`
//! field. This fix scans the text for `Tool call: NAME(JSON)` patterns
//! (with or without a leading `⏺` marker) and inline
//! `{"type":"tool_use",...}` JSON blobs, removes the matched substrings,
//! synthesises proper tool calls, and forces the finish reason.
//!
//! Runs only over the complete buffered text: the patterns cannot be
//! matched incrementally without false positives.

use regex::Regex;
use serde_json::{Value, json};
use std::sync::OnceLock;
use uuid::Uuid;

/// A tool call recovered from assistant text.
#[derive(Debug, Clone, PartialEq)]
struct RecoveredCall {
    name: String,
    arguments: Value,
}

/// Apply textual tool-call extraction to a chat-completions-shaped response.
#[must_use]
pub fn extract_textual_tool_calls(mut response: Value) -> Value {
    let Some(choices) = response.get_mut("choices").and_then(Value::as_array_mut) else {
        return response;
    };
    for choice in choices {
        let Some(content) = choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
        else {
            continue;
        };

        let (clean, recovered) = scan_text(content);
        if recovered.is_empty() {
            continue;
        }

        let Some(message) = choice.get_mut("message").and_then(Value::as_object_mut) else {
            continue;
        };
        if clean.trim().is_empty() {
            message.insert("content".into(), Value::Null);
        } else {
            message.insert("content".into(), Value::String(clean));
        }

        let calls = message
            .entry("tool_calls")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Some(calls) = calls.as_array_mut() {
            for call in recovered {
                calls.push(json!({
                    "id": format!("call_{}", Uuid::new_v4().simple()),
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": call.arguments.to_string(),
                    }
                }));
            }
        }

        if let Some(choice) = choice.as_object_mut() {
            choice.insert("finish_reason".into(), json!("tool_calls"));
        }
    }
    response
}

/// Scan text for embedded tool calls; returns the cleaned text and the
/// recovered calls in order of appearance.
fn scan_text(text: &str) -> (String, Vec<RecoveredCall>) {
    let (text, mut calls) = extract_call_patterns(text);
    let (text, inline) = extract_inline_blobs(&text);
    calls.extend(inline);
    (tidy_whitespace(&text), calls)
}

fn call_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:⏺\s*)?Tool call:\s*([A-Za-z_][A-Za-z0-9_.-]*)\s*\(").expect("static regex")
    })
}

/// Extract `Tool call: NAME(JSON)` patterns.
fn extract_call_patterns(text: &str) -> (String, Vec<RecoveredCall>) {
    let mut calls = Vec::new();
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;

    while let Some(m) = call_pattern().find_at(text, cursor) {
        let name = call_pattern()
            .captures(&text[m.start()..])
            .and_then(|c| c.get(1).map(|g| g.as_str().to_string()))
            .unwrap_or_default();
        let open_paren = m.end() - 1;
        match balanced_span(text, open_paren, '(', ')') {
            Some(close_paren) => {
                let args_text = &text[open_paren + 1..close_paren];
                match serde_json::from_str::<Value>(args_text) {
                    Ok(arguments) => {
                        out.push_str(&text[cursor..m.start()]);
                        calls.push(RecoveredCall { name, arguments });
                        cursor = close_paren + 1;
                    }
                    Err(_) => {
                        // Not JSON arguments; keep the text verbatim.
                        out.push_str(&text[cursor..m.end()]);
                        cursor = m.end();
                    }
                }
            }
            None => {
                out.push_str(&text[cursor..m.end()]);
                cursor = m.end();
            }
        }
    }
    out.push_str(&text[cursor..]);
    (out, calls)
}

/// Extract inline `{"type":"tool_use", ...}` JSON blobs.
fn extract_inline_blobs(text: &str) -> (String, Vec<RecoveredCall>) {
    let mut calls = Vec::new();
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;

    while let Some(rel) = text[cursor..].find('{') {
        let open = cursor + rel;
        out.push_str(&text[cursor..open]);
        let Some(close) = balanced_span(text, open, '{', '}') else {
            out.push_str(&text[open..]);
            return (out, calls);
        };
        let candidate = &text[open..=close];
        match serde_json::from_str::<Value>(candidate) {
            Ok(blob) if blob.get("type").and_then(Value::as_str) == Some("tool_use") => {
                let name = blob
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let arguments = blob.get("input").cloned().unwrap_or_else(|| json!({}));
                if name.is_empty() {
                    out.push_str(candidate);
                } else {
                    calls.push(RecoveredCall { name, arguments });
                }
                cursor = close + 1;
            }
            _ => {
                // Plain JSON or prose braces; keep and continue past the brace.
                out.push('{');
                cursor = open + 1;
            }
        }
    }
    out.push_str(&text[cursor..]);
    (out, calls)
}

/// Find the index of the character closing the bracket opened at `open_idx`,
/// ignoring brackets inside JSON string literals.
fn balanced_span(text: &str, open_idx: usize, open: char, close: char) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[open_idx..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
        } else if c == '"' {
            in_string = true;
        } else if c == open {
            depth += 1;
        } else if c == close {
            depth = depth.checked_sub(1)?;
            if depth == 0 {
                return Some(open_idx + i);
            }
        }
    }
    None
}

/// Collapse runs of 3+ newlines left behind by removed substrings.
fn tidy_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut newlines = 0;
    for c in text.chars() {
        if c == '\n' {
            newlines += 1;
            if newlines <= 2 {
                out.push(c);
            }
        } else {
            newlines = 0;
            out.push(c);
        }
    }
    out.trim_end().to_string()
}
