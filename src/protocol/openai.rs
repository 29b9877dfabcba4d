//! OpenAI chat-completions dialect
//!
//! Endpoint construction and streaming-frame reassembly for the
//! chat-completions protocol family (OpenAI proper, LMStudio, Ollama and
//! other compatible local servers).

use serde_json::{Map, Value, json};

use crate::error::{Error, Result};

/// Build the chat-completions endpoint URL from a provider base URL.
///
/// Bases that already end in `/v1` (the LMStudio/Ollama convention) get
/// `/chat/completions` appended; bare bases get the full `/v1/chat/completions`.
#[must_use]
pub fn endpoint(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/v1") {
        format!("{base}/chat/completions")
    } else {
        format!("{base}/v1/chat/completions")
    }
}

/// Reassemble a complete chat-completion object from an SSE body.
///
/// Deltas are merged per choice index: `content` fragments are concatenated,
/// `tool_calls` argument fragments are buffered by call index and joined so
/// that only whole argument strings survive aggregation. The final object
/// has the non-streaming `choices[*].message` shape.
pub fn aggregate_sse(body: &str) -> Result<Value> {
    let mut id = None;
    let mut model = None;
    let mut created = None;
    let mut role = None;
    let mut content = String::new();
    let mut finish_reason: Option<String> = None;
    let mut usage: Option<Value> = None;
    // tool calls keyed by delta index
    let mut tool_calls: Vec<ToolCallAccum> = Vec::new();
    let mut saw_chunk = false;

    for line in body.lines() {
        let Some(data) = line.strip_prefix("data:").map(str::trim) else {
            continue;
        };
        if data == "[DONE]" {
            break;
        }
        let chunk: Value = serde_json::from_str(data)
            .map_err(|e| Error::upstream_protocol(format!("bad SSE chunk: {e}")))?;
        saw_chunk = true;

        if id.is_none() {
            id = chunk.get("id").and_then(Value::as_str).map(String::from);
        }
        if model.is_none() {
            model = chunk.get("model").and_then(Value::as_str).map(String::from);
        }
        if created.is_none() {
            created = chunk.get("created").and_then(Value::as_i64);
        }
        if let Some(u) = chunk.get("usage").filter(|u| !u.is_null()) {
            usage = Some(u.clone());
        }

        let Some(choice) = chunk
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
        else {
            continue;
        };
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            finish_reason = Some(reason.to_string());
        }
        let Some(delta) = choice.get("delta") else {
            continue;
        };
        if let Some(r) = delta.get("role").and_then(Value::as_str) {
            role = Some(r.to_string());
        }
        if let Some(c) = delta.get("content").and_then(Value::as_str) {
            content.push_str(c);
        }
        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                merge_tool_call_delta(&mut tool_calls, call);
            }
        }
    }

    if !saw_chunk {
        return Err(Error::upstream_protocol("SSE body contained no data frames"));
    }

    let mut message = Map::new();
    message.insert("role".into(), json!(role.unwrap_or_else(|| "assistant".into())));
    if tool_calls.is_empty() {
        message.insert("content".into(), json!(content));
    } else {
        if !content.is_empty() {
            message.insert("content".into(), json!(content));
        } else {
            message.insert("content".into(), Value::Null);
        }
        let calls: Vec<Value> = tool_calls.into_iter().map(ToolCallAccum::finish).collect();
        message.insert("tool_calls".into(), Value::Array(calls));
    }

    let mut out = Map::new();
    if let Some(id) = id {
        out.insert("id".into(), json!(id));
    }
    out.insert("object".into(), json!("chat.completion"));
    if let Some(created) = created {
        out.insert("created".into(), json!(created));
    }
    if let Some(model) = model {
        out.insert("model".into(), json!(model));
    }
    out.insert(
        "choices".into(),
        json!([{
            "index": 0,
            "message": Value::Object(message),
            "finish_reason": finish_reason.unwrap_or_else(|| "stop".into()),
        }]),
    );
    if let Some(usage) = usage {
        out.insert("usage".into(), usage);
    }
    Ok(Value::Object(out))
}

/// Per-index accumulator for a streamed tool call.
struct ToolCallAccum {
    id: Option<String>,
    name: String,
    arguments: String,
}

impl ToolCallAccum {
    fn finish(self) -> Value {
        json!({
            "id": self.id.unwrap_or_default(),
            "type": "function",
            "function": {
                "name": self.name,
                "arguments": self.arguments,
            }
        })
    }
}

fn merge_tool_call_delta(accum: &mut Vec<ToolCallAccum>, delta: &Value) {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let index = delta.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
    while accum.len() <= index {
        accum.push(ToolCallAccum {
            id: None,
            name: String::new(),
            arguments: String::new(),
        });
    }
    let slot = &mut accum[index];
    if let Some(id) = delta.get("id").and_then(Value::as_str) {
        slot.id = Some(id.to_string());
    }
    if let Some(function) = delta.get("function") {
        if let Some(name) = function.get("name").and_then(Value::as_str) {
            slot.name.push_str(name);
        }
        if let Some(args) = function.get("arguments").and_then(Value::as_str) {
            slot.arguments.push_str(args);
        }
    }
}
