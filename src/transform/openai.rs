//! Anthropic ⇄ OpenAI chat-completions conversion

use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::messages::{
    CanonicalRequest, CanonicalResponse, ContentBlock, MessageContent, ResponseBlock, Role,
    StopReason, ToolChoice, Usage,
};

/// Diagnostic key under which unparseable tool arguments are preserved.
pub const RAW_ARGUMENTS_KEY: &str = "__raw_arguments";

/// Convert a canonical request into a chat-completions request body.
///
/// The virtual model name is replaced with `target_model`; the `system`
/// string becomes a leading system message; content lists are flattened to
/// plain strings whenever every block is text.
pub fn request_out(request: &CanonicalRequest, target_model: &str) -> Result<Value> {
    let mut messages: Vec<Value> = Vec::with_capacity(request.messages.len() + 1);

    if let Some(system) = &request.system {
        messages.push(json!({"role": "system", "content": system}));
    }

    for message in &request.messages {
        convert_message(message.role, &message.content, &mut messages)?;
    }

    let mut body = Map::new();
    body.insert("model".into(), json!(target_model));
    body.insert("messages".into(), Value::Array(messages));
    body.insert("max_tokens".into(), json!(request.max_tokens));
    if let Some(t) = request.temperature {
        body.insert("temperature".into(), json!(t));
    }
    if let Some(p) = request.top_p {
        body.insert("top_p".into(), json!(p));
    }
    // top_k is not a chat-completions knob; dropped rather than forwarded.
    if !request.stop_sequences.is_empty() {
        body.insert("stop".into(), json!(request.stop_sequences));
    }
    if request.stream {
        body.insert("stream".into(), json!(true));
        body.insert("stream_options".into(), json!({"include_usage": true}));
    }

    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description.clone().unwrap_or_default(),
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
        body.insert("tools".into(), Value::Array(tools));
        if let Some(choice) = &request.tool_choice {
            body.insert("tool_choice".into(), convert_tool_choice(choice));
        }
    }

    Ok(Value::Object(body))
}

fn convert_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::Any => json!("required"),
        ToolChoice::Tool { name } => json!({"type": "function", "function": {"name": name}}),
    }
}

/// Convert one canonical message, splitting out tool results into their own
/// `role: tool` messages as the chat-completions shape requires.
fn convert_message(role: Role, content: &MessageContent, out: &mut Vec<Value>) -> Result<()> {
    let role_label = match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
        Role::Tool => "tool",
    };

    if let Some(flat) = content.as_flat_text() {
        out.push(json!({"role": role_label, "content": flat}));
        return Ok(());
    }

    let MessageContent::Blocks(blocks) = content else {
        // as_flat_text() covers the string arm.
        return Ok(());
    };

    let mut parts: Vec<Value> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    let mut tool_results: Vec<Value> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => {
                parts.push(json!({"type": "text", "text": text}));
            }
            ContentBlock::Image { source } => {
                parts.push(convert_image(source)?);
            }
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": {"name": name, "arguments": input.to_string()},
                }));
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                let text = match content {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                tool_results.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": text,
                }));
            }
        }
    }

    if !parts.is_empty() || !tool_calls.is_empty() {
        let mut message = Map::new();
        message.insert("role".into(), json!(role_label));
        if parts.is_empty() {
            message.insert("content".into(), Value::Null);
        } else if parts.len() == 1 && parts[0].get("type").and_then(Value::as_str) == Some("text") {
            message.insert("content".into(), parts[0]["text"].clone());
        } else {
            message.insert("content".into(), Value::Array(parts));
        }
        if !tool_calls.is_empty() {
            message.insert("tool_calls".into(), Value::Array(tool_calls));
        }
        out.push(Value::Object(message));
    }
    out.extend(tool_results);
    Ok(())
}

fn convert_image(source: &Value) -> Result<Value> {
    let kind = source.get("type").and_then(Value::as_str).unwrap_or_default();
    let url = match kind {
        "base64" => {
            let media = source
                .get("media_type")
                .and_then(Value::as_str)
                .unwrap_or("image/png");
            let data = source
                .get("data")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::transform("image block missing base64 data"))?;
            format!("data:{media};base64,{data}")
        }
        "url" => source
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::transform("image block missing url"))?
            .to_string(),
        other => {
            return Err(Error::transform(format!("unsupported image source type: {other}")));
        }
    };
    Ok(json!({"type": "image_url", "image_url": {"url": url}}))
}

/// Convert a chat-completions response into the canonical response.
///
/// `virtual_model` is echoed back as the response model name regardless of
/// what the upstream reports.
pub fn response_in(response: &Value, virtual_model: &str) -> Result<CanonicalResponse> {
    let id = response
        .get("id")
        .and_then(Value::as_str)
        .map_or_else(|| format!("msg_{}", Uuid::new_v4().simple()), String::from);

    let choice = response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| Error::upstream_protocol("response has no choices"))?;
    let message = choice
        .get("message")
        .ok_or_else(|| Error::upstream_protocol("choice has no message"))?;

    let mut out = CanonicalResponse::new(id, virtual_model);

    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            let call_id = call
                .get("id")
                .and_then(Value::as_str)
                .map_or_else(|| format!("toolu_{}", Uuid::new_v4().simple()), String::from);
            let function = call.get("function").cloned().unwrap_or_else(|| json!({}));
            let name = function
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let input = parse_arguments(function.get("arguments"));
            out.content.push(ResponseBlock::ToolUse {
                id: call_id,
                name,
                input,
            });
        }
        if let Some(text) = message.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                out.content.insert(0, ResponseBlock::Text { text: text.to_string() });
            }
        }
    } else {
        let text = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        out.content.push(ResponseBlock::Text { text });
    }

    out.stop_reason = match choice.get("finish_reason").and_then(Value::as_str) {
        Some("length") => StopReason::MaxTokens,
        Some("tool_calls") => StopReason::ToolUse,
        Some("content_filter") => StopReason::StopSequence,
        _ => StopReason::EndTurn,
    };

    out.usage = Usage {
        input_tokens: response
            .pointer("/usage/prompt_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        output_tokens: response
            .pointer("/usage/completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    };

    out.reconcile_stop_reason();
    Ok(out)
}

/// Parse a tool-call arguments string, preserving the original under a
/// diagnostic key when it is not valid JSON.
fn parse_arguments(arguments: Option<&Value>) -> Value {
    match arguments {
        Some(Value::String(s)) if s.trim().is_empty() => json!({}),
        Some(Value::String(s)) => serde_json::from_str(s)
            .unwrap_or_else(|_| json!({RAW_ARGUMENTS_KEY: s})),
        Some(obj @ Value::Object(_)) => obj.clone(),
        _ => json!({}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{Message, RequestMetadata, ToolDefinition};
    use pretty_assertions::assert_eq;

    fn request(messages: Vec<Message>) -> CanonicalRequest {
        CanonicalRequest {
            model: "default".into(),
            max_tokens: 50,
            messages,
            system: None,
            tools: Vec::new(),
            tool_choice: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: Vec::new(),
            stream: false,
            metadata: RequestMetadata::default(),
        }
    }

    fn user_text(text: &str) -> Message {
        Message {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    #[test]
    fn system_collapses_into_leading_message() {
        let mut req = request(vec![user_text("hi")]);
        req.system = Some("be brief".into());
        let body = request_out(&req, "m1").unwrap();
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "be brief");
        assert_eq!(body["messages"][1]["role"], "user");
    }

    #[test]
    fn model_is_rewritten_to_target() {
        let body = request_out(&request(vec![user_text("hi")]), "concrete-model").unwrap();
        assert_eq!(body["model"], "concrete-model");
    }

    #[test]
    fn all_text_blocks_flatten_to_string() {
        let msg = Message {
            role: Role::User,
            content: MessageContent::Blocks(vec![
                ContentBlock::Text { text: "a".into() },
                ContentBlock::Text { text: "b".into() },
            ]),
        };
        let body = request_out(&request(vec![msg]), "m1").unwrap();
        assert_eq!(body["messages"][0]["content"], "a\nb");
    }

    #[test]
    fn tools_translate_to_function_wrappers() {
        let mut req = request(vec![user_text("hi")]);
        req.tools.push(ToolDefinition {
            name: "get_weather".into(),
            description: Some("weather lookup".into()),
            input_schema: json!({"type": "object", "properties": {"city": {"type": "string"}}}),
        });
        req.tool_choice = Some(ToolChoice::Any);
        let body = request_out(&req, "m1").unwrap();
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "get_weather");
        assert_eq!(body["tools"][0]["function"]["parameters"]["type"], "object");
        assert_eq!(body["tool_choice"], "required");
    }

    #[test]
    fn named_tool_choice_translates_to_function_object() {
        let mut req = request(vec![user_text("hi")]);
        req.tools.push(ToolDefinition {
            name: "f".into(),
            description: None,
            input_schema: json!({}),
        });
        req.tool_choice = Some(ToolChoice::Tool { name: "f".into() });
        let body = request_out(&req, "m1").unwrap();
        assert_eq!(body["tool_choice"]["function"]["name"], "f");
    }

    #[test]
    fn top_k_is_dropped_from_the_wire() {
        let mut req = request(vec![user_text("hi")]);
        req.top_k = Some(40);
        let body = request_out(&req, "m1").unwrap();
        assert!(body.get("top_k").is_none());
    }

    #[test]
    fn tool_result_becomes_tool_role_message() {
        let msg = Message {
            role: Role::User,
            content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: "toolu_1".into(),
                content: json!("42"),
                is_error: None,
            }]),
        };
        let body = request_out(&request(vec![msg]), "m1").unwrap();
        assert_eq!(body["messages"][0]["role"], "tool");
        assert_eq!(body["messages"][0]["tool_call_id"], "toolu_1");
        assert_eq!(body["messages"][0]["content"], "42");
    }

    #[test]
    fn assistant_tool_use_becomes_tool_calls() {
        let msg = Message {
            role: Role::Assistant,
            content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                id: "toolu_1".into(),
                name: "get_weather".into(),
                input: json!({"city": "NYC"}),
            }]),
        };
        let body = request_out(&request(vec![msg]), "m1").unwrap();
        let call = &body["messages"][0]["tool_calls"][0];
        assert_eq!(call["id"], "toolu_1");
        assert_eq!(call["function"]["arguments"], "{\"city\":\"NYC\"}");
        assert!(body["messages"][0]["content"].is_null());
    }

    #[test]
    fn text_response_maps_to_single_text_block() {
        let resp = json!({
            "id": "chatcmpl-1",
            "choices": [{"message": {"role": "assistant", "content": "hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1}
        });
        let out = response_in(&resp, "default").unwrap();
        assert_eq!(out.id, "chatcmpl-1");
        assert_eq!(out.model, "default");
        assert_eq!(out.kind, "message");
        assert_eq!(out.role, "assistant");
        assert_eq!(out.content, vec![ResponseBlock::Text { text: "hello".into() }]);
        assert_eq!(out.stop_reason, StopReason::EndTurn);
        assert_eq!(out.usage, Usage { input_tokens: 1, output_tokens: 1 });
    }

    #[test]
    fn tool_calls_become_tool_use_blocks() {
        let resp = json!({
            "choices": [{"message": {"role": "assistant", "content": null, "tool_calls": [
                {"id": "call_1", "function": {"name": "get_weather", "arguments": "{\"city\":\"NYC\"}"}}
            ]}, "finish_reason": "tool_calls"}]
        });
        let out = response_in(&resp, "default").unwrap();
        assert_eq!(out.stop_reason, StopReason::ToolUse);
        match &out.content[0] {
            ResponseBlock::ToolUse { id, name, input } => {
                assert_eq!(id, "call_1");
                assert_eq!(name, "get_weather");
                assert_eq!(input["city"], "NYC");
            }
            other => panic!("wrong block: {other:?}"),
        }
    }

    #[test]
    fn bad_arguments_json_is_preserved_under_diagnostic_key() {
        let resp = json!({
            "choices": [{"message": {"tool_calls": [
                {"id": "call_1", "function": {"name": "f", "arguments": "{broken"}}
            ]}, "finish_reason": "tool_calls"}]
        });
        let out = response_in(&resp, "default").unwrap();
        match &out.content[0] {
            ResponseBlock::ToolUse { input, .. } => {
                assert_eq!(input[RAW_ARGUMENTS_KEY], "{broken");
            }
            other => panic!("wrong block: {other:?}"),
        }
    }

    #[test]
    fn finish_reason_mapping_table() {
        for (upstream, expected) in [
            ("stop", StopReason::EndTurn),
            ("length", StopReason::MaxTokens),
            ("content_filter", StopReason::StopSequence),
        ] {
            let resp = json!({
                "choices": [{"message": {"content": "x"}, "finish_reason": upstream}]
            });
            assert_eq!(response_in(&resp, "m").unwrap().stop_reason, expected, "{upstream}");
        }
    }

    #[test]
    fn missing_usage_synthesises_zeros() {
        let resp = json!({"choices": [{"message": {"content": "x"}, "finish_reason": "stop"}]});
        let out = response_in(&resp, "m").unwrap();
        assert_eq!(out.usage, Usage::default());
    }

    #[test]
    fn round_trip_preserves_semantic_fields() {
        let mut req = request(vec![user_text("what is the weather?")]);
        req.system = Some("be helpful".into());
        req.stop_sequences = vec!["END".into()];
        req.tools.push(ToolDefinition {
            name: "get_weather".into(),
            description: Some("lookup".into()),
            input_schema: json!({"type": "object"}),
        });
        let body = request_out(&req, "m1").unwrap();

        // Message order: system first, then the user turn.
        let roles: Vec<&str> = body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["system", "user"]);
        assert_eq!(body["stop"], json!(["END"]));
        assert_eq!(body["tools"].as_array().unwrap().len(), 1);
    }
}
