//! Anthropic ⇄ Gemini generateContent conversion

use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::messages::{
    CanonicalRequest, CanonicalResponse, ContentBlock, MessageContent, ResponseBlock, Role,
    StopReason, ToolChoice, Usage,
};

/// Convert a canonical request into a generateContent request body.
///
/// Messages become `contents` with roles `user` / `model`; assistant
/// `tool_use` blocks become `functionCall` parts; tool results become
/// user-role text parts. Tools are wrapped in a one-element
/// `[{functionDeclarations: [...]}]` array — the wrapping array is part of
/// the wire contract.
pub fn request_out(request: &CanonicalRequest, _target_model: &str) -> Result<Value> {
    let mut contents: Vec<Value> = Vec::with_capacity(request.messages.len());

    for message in &request.messages {
        let role = match message.role {
            Role::Assistant => "model",
            // System turns inside the message list become user turns; the
            // top-level system string rides in systemInstruction below.
            Role::User | Role::System | Role::Tool => "user",
        };
        let parts = convert_parts(&message.content)?;
        if parts.is_empty() {
            continue;
        }
        contents.push(json!({"role": role, "parts": parts}));
    }

    let mut body = Map::new();
    body.insert("contents".into(), Value::Array(contents));

    if let Some(system) = &request.system {
        body.insert(
            "systemInstruction".into(),
            json!({"parts": [{"text": system}]}),
        );
    }

    let mut generation = Map::new();
    generation.insert("maxOutputTokens".into(), json!(request.max_tokens));
    if let Some(t) = request.temperature {
        generation.insert("temperature".into(), json!(t));
    }
    if let Some(p) = request.top_p {
        generation.insert("topP".into(), json!(p));
    }
    if let Some(k) = request.top_k {
        generation.insert("topK".into(), json!(k));
    }
    if !request.stop_sequences.is_empty() {
        generation.insert("stopSequences".into(), json!(request.stop_sequences));
    }
    body.insert("generationConfig".into(), Value::Object(generation));

    if !request.tools.is_empty() {
        let declarations: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description.clone().unwrap_or_default(),
                    "parameters": t.input_schema,
                })
            })
            .collect();
        // The single-object wrapping array is mandatory.
        body.insert(
            "tools".into(),
            json!([{"functionDeclarations": declarations}]),
        );
        if let Some(choice) = &request.tool_choice {
            body.insert("toolConfig".into(), convert_tool_choice(choice));
        }
    }

    Ok(Value::Object(body))
}

fn convert_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!({"functionCallingConfig": {"mode": "AUTO"}}),
        ToolChoice::Any => json!({"functionCallingConfig": {"mode": "ANY"}}),
        ToolChoice::Tool { name } => json!({
            "functionCallingConfig": {"mode": "ANY", "allowedFunctionNames": [name]}
        }),
    }
}

fn convert_parts(content: &MessageContent) -> Result<Vec<Value>> {
    let blocks = match content {
        MessageContent::Text(s) => {
            return Ok(if s.is_empty() {
                Vec::new()
            } else {
                vec![json!({"text": s})]
            });
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    let mut parts = Vec::with_capacity(blocks.len());
    for block in blocks {
        match block {
            ContentBlock::Text { text } => parts.push(json!({"text": text})),
            ContentBlock::Image { source } => {
                let kind = source.get("type").and_then(Value::as_str).unwrap_or_default();
                if kind != "base64" {
                    return Err(Error::transform(format!(
                        "gemini inline images require base64 sources, got `{kind}`"
                    )));
                }
                parts.push(json!({
                    "inlineData": {
                        "mimeType": source.get("media_type").cloned().unwrap_or(json!("image/png")),
                        "data": source.get("data").cloned().unwrap_or(json!("")),
                    }
                }));
            }
            ContentBlock::ToolUse { name, input, .. } => {
                parts.push(json!({"functionCall": {"name": name, "args": input}}));
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                let payload = match content {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                parts.push(json!({
                    "text": format!("Tool \"{tool_use_id}\" result: {payload}")
                }));
            }
        }
    }
    Ok(parts)
}

/// Convert a generateContent response into the canonical response.
pub fn response_in(response: &Value, virtual_model: &str) -> Result<CanonicalResponse> {
    let candidate = response
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| Error::upstream_protocol("response has no candidates"))?;

    let mut out = CanonicalResponse::new(format!("msg_{}", Uuid::new_v4().simple()), virtual_model);

    if let Some(parts) = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
    {
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                // Merge consecutive text parts into one block.
                if let Some(ResponseBlock::Text { text: existing }) = out.content.last_mut() {
                    existing.push_str(text);
                } else {
                    out.content.push(ResponseBlock::Text { text: text.to_string() });
                }
            } else if let Some(call) = part.get("functionCall") {
                out.content.push(ResponseBlock::ToolUse {
                    id: format!("toolu_{}", Uuid::new_v4().simple()),
                    name: call
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    input: call.get("args").cloned().unwrap_or_else(|| json!({})),
                });
            }
        }
    }
    if out.content.is_empty() {
        out.content.push(ResponseBlock::Text { text: String::new() });
    }

    out.stop_reason = match candidate.get("finishReason").and_then(Value::as_str) {
        Some("MAX_TOKENS") => StopReason::MaxTokens,
        Some("SAFETY" | "RECITATION") => StopReason::StopSequence,
        _ => StopReason::EndTurn,
    };

    out.usage = Usage {
        input_tokens: response
            .pointer("/usageMetadata/promptTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        output_tokens: response
            .pointer("/usageMetadata/candidatesTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    };

    out.reconcile_stop_reason();
    Ok(out)
}
