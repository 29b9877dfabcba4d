//! Standard response fixes
//!
//! Each fix is a small deterministic transform over the provider-native
//! (chat-completions-shaped) response. All fixes are idempotent.

use serde_json::{Map, Value, json};
use uuid::Uuid;

use super::FixTag;

/// Apply one standard fix tag.
#[must_use]
pub fn apply_fix(tag: FixTag, mut response: Value) -> Value {
    let Some(obj) = response.as_object_mut() else {
        return response;
    };
    match tag {
        FixTag::MissingId => fix_missing_id(obj),
        FixTag::MissingCreated => fix_missing_created(obj),
        FixTag::MissingUsage => fix_missing_usage(obj),
        FixTag::ChoicesArrayFix => fix_choices_array(obj),
        FixTag::ToolCallsFormat => fix_tool_calls_format(obj),
        FixTag::BasicStandardization => fix_basic_standardization(obj),
        // Handled separately, after the standard fixes.
        FixTag::ExtractTextualToolCalls => {}
    }
    response
}

fn fix_missing_id(obj: &mut Map<String, Value>) {
    let missing = !obj.get("id").is_some_and(|v| v.as_str().is_some_and(|s| !s.is_empty()));
    if missing {
        obj.insert("id".into(), json!(format!("chatcmpl-{}", Uuid::new_v4().simple())));
    }
}

fn fix_missing_created(obj: &mut Map<String, Value>) {
    if !obj.get("created").is_some_and(Value::is_number) {
        obj.insert("created".into(), json!(chrono::Utc::now().timestamp()));
    }
}

fn fix_missing_usage(obj: &mut Map<String, Value>) {
    let usage = obj.entry("usage").or_insert_with(|| json!({}));
    if !usage.is_object() {
        *usage = json!({});
    }
    let usage = usage.as_object_mut().expect("usage is an object");
    for field in ["prompt_tokens", "completion_tokens"] {
        if !usage.get(field).is_some_and(Value::is_number) {
            usage.insert(field.into(), json!(0));
        }
    }
}

/// Repair a missing or non-array `choices` field. Providers have been seen
/// returning a bare `message`, a bare `content` string, or a single choice
/// object instead of the array.
fn fix_choices_array(obj: &mut Map<String, Value>) {
    match obj.get("choices") {
        Some(Value::Array(_)) => {}
        Some(choice @ Value::Object(_)) => {
            let choice = choice.clone();
            obj.insert("choices".into(), Value::Array(vec![choice]));
        }
        _ => {
            let message = if let Some(message) = obj.remove("message") {
                message
            } else if let Some(content) = obj.remove("content") {
                json!({"role": "assistant", "content": content})
            } else if let Some(text) = obj.remove("text") {
                json!({"role": "assistant", "content": text})
            } else {
                json!({"role": "assistant", "content": ""})
            };
            obj.insert(
                "choices".into(),
                json!([{"index": 0, "message": message, "finish_reason": "stop"}]),
            );
        }
    }
}

/// Normalise every `tool_calls` entry: id present, `type` = "function",
/// arguments a JSON string (objects are stringified).
fn fix_tool_calls_format(obj: &mut Map<String, Value>) {
    let Some(choices) = obj.get_mut("choices").and_then(Value::as_array_mut) else {
        return;
    };
    for choice in choices {
        let Some(calls) = choice
            .get_mut("message")
            .and_then(|m| m.get_mut("tool_calls"))
            .and_then(Value::as_array_mut)
        else {
            continue;
        };
        for call in calls {
            let Some(call) = call.as_object_mut() else {
                continue;
            };
            if !call.get("id").is_some_and(|v| v.as_str().is_some_and(|s| !s.is_empty())) {
                call.insert("id".into(), json!(format!("call_{}", Uuid::new_v4().simple())));
            }
            call.insert("type".into(), json!("function"));

            // Some providers inline name/arguments without the function wrapper.
            if !call.contains_key("function") {
                let name = call.remove("name").unwrap_or(json!(""));
                let arguments = call.remove("arguments").unwrap_or(json!("{}"));
                call.insert("function".into(), json!({"name": name, "arguments": arguments}));
            }
            if let Some(function) = call.get_mut("function").and_then(Value::as_object_mut) {
                match function.get("arguments") {
                    Some(Value::String(_)) => {}
                    Some(other) => {
                        let stringified = other.to_string();
                        function.insert("arguments".into(), Value::String(stringified));
                    }
                    None => {
                        function.insert("arguments".into(), json!("{}"));
                    }
                }
            }
        }
    }
}

fn fix_basic_standardization(obj: &mut Map<String, Value>) {
    if !obj.get("object").is_some_and(|v| v.as_str() == Some("chat.completion")) {
        obj.insert("object".into(), json!("chat.completion"));
    }
    let Some(choices) = obj.get_mut("choices").and_then(Value::as_array_mut) else {
        return;
    };
    for (i, choice) in choices.iter_mut().enumerate() {
        let Some(choice) = choice.as_object_mut() else {
            continue;
        };
        if !choice.get("index").is_some_and(Value::is_number) {
            choice.insert("index".into(), json!(i));
        }
        if !choice.get("finish_reason").is_some_and(|v| v.is_string()) {
            choice.insert("finish_reason".into(), json!("stop"));
        }
        if let Some(message) = choice.get_mut("message").and_then(Value::as_object_mut) {
            if !message.get("role").is_some_and(|v| v.is_string()) {
                message.insert("role".into(), json!("assistant"));
            }
        }
    }
}
