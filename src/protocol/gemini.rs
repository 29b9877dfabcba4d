//! Gemini generateContent dialect
//!
//! Endpoint construction and streaming reassembly for the Gemini protocol
//! family.

use serde_json::{Map, Value, json};

use crate::error::{Error, Result};

/// Build the generateContent endpoint URL.
#[must_use]
pub fn endpoint(base_url: &str, model: &str, stream: bool) -> String {
    let base = base_url.trim_end_matches('/');
    if stream {
        format!("{base}/v1beta/models/{model}:streamGenerateContent?alt=sse")
    } else {
        format!("{base}/v1beta/models/{model}:generateContent")
    }
}

/// Reassemble a complete generateContent response from an SSE body.
///
/// Each frame is a partial `GenerateContentResponse`; text parts are
/// concatenated, `functionCall` parts collected whole, and the last seen
/// `finishReason` / `usageMetadata` win.
pub fn aggregate_sse(body: &str) -> Result<Value> {
    let mut text = String::new();
    let mut function_calls: Vec<Value> = Vec::new();
    let mut finish_reason: Option<String> = None;
    let mut usage: Option<Value> = None;
    let mut model_version: Option<String> = None;
    let mut saw_chunk = false;

    for line in body.lines() {
        let Some(data) = line.strip_prefix("data:").map(str::trim) else {
            continue;
        };
        if data.is_empty() {
            continue;
        }
        let chunk: Value = serde_json::from_str(data)
            .map_err(|e| Error::upstream_protocol(format!("bad Gemini SSE chunk: {e}")))?;
        saw_chunk = true;

        if model_version.is_none() {
            model_version = chunk
                .get("modelVersion")
                .and_then(Value::as_str)
                .map(String::from);
        }
        if let Some(u) = chunk.get("usageMetadata").filter(|u| !u.is_null()) {
            usage = Some(u.clone());
        }
        let Some(candidate) = chunk
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
        else {
            continue;
        };
        if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
            finish_reason = Some(reason.to_string());
        }
        if let Some(parts) = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)
        {
            for part in parts {
                if let Some(t) = part.get("text").and_then(Value::as_str) {
                    text.push_str(t);
                } else if part.get("functionCall").is_some() {
                    function_calls.push(part.clone());
                }
            }
        }
    }

    if !saw_chunk {
        return Err(Error::upstream_protocol("Gemini SSE body contained no data frames"));
    }

    let mut parts: Vec<Value> = Vec::new();
    if !text.is_empty() {
        parts.push(json!({"text": text}));
    }
    parts.extend(function_calls);

    let mut out = Map::new();
    out.insert(
        "candidates".into(),
        json!([{
            "content": {"role": "model", "parts": parts},
            "finishReason": finish_reason.unwrap_or_else(|| "STOP".into()),
        }]),
    );
    if let Some(usage) = usage {
        out.insert("usageMetadata".into(), usage);
    }
    if let Some(v) = model_version {
        out.insert("modelVersion".into(), json!(v));
    }
    Ok(Value::Object(out))
}
