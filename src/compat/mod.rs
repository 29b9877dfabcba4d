//! Server-compatibility fixes
//!
//! Provider quirk handling in two phases: request preprocessing (parameter
//! clamping, tool stripping, model-name remaps) and response postprocessing
//! (an ordered list of named, idempotent fix tags). The contract of every
//! fix: input may or may not exhibit the defect; output satisfies the
//! corresponding invariant; applying the list twice equals applying it once.

mod fixes;
mod textual;

pub use fixes::apply_fix;
pub use textual::extract_textual_tool_calls;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::routing::ProviderSpec;

/// A named response-repair transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixTag {
    /// Synthesise a missing response id
    MissingId,
    /// Synthesise a missing `created` timestamp
    MissingCreated,
    /// Synthesise zeroed usage accounting
    MissingUsage,
    /// Repair a missing or non-array `choices` field
    ChoicesArrayFix,
    /// Normalise `tool_calls` entries (ids, `type`, stringified arguments)
    ToolCallsFormat,
    /// Baseline shape normalisation (`object`, role, finish reason)
    BasicStandardization,
    /// Scan assistant text for embedded tool-call patterns
    ExtractTextualToolCalls,
}

/// Apply a provider's ordered fix list to a provider-native response.
///
/// Textual tool-call extraction always runs after the standard fixes,
/// regardless of its position in the configured list.
#[must_use]
pub fn apply_fixes(tags: &[FixTag], mut response: Value) -> Value {
    for tag in tags.iter().filter(|t| **t != FixTag::ExtractTextualToolCalls) {
        response = apply_fix(*tag, response);
    }
    if tags.contains(&FixTag::ExtractTextualToolCalls) {
        response = extract_textual_tool_calls(response);
    }
    response
}

/// Clamp a numeric knob to the provider's advertised range. An empty range
/// (min above max) means the provider rejects the knob outright; `None`
/// tells the caller to remove it.
fn clamp_param(value: f64, limit: &crate::config::ParamLimit) -> Option<f64> {
    if let (Some(min), Some(max)) = (limit.min, limit.max) {
        if min > max {
            return None;
        }
    }
    let mut v = value;
    if let Some(min) = limit.min {
        if v < min {
            v = min;
        }
    }
    if let Some(max) = limit.max {
        if v > max {
            v = max;
        }
    }
    Some(v)
}

/// Request-side preprocessing for one provider: clamp numeric knobs, drop
/// tools when unsupported, and remap aliased model names.
///
/// Operates on the provider-native request body (chat-completions or
/// generateContent shape), so the knob names are the provider's.
#[must_use]
pub fn preprocess_request(provider: &ProviderSpec, mut request: Value) -> Value {
    let Some(obj) = request.as_object_mut() else {
        return request;
    };

    // Numeric knob clamping. Removal is preferred over sending a value the
    // provider will reject outright.
    for (knob, limit) in &provider.parameter_limits {
        if let Some(value) = obj.get(knob).and_then(Value::as_f64) {
            match clamp_param(value, limit) {
                Some(clamped) if (clamped - value).abs() > f64::EPSILON => {
                    tracing::debug!(knob = %knob, from = value, to = clamped, "Clamped parameter");
                    insert_number(obj, knob, clamped);
                }
                Some(_) => {}
                None => {
                    obj.remove(knob);
                }
            }
        }
    }

    if !provider.capabilities.supports_tools {
        obj.remove("tools");
        obj.remove("tool_choice");
        obj.remove("toolConfig");
    }

    if let Some(model) = obj.get("model").and_then(Value::as_str) {
        if let Some(mapped) = provider.model_aliases.get(model) {
            let mapped = mapped.clone();
            obj.insert("model".into(), Value::String(mapped));
        }
    }

    request
}

/// Insert a float as an integer JSON number when it is whole, so clamped
/// integer knobs (e.g. `top_k`) stay integers on the wire.
fn insert_number(obj: &mut serde_json::Map<String, Value>, key: &str, value: f64) {
    #[allow(clippy::cast_possible_truncation)]
    let json = if value.fract() == 0.0 {
        Value::from(value as i64)
    } else {
        Value::from(value)
    };
    obj.insert(key.to_string(), json);
}
