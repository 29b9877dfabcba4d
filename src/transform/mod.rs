//! Bidirectional envelope transformation
//!
//! Converts between the canonical Anthropic-shaped envelope and each
//! provider family's native shape, in both directions, plus streaming
//! simulation over finished responses.

pub mod gemini;
pub mod openai;
pub mod simulate;

pub use simulate::simulate_stream;

use serde_json::Value;

use crate::error::Result;
use crate::protocol::ProtocolFamily;
use crate::protocol::messages::{CanonicalRequest, CanonicalResponse};

/// Convert a canonical request to the provider-native request body.
pub fn request_out(
    family: ProtocolFamily,
    request: &CanonicalRequest,
    target_model: &str,
) -> Result<Value> {
    match family {
        ProtocolFamily::Openai => openai::request_out(request, target_model),
        ProtocolFamily::Gemini => gemini::request_out(request, target_model),
    }
}

/// Convert a provider-native response to the canonical response.
pub fn response_in(
    family: ProtocolFamily,
    response: &Value,
    virtual_model: &str,
) -> Result<CanonicalResponse> {
    match family {
        ProtocolFamily::Openai => openai::response_in(response, virtual_model),
        ProtocolFamily::Gemini => gemini::response_in(response, virtual_model),
    }
}
