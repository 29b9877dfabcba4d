//! Wire protocol dialects and the canonical envelope
//!
//! `messages` defines the Anthropic-shaped canonical types; `openai` and
//! `gemini` speak the HTTP dialect of each upstream family.

pub mod gemini;
pub mod messages;
pub mod openai;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Upstream protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolFamily {
    /// OpenAI chat completions (also spoken by LMStudio, Ollama, vLLM, …)
    Openai,
    /// Google Gemini generateContent
    Gemini,
}

impl ProtocolFamily {
    /// Parse the config-file protocol label. Local-server variants map onto
    /// the chat-completions family.
    pub fn parse(label: &str) -> Result<Self> {
        match label {
            "openai" | "openai-compatible" | "lmstudio" | "ollama" => Ok(Self::Openai),
            "gemini" => Ok(Self::Gemini),
            other => Err(Error::config(format!("unknown protocol family: {other}"))),
        }
    }

    /// Wire label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::Gemini => "gemini",
        }
    }

    /// Build the endpoint URL for this family.
    #[must_use]
    pub fn endpoint(self, base_url: &str, model: &str, stream: bool) -> String {
        match self {
            Self::Openai => openai::endpoint(base_url),
            Self::Gemini => gemini::endpoint(base_url, model, stream),
        }
    }

    /// Reassemble a complete provider-native response from an SSE body.
    pub fn aggregate_sse(self, body: &str) -> Result<serde_json::Value> {
        match self {
            Self::Openai => openai::aggregate_sse(body),
            Self::Gemini => gemini::aggregate_sse(body),
        }
    }
}
