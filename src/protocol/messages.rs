//! Canonical message envelope
//!
//! The Anthropic-shaped request/response types every inner pipeline layer
//! operates on. Provider-native shapes only exist between the transformer
//! layer and the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message role in the canonical envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// End-user turn
    User,
    /// Model turn
    Assistant,
    /// System instruction folded into the message list
    System,
    /// Tool result turn (internal; inbound requests carry tool results as
    /// `tool_result` blocks inside user messages)
    Tool,
}

/// One typed content block inside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text
    Text {
        /// The text payload
        text: String,
    },
    /// Inline image
    Image {
        /// Image source descriptor (base64 or URL form, passed through)
        source: Value,
    },
    /// Tool invocation requested by the model
    ToolUse {
        /// Tool-use id, referenced by a later `tool_result`
        id: String,
        /// Tool name
        name: String,
        /// JSON arguments
        input: Value,
    },
    /// Result of a prior tool invocation
    ToolResult {
        /// The `tool_use` id this result answers
        tool_use_id: String,
        /// Result payload (string or nested blocks, passed through)
        #[serde(default)]
        content: Value,
        /// Whether the tool errored
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

/// Message content: either a bare string or a list of typed blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Shorthand string form
    Text(String),
    /// Full block form
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Flatten to a single string when every block is text.
    ///
    /// Returns `None` when image or tool content requires preserving block
    /// structure.
    #[must_use]
    pub fn as_flat_text(&self) -> Option<String> {
        match self {
            Self::Text(s) => Some(s.clone()),
            Self::Blocks(blocks) => {
                let mut out = String::new();
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            if !out.is_empty() {
                                out.push('\n');
                            }
                            out.push_str(text);
                        }
                        _ => return None,
                    }
                }
                Some(out)
            }
        }
    }

    /// Approximate character length of the content, for routing heuristics.
    #[must_use]
    pub fn char_len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => text.len(),
                    ContentBlock::ToolUse { input, .. } => input.to_string().len(),
                    ContentBlock::ToolResult { content, .. } => content.to_string().len(),
                    ContentBlock::Image { .. } => 0,
                })
                .sum(),
        }
    }
}

/// One message in the canonical request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Speaker role
    pub role: Role,
    /// Message content
    pub content: MessageContent,
}

/// Tool declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name
    pub name: String,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON-schema parameters
    pub input_schema: Value,
}

/// Tool-choice hint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    /// Model decides
    Auto,
    /// Model must call some tool
    Any,
    /// Model must call the named tool
    Tool {
        /// Required tool name
        name: String,
    },
}

/// Request metadata bag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestMetadata {
    /// Client-supplied user id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Conversation id (header or metadata)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Request id (header or metadata)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Session id (header or metadata)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Background-tier hint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background: Option<bool>,
    /// Extended-thinking hint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<bool>,
    /// Web-search hint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<bool>,
    /// Scheduling priority: "high" | "medium" | "low"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

/// The canonical request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRequest {
    /// Virtual model name the client wrote
    pub model: String,
    /// Required output token budget
    pub max_tokens: u32,
    /// Ordered message sequence
    pub messages: Vec<Message>,
    /// Optional system prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Tool declarations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    /// Tool-choice hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Nucleus sampling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Top-k sampling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    /// Stop sequences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    /// Streaming flag
    #[serde(default)]
    pub stream: bool,
    /// Metadata bag
    #[serde(default)]
    pub metadata: RequestMetadata,
}

impl CanonicalRequest {
    /// Total character count across all message content.
    #[must_use]
    pub fn content_char_len(&self) -> usize {
        let system = self.system.as_ref().map_or(0, String::len);
        system
            + self
                .messages
                .iter()
                .map(|m| m.content.char_len())
                .sum::<usize>()
    }

    /// Rough token estimate (4 chars per token) for routing heuristics.
    #[must_use]
    pub fn estimated_tokens(&self) -> usize {
        self.content_char_len() / 4
    }
}

/// Stop reason of a completed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of turn
    EndTurn,
    /// Output token budget exhausted
    MaxTokens,
    /// A stop sequence matched
    StopSequence,
    /// The model requested a tool invocation
    ToolUse,
}

/// Token usage accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens consumed
    pub input_tokens: u64,
    /// Completion tokens produced
    pub output_tokens: u64,
}

/// A response content block: text or tool use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBlock {
    /// Text block
    Text {
        /// The text payload
        text: String,
    },
    /// Tool invocation
    ToolUse {
        /// Tool-use id
        id: String,
        /// Tool name
        name: String,
        /// JSON arguments
        input: Value,
    },
}

/// The canonical response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalResponse {
    /// Message id
    pub id: String,
    /// Always "message"
    #[serde(rename = "type")]
    pub kind: String,
    /// Always "assistant"
    pub role: String,
    /// Echo of the virtual model name
    pub model: String,
    /// Ordered content blocks
    pub content: Vec<ResponseBlock>,
    /// Why generation stopped
    pub stop_reason: StopReason,
    /// Which stop sequence matched, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
    /// Token accounting
    pub usage: Usage,
}

impl CanonicalResponse {
    /// Construct a response with the fixed type/role fields filled in.
    #[must_use]
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: "message".to_string(),
            role: "assistant".to_string(),
            model: model.into(),
            content: Vec::new(),
            stop_reason: StopReason::EndTurn,
            stop_sequence: None,
            usage: Usage::default(),
        }
    }

    /// Whether any block is a tool use.
    #[must_use]
    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ResponseBlock::ToolUse { .. }))
    }

    /// Enforce the stop-reason/tool-use invariant after assembly: a
    /// `tool_use` stop reason requires at least one tool block and vice
    /// versa.
    pub fn reconcile_stop_reason(&mut self) {
        if self.has_tool_use() {
            self.stop_reason = StopReason::ToolUse;
        } else if self.stop_reason == StopReason::ToolUse {
            self.stop_reason = StopReason::EndTurn;
        }
    }
}

/// Canonical streaming events in the Anthropic SSE wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Opens the message
    MessageStart {
        /// Message skeleton (empty content)
        message: Value,
    },
    /// Opens one content block
    ContentBlockStart {
        /// Block index
        index: usize,
        /// The opened block (empty text / empty input)
        content_block: Value,
    },
    /// Incremental content for one block
    ContentBlockDelta {
        /// Block index
        index: usize,
        /// `text_delta` or `input_json_delta`
        delta: Value,
    },
    /// Closes one content block
    ContentBlockStop {
        /// Block index
        index: usize,
    },
    /// Final stop reason and usage
    MessageDelta {
        /// `{stop_reason, stop_sequence}`
        delta: Value,
        /// Usage accounting
        usage: Value,
    },
    /// Closes the message
    MessageStop,
}

impl StreamEvent {
    /// SSE event name for this event.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::MessageStart { .. } => "message_start",
            Self::ContentBlockStart { .. } => "content_block_start",
            Self::ContentBlockDelta { .. } => "content_block_delta",
            Self::ContentBlockStop { .. } => "content_block_stop",
            Self::MessageDelta { .. } => "message_delta",
            Self::MessageStop => "message_stop",
        }
    }
}
