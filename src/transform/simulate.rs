//! Streaming simulation
//!
//! Turns a complete canonical response into the canonical stream-event
//! sequence. Used whenever the client asked for streaming: upstream bodies
//! are buffered and repaired first, so client-visible streams are always
//! synthesised from the finished response. Text is chunked at the
//! configured size with no artificial delay; when no chunk size is set the
//! whole response goes out as a single end-of-stream burst.

use serde_json::json;

use crate::protocol::messages::{CanonicalResponse, ResponseBlock, StreamEvent};

/// Produce the Anthropic stream-event sequence for a finished response.
#[must_use]
pub fn simulate_stream(response: &CanonicalResponse, chunk_size: Option<usize>) -> Vec<StreamEvent> {
    let mut events = Vec::new();

    events.push(StreamEvent::MessageStart {
        message: json!({
            "id": response.id,
            "type": "message",
            "role": "assistant",
            "model": response.model,
            "content": [],
            "stop_reason": null,
            "stop_sequence": null,
            "usage": {"input_tokens": response.usage.input_tokens, "output_tokens": 0},
        }),
    });

    for (index, block) in response.content.iter().enumerate() {
        match block {
            ResponseBlock::Text { text } => {
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: json!({"type": "text", "text": ""}),
                });
                for chunk in chunk_text(text, chunk_size) {
                    events.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: json!({"type": "text_delta", "text": chunk}),
                    });
                }
                events.push(StreamEvent::ContentBlockStop { index });
            }
            ResponseBlock::ToolUse { id, name, input } => {
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: json!({"type": "tool_use", "id": id, "name": name, "input": {}}),
                });
                // Tool arguments are emitted as one whole input_json_delta;
                // partial JSON never reaches the client.
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: json!({"type": "input_json_delta", "partial_json": input.to_string()}),
                });
                events.push(StreamEvent::ContentBlockStop { index });
            }
        }
    }

    events.push(StreamEvent::MessageDelta {
        delta: json!({
            "stop_reason": response.stop_reason,
            "stop_sequence": response.stop_sequence,
        }),
        usage: json!({"output_tokens": response.usage.output_tokens}),
    });
    events.push(StreamEvent::MessageStop);

    events
}

/// Split text into chunks of at most `size` characters (char-boundary safe).
/// `None` yields the whole text as one chunk.
fn chunk_text(text: &str, size: Option<usize>) -> Vec<String> {
    match size {
        None | Some(0) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![text.to_string()]
            }
        }
        Some(size) => {
            let chars: Vec<char> = text.chars().collect();
            chars
                .chunks(size)
                .map(|c| c.iter().collect::<String>())
                .collect()
        }
    }
}
