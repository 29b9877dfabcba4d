//! SSE response writing
//!
//! Streams canonical events to the client in the Anthropic wire form. A
//! producer task writes events into a bounded channel; the HTTP response
//! writer is the sole consumer. Events for one request are strictly
//! ordered and contiguous.

use std::convert::Infallible;

use async_stream::stream;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::protocol::messages::StreamEvent;

/// Bounded channel size between the event producer and the writer.
const EVENT_BUFFER: usize = 64;

/// Build the SSE response for a finished event sequence.
#[must_use]
pub fn sse_response(events: Vec<StreamEvent>) -> Response {
    let (tx, rx) = mpsc::channel::<StreamEvent>(EVENT_BUFFER);

    tokio::spawn(async move {
        for event in events {
            if tx.send(event).await.is_err() {
                // Writer went away (client disconnect); stop producing.
                break;
            }
        }
    });

    Sse::new(event_stream(rx))
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn event_stream(
    mut rx: mpsc::Receiver<StreamEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream! {
        while let Some(event) = rx.recv().await {
            yield Ok(to_sse_event(&event));
        }
    }
}

/// Serialize one canonical event as `event: NAME` + `data: {json}`.
fn to_sse_event(event: &StreamEvent) -> Event {
    Event::default()
        .event(event.event_name())
        .data(serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string()))
}

/// A failed streaming request still answers over SSE: a single final
/// `error` event, then the stream closes cleanly.
#[must_use]
pub fn sse_error_response(error: &Error) -> Response {
    let body = error.to_wire();
    let stream = stream! {
        yield Ok::<_, Infallible>(
            Event::default()
                .event("error")
                .data(body.to_string()),
        );
    };
    Sse::new(stream).into_response()
}
