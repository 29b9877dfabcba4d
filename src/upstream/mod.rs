//! Outbound HTTP execution
//!
//! The server layer's engine: key selection, auth headers, the actual
//! reqwest call with per-call timeout and cancellation, and buffering of
//! streamed upstream bodies into complete provider-native responses.

pub mod keys;

pub use keys::{KeyRing, KeySnapshot, RotationStrategy};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::header;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::ProtocolFamily;
use crate::routing::ProviderSpec;

/// Cooldown applied to a key after an upstream 429.
const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(60);

/// One outbound call, fully described.
#[derive(Debug)]
pub struct UpstreamCall<'a> {
    /// Provider name (key-ring lookup)
    pub provider: &'a str,
    /// Wire family (auth style, SSE reassembly)
    pub family: ProtocolFamily,
    /// Full endpoint URL
    pub endpoint: &'a str,
    /// Provider-native request body
    pub body: &'a Value,
    /// Whether the upstream call streams
    pub stream: bool,
    /// Per-call timeout
    pub timeout: Duration,
    /// Request id for log correlation
    pub request_id: &'a str,
}

/// Shared outbound HTTP executor: one pooled client, one key ring per
/// provider.
pub struct HttpExecutor {
    client: reqwest::Client,
    rings: DashMap<String, Arc<KeyRing>>,
}

impl HttpExecutor {
    /// Build the executor and key rings from the provider catalogue.
    pub fn new(providers: &HashMap<String, ProviderSpec>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| Error::internal(format!("HTTP client build failed: {e}")))?;

        let rings = DashMap::new();
        for (name, spec) in providers {
            rings.insert(
                name.clone(),
                Arc::new(KeyRing::new(
                    name,
                    spec.api_keys.clone(),
                    RotationStrategy::RoundRobin,
                    RATE_LIMIT_COOLDOWN,
                )),
            );
        }
        Ok(Self { client, rings })
    }

    /// Key ring of a provider, for the operator reset surface.
    #[must_use]
    pub fn key_ring(&self, provider: &str) -> Option<Arc<KeyRing>> {
        self.rings.get(provider).map(|r| Arc::clone(&r))
    }

    /// Execute the call and return the complete provider-native response.
    ///
    /// Streamed upstream bodies are buffered and reassembled here — the
    /// compatibility layer needs the whole body before any fix can run.
    pub async fn execute(&self, call: &UpstreamCall<'_>, cancel: &CancellationToken) -> Result<Value> {
        let ring = self
            .rings
            .get(call.provider)
            .map(|r| Arc::clone(&r))
            .ok_or_else(|| Error::internal(format!("no key ring for provider {}", call.provider)))?;
        let (key_index, key) = ring.acquire()?;

        let mut request = self
            .client
            .post(call.endpoint)
            .timeout(call.timeout)
            .header(header::CONTENT_TYPE, "application/json")
            .json(call.body);

        request = match call.family {
            ProtocolFamily::Openai => request.bearer_auth(&key),
            ProtocolFamily::Gemini => request.header("x-goog-api-key", &key),
        };
        if call.stream {
            request = request.header(header::ACCEPT, "text/event-stream");
        }

        tracing::debug!(
            request_id = %call.request_id,
            provider = %call.provider,
            endpoint = %call.endpoint,
            stream = call.stream,
            key_index,
            "Outbound upstream call"
        );

        let send = request.send();
        let response = tokio::select! {
            () = cancel.cancelled() => {
                return Err(Error::internal("request cancelled during upstream call")
                    .with_request_id(call.request_id));
            }
            result = send => result.map_err(|e| {
                let err = Error::from(e);
                ring.report_failure(key_index, err.upstream_status);
                err
            })?,
        };

        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let body = tokio::select! {
            () = cancel.cancelled() => {
                return Err(Error::internal("request cancelled while reading upstream body")
                    .with_request_id(call.request_id));
            }
            text = response.text() => text.map_err(|e| {
                let err = Error::from(e);
                ring.report_failure(key_index, err.upstream_status);
                err
            })?,
        };

        if !status.is_success() {
            ring.report_failure(key_index, Some(status.as_u16()));
            return Err(Error::from_upstream_status(status.as_u16(), &body));
        }
        ring.report_success(key_index);

        if content_type.contains("text/event-stream") || body.trim_start().starts_with("data:") {
            call.family.aggregate_sse(&body)
        } else {
            serde_json::from_str(&body)
                .map_err(|e| Error::upstream_protocol(format!("upstream body is not JSON: {e}")))
        }
    }
}
