//! Error types for the gateway
//!
//! One taxonomy for the whole crate: every failure is an [`Error`] carrying
//! an [`ErrorKind`], a message, the layer it originated in, and (when an
//! upstream call was involved) the upstream HTTP status code.

use serde_json::{Value, json};
use thiserror::Error;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Error category, mapped one-to-one onto client-visible behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed configuration
    Configuration,
    /// Inbound request rejected before dispatch
    Validation,
    /// No healthy pipeline for the selected route
    Routing,
    /// Upstream 401/403
    Auth,
    /// Upstream 429
    RateLimit,
    /// Upstream 5xx
    UpstreamServer,
    /// Outbound call exceeded its timeout
    UpstreamTimeout,
    /// Malformed upstream response that could not be repaired
    UpstreamProtocol,
    /// Internal conversion failure (e.g. tool schema not representable)
    Transform,
    /// Bug
    Internal,
}

impl ErrorKind {
    /// Wire label used in the Anthropic-shaped error body.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration_error",
            Self::Validation => "invalid_request_error",
            Self::Routing => "routing_error",
            Self::Auth => "authentication_error",
            Self::RateLimit => "rate_limit_error",
            Self::UpstreamServer => "api_error",
            Self::UpstreamTimeout => "timeout_error",
            Self::UpstreamProtocol => "upstream_protocol_error",
            Self::Transform => "transform_error",
            Self::Internal => "internal_error",
        }
    }
}

/// Gateway error
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct Error {
    /// Error category
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
    /// Pipeline layer (or subsystem) the error originated in
    pub source_layer: Option<&'static str>,
    /// Request id, when the error occurred inside request processing
    pub request_id: Option<String>,
    /// Upstream HTTP status code, when an upstream call was involved
    pub upstream_status: Option<u16>,
}

impl Error {
    /// Create an error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source_layer: None,
            request_id: None,
            upstream_status: None,
        }
    }

    /// Configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    /// Inbound validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Routing error (no healthy pipeline)
    pub fn routing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Routing, message)
    }

    /// Transform error
    pub fn transform(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transform, message)
    }

    /// Upstream protocol error
    pub fn upstream_protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamProtocol, message)
    }

    /// Upstream timeout
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamTimeout, message)
    }

    /// Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Build an error from an upstream HTTP status code and body excerpt.
    #[must_use]
    pub fn from_upstream_status(status: u16, body: &str) -> Self {
        let kind = match status {
            401 | 403 => ErrorKind::Auth,
            429 => ErrorKind::RateLimit,
            400..=499 => ErrorKind::Validation,
            _ => ErrorKind::UpstreamServer,
        };
        let excerpt: String = body.chars().take(512).collect();
        Self::new(kind, format!("upstream returned {status}: {excerpt}"))
            .with_upstream_status(status)
    }

    /// Attach the originating layer.
    #[must_use]
    pub fn with_layer(mut self, layer: &'static str) -> Self {
        self.source_layer = Some(layer);
        self
    }

    /// Attach the request id.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Attach the upstream HTTP status code.
    #[must_use]
    pub fn with_upstream_status(mut self, status: u16) -> Self {
        self.upstream_status = Some(status);
        self
    }

    /// HTTP status code the front server answers with for this error.
    ///
    /// Terminal upstream errors keep their original status; everything else
    /// maps by category per the external-interface contract.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self.kind {
            ErrorKind::Validation => self.upstream_status.unwrap_or(400),
            ErrorKind::Auth => self.upstream_status.unwrap_or(401),
            ErrorKind::RateLimit => 429,
            ErrorKind::Routing | ErrorKind::UpstreamServer | ErrorKind::UpstreamProtocol => 502,
            ErrorKind::UpstreamTimeout => 504,
            ErrorKind::Configuration | ErrorKind::Transform | ErrorKind::Internal => 500,
        }
    }

    /// Render the Anthropic-shaped error body.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        json!({
            "type": "error",
            "error": {
                "type": self.kind.as_str(),
                "message": self.message,
            }
        })
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::Internal, format!("IO error: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorKind::UpstreamProtocol, format!("JSON error: {e}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::new(ErrorKind::UpstreamTimeout, format!("HTTP timeout: {e}"))
        } else {
            let status = e.status().map(|s| s.as_u16());
            let mut err = Self::new(ErrorKind::UpstreamServer, format!("HTTP error: {e}"));
            err.upstream_status = status;
            err
        }
    }
}
