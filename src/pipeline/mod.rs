//! Pipelines — the six-layer request-processing chain
//!
//! A [`Pipeline`] is a constructed, stateless-per-request assembly of six
//! layer objects (client, router, transformer, protocol, compatibility,
//! server). Requests flow through the layers in order; responses flow back
//! through the same layers in reverse. Pipelines are built once at startup
//! by the [`assembler`] from [`blueprint`]s and reused for the life of the
//! process.

pub mod assembler;
pub mod blueprint;
pub mod layers;

pub use assembler::{AssemblyReport, PipelineAssembler};
pub use blueprint::{LayerDescriptor, PipelineBlueprint, blueprints_from_table};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::messages::{CanonicalRequest, CanonicalResponse};
use crate::trace::TraceWriter;

/// Processing direction through the layer chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client → upstream
    Request,
    /// Upstream → client
    Response,
}

impl Direction {
    /// Label used in debug traces.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
        }
    }
}

/// The six layer kinds, in fixed chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LayerKind {
    /// Inbound validation (1)
    Client,
    /// Routing annotation (2)
    Router,
    /// Canonical ⇄ provider-native conversion (3)
    Transformer,
    /// HTTP dialect of the target family (4)
    Protocol,
    /// Provider quirk handling (5)
    Compatibility,
    /// Outbound HTTP execution (6)
    Server,
}

impl LayerKind {
    /// All six kinds in chain order.
    pub const ORDER: [Self; 6] = [
        Self::Client,
        Self::Router,
        Self::Transformer,
        Self::Protocol,
        Self::Compatibility,
        Self::Server,
    ];

    /// Layer name used in traces and error attribution.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Router => "router",
            Self::Transformer => "transformer",
            Self::Protocol => "protocol",
            Self::Compatibility => "compatibility",
            Self::Server => "server",
        }
    }
}

/// The envelope passed between layers.
#[derive(Debug, Clone)]
pub enum Envelope {
    /// Canonical request (layers 1–3, request direction)
    CanonicalRequest(CanonicalRequest),
    /// Provider-native request body (layers 3–6, request direction)
    ProviderRequest(serde_json::Value),
    /// Provider-native response body (layers 6–3, response direction)
    ProviderResponse(serde_json::Value),
    /// Canonical response (layers 3–1, response direction)
    CanonicalResponse(CanonicalResponse),
}

impl Envelope {
    /// Debug-trace payload: the envelope's JSON content with only primitive
    /// fields (no back-references to owning structures).
    #[must_use]
    pub fn trace_payload(&self) -> serde_json::Value {
        match self {
            Self::CanonicalRequest(r) => serde_json::to_value(r).unwrap_or_default(),
            Self::ProviderRequest(v) | Self::ProviderResponse(v) => v.clone(),
            Self::CanonicalResponse(r) => serde_json::to_value(r).unwrap_or_default(),
        }
    }
}

/// Per-request context threaded through the layer chain.
///
/// Carries explicit dependencies that would otherwise live in globals:
/// routing annotations, the cancellation signal, and the trace writer.
#[derive(Clone)]
pub struct LayerContext {
    /// Request id
    pub request_id: String,
    /// Virtual model name the client wrote
    pub virtual_model: String,
    /// Route name chosen by the runtime router
    pub route: String,
    /// Concrete model at the provider
    pub target_model: String,
    /// Provider name
    pub provider: String,
    /// Whether the client asked for streaming
    pub client_stream: bool,
    /// Whether the upstream call will stream (set by the protocol layer)
    pub upstream_stream: bool,
    /// Endpoint URL for this call (set by the protocol layer)
    pub endpoint: String,
    /// Cancellation signal tied to the request lifetime
    pub cancel: CancellationToken,
    /// Debug trace writer, when debug is enabled
    pub trace: Option<Arc<TraceWriter>>,
    /// Upstream HTTP status observed by the server layer
    pub upstream_status: Option<u16>,
}

impl LayerContext {
    /// Create a context for one request.
    #[must_use]
    pub fn new(request_id: impl Into<String>, virtual_model: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            virtual_model: virtual_model.into(),
            route: String::new(),
            target_model: String::new(),
            provider: String::new(),
            client_stream: false,
            upstream_stream: false,
            endpoint: String::new(),
            cancel: CancellationToken::new(),
            trace: None,
            upstream_status: None,
        }
    }
}

impl fmt::Debug for LayerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerContext")
            .field("request_id", &self.request_id)
            .field("virtual_model", &self.virtual_model)
            .field("route", &self.route)
            .field("target_model", &self.target_model)
            .field("provider", &self.provider)
            .field("client_stream", &self.client_stream)
            .finish_non_exhaustive()
    }
}

/// The layer contract: one polymorphic processing step.
#[async_trait]
pub trait PipelineLayer: Send + Sync {
    /// Which of the six kinds this layer is.
    fn kind(&self) -> LayerKind;

    /// Process the envelope in the given direction.
    async fn process(
        &self,
        envelope: Envelope,
        direction: Direction,
        ctx: &mut LayerContext,
    ) -> Result<Envelope>;
}

/// Pipeline lifecycle status. Destroyed pipelines are never reinstated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineStatus {
    /// Accepting requests
    Healthy,
    /// Cooling down after a recoverable failure
    TemporarilyBlocked,
    /// Permanently excluded after a non-recoverable failure
    Blacklisted,
    /// Removed from its route entirely
    Destroyed,
}

impl PipelineStatus {
    /// Wire label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::TemporarilyBlocked => "temporarily-blocked",
            Self::Blacklisted => "blacklisted",
            Self::Destroyed => "destroyed",
        }
    }
}

/// A constructed six-layer pipeline for one (route, provider, model) triple.
pub struct Pipeline {
    /// Pipeline id: `pipeline_{provider}_{model}`
    pub id: String,
    /// Route that first referenced this pipeline
    pub route: String,
    /// Provider name
    pub provider: String,
    /// Concrete model
    pub model: String,
    /// Canonical (non-streaming) endpoint URL
    pub endpoint: String,
    /// Per-request wall-clock timeout
    pub timeout: Duration,
    layers: Vec<Box<dyn PipelineLayer>>,
    status: RwLock<PipelineStatus>,
}

impl Pipeline {
    /// Construct a pipeline from its six layers.
    ///
    /// # Errors
    ///
    /// Rejects layer lists that are not exactly the six kinds in chain
    /// order; presence of every layer is a correctness invariant even when
    /// a layer is a no-op for the provider.
    pub fn new(
        blueprint: &PipelineBlueprint,
        layers: Vec<Box<dyn PipelineLayer>>,
        initial_status: PipelineStatus,
    ) -> Result<Self> {
        let kinds: Vec<LayerKind> = layers.iter().map(|l| l.kind()).collect();
        if kinds != LayerKind::ORDER {
            return Err(Error::internal(format!(
                "pipeline {} layer order invalid: {kinds:?}",
                blueprint.id
            )));
        }
        Ok(Self {
            id: blueprint.id.clone(),
            route: blueprint.route.clone(),
            provider: blueprint.provider.clone(),
            model: blueprint.model.clone(),
            endpoint: blueprint.endpoint.clone(),
            timeout: blueprint.timeout,
            layers,
            status: RwLock::new(initial_status),
        })
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> PipelineStatus {
        *self.status.read()
    }

    /// Apply a status transition, enforcing monotonicity in the destroy
    /// direction: healthy ↔ temporarily-blocked freely; any → blacklisted →
    /// destroyed; no backward transition out of blacklisted except via
    /// [`Pipeline::reset`], none at all out of destroyed.
    pub fn set_status(&self, new: PipelineStatus) {
        let mut status = self.status.write();
        if transition_allowed(*status, new) && *status != new {
            tracing::info!(
                pipeline = %self.id,
                from = %status.as_str(),
                to = %new.as_str(),
                "Pipeline status transition"
            );
            *status = new;
        }
    }

    /// Operator reset: restore a blacklisted or blocked pipeline to healthy.
    /// Destroyed pipelines are never reinstated.
    ///
    /// Returns whether the reset took effect.
    pub fn reset(&self) -> bool {
        let mut status = self.status.write();
        match *status {
            PipelineStatus::Destroyed => false,
            PipelineStatus::Healthy => true,
            _ => {
                tracing::info!(pipeline = %self.id, "Pipeline reset to healthy");
                *status = PipelineStatus::Healthy;
                true
            }
        }
    }

    /// Run one request through all six layers and back.
    pub async fn execute(
        &self,
        request: CanonicalRequest,
        ctx: &mut LayerContext,
    ) -> Result<CanonicalResponse> {
        let mut envelope = Envelope::CanonicalRequest(request);

        for layer in &self.layers {
            envelope = self.step(layer.as_ref(), envelope, Direction::Request, ctx).await?;
        }
        for layer in self.layers.iter().rev() {
            envelope = self.step(layer.as_ref(), envelope, Direction::Response, ctx).await?;
        }

        match envelope {
            Envelope::CanonicalResponse(response) => Ok(response),
            other => Err(Error::internal(format!(
                "pipeline {} finished with a non-canonical envelope: {other:?}",
                self.id
            ))),
        }
    }

    async fn step(
        &self,
        layer: &dyn PipelineLayer,
        envelope: Envelope,
        direction: Direction,
        ctx: &mut LayerContext,
    ) -> Result<Envelope> {
        if ctx.cancel.is_cancelled() {
            return Err(Error::internal("request cancelled").with_request_id(ctx.request_id.clone()));
        }
        let kind = layer.kind();
        tracing::trace!(
            pipeline = %self.id,
            layer = %kind.as_str(),
            direction = %direction.as_str(),
            "Layer step"
        );
        let out = layer
            .process(envelope, direction, ctx)
            .await
            .map_err(|e| attribute(e, kind, &ctx.request_id))?;
        if let Some(trace) = &ctx.trace {
            trace.write(&ctx.request_id, kind.as_str(), direction.as_str(), &out.trace_payload());
        }
        Ok(out)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Status transition table: monotone in the destroy direction.
fn transition_allowed(from: PipelineStatus, to: PipelineStatus) -> bool {
    match (from, to) {
        (PipelineStatus::Destroyed, _) => false,
        (PipelineStatus::Blacklisted, PipelineStatus::Destroyed) => true,
        (PipelineStatus::Blacklisted, _) => false,
        (_, _) => true,
    }
}

fn attribute(mut error: Error, kind: LayerKind, request_id: &str) -> Error {
    if error.source_layer.is_none() {
        error.source_layer = Some(kind.as_str());
    }
    if error.request_id.is_none() {
        error.request_id = Some(request_id.to_string());
    }
    error
}
