//! The six layer implementations
//!
//! Each layer implements [`PipelineLayer`] and handles both directions.
//! Layers that are no-ops in one direction still exist in every pipeline;
//! presence is a correctness invariant.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::compat;
use crate::error::{Error, Result};
use crate::protocol::messages::{CanonicalRequest, ContentBlock, MessageContent, Role};
use crate::transform;
use crate::upstream::{HttpExecutor, UpstreamCall};

use super::blueprint::{
    ClientLayerConfig, CompatibilityLayerConfig, ProtocolLayerConfig, RouterLayerConfig,
    ServerLayerConfig, TransformerLayerConfig,
};
use super::{Direction, Envelope, LayerContext, LayerKind, PipelineLayer};

/// Layer 1 — inbound validation and final response checks.
pub struct ClientLayer {
    config: ClientLayerConfig,
}

impl ClientLayer {
    /// Create the layer.
    #[must_use]
    pub fn new(config: ClientLayerConfig) -> Self {
        Self { config }
    }

    fn validate_request(&self, request: &CanonicalRequest) -> Result<()> {
        if request.model.is_empty() {
            return Err(Error::validation("model is required"));
        }
        if request.max_tokens == 0 || request.max_tokens > self.config.max_output_tokens {
            return Err(Error::validation(format!(
                "max_tokens must be between 1 and {}",
                self.config.max_output_tokens
            )));
        }
        if request.messages.is_empty() {
            return Err(Error::validation("messages must not be empty"));
        }
        if request.messages.len() > self.config.max_messages {
            return Err(Error::validation(format!(
                "messages exceed the limit of {}",
                self.config.max_messages
            )));
        }
        if request.tools.len() > self.config.max_tools {
            return Err(Error::validation(format!(
                "tools exceed the limit of {}",
                self.config.max_tools
            )));
        }
        if request.stop_sequences.len() > self.config.max_stop_sequences {
            return Err(Error::validation(format!(
                "stop_sequences exceed the limit of {}",
                self.config.max_stop_sequences
            )));
        }
        if let Some(t) = request.temperature {
            if !(0.0..=1.0).contains(&t) {
                return Err(Error::validation("temperature must be within 0..1"));
            }
        }
        if let Some(p) = request.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(Error::validation("top_p must be within 0..1"));
            }
        }

        let first_role = request.messages[0].role;
        if !matches!(first_role, Role::User | Role::System) {
            return Err(Error::validation("first message role must be user or system"));
        }

        // Tool results must reference a previously emitted tool_use id.
        let mut seen_tool_ids: HashSet<&str> = HashSet::new();
        for message in &request.messages {
            if let MessageContent::Blocks(blocks) = &message.content {
                for block in blocks {
                    match block {
                        ContentBlock::ToolUse { id, .. } => {
                            seen_tool_ids.insert(id);
                        }
                        ContentBlock::ToolResult { tool_use_id, .. } => {
                            if !seen_tool_ids.contains(tool_use_id.as_str()) {
                                return Err(Error::validation(format!(
                                    "tool_result references unknown tool_use id `{tool_use_id}`"
                                )));
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PipelineLayer for ClientLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Client
    }

    async fn process(
        &self,
        envelope: Envelope,
        direction: Direction,
        _ctx: &mut LayerContext,
    ) -> Result<Envelope> {
        match (direction, envelope) {
            (Direction::Request, Envelope::CanonicalRequest(request)) => {
                self.validate_request(&request)?;
                Ok(Envelope::CanonicalRequest(request))
            }
            (Direction::Response, Envelope::CanonicalResponse(mut response)) => {
                response.reconcile_stop_reason();
                Ok(Envelope::CanonicalResponse(response))
            }
            (_, other) => Err(unexpected_envelope(LayerKind::Client, &other)),
        }
    }
}

/// Layer 2 — routing annotation.
///
/// Stamps the routing decision into the context on the way out and echoes
/// the virtual model name on the way back.
pub struct RouterLayer {
    config: RouterLayerConfig,
}

impl RouterLayer {
    /// Create the layer.
    #[must_use]
    pub fn new(config: RouterLayerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PipelineLayer for RouterLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Router
    }

    async fn process(
        &self,
        envelope: Envelope,
        direction: Direction,
        ctx: &mut LayerContext,
    ) -> Result<Envelope> {
        match (direction, envelope) {
            (Direction::Request, Envelope::CanonicalRequest(request)) => {
                ctx.route = self.config.route.clone();
                ctx.provider = self.config.provider.clone();
                ctx.target_model = self.config.target_model.clone();
                ctx.client_stream = request.stream;
                tracing::debug!(
                    request_id = %ctx.request_id,
                    route = %ctx.route,
                    provider = %ctx.provider,
                    model = %ctx.target_model,
                    "Routing decision recorded"
                );
                Ok(Envelope::CanonicalRequest(request))
            }
            (Direction::Response, Envelope::CanonicalResponse(mut response)) => {
                response.model = ctx.virtual_model.clone();
                Ok(Envelope::CanonicalResponse(response))
            }
            (_, other) => Err(unexpected_envelope(LayerKind::Router, &other)),
        }
    }
}

/// Layer 3 — canonical ⇄ provider-native conversion.
pub struct TransformerLayer {
    config: TransformerLayerConfig,
}

impl TransformerLayer {
    /// Create the layer.
    #[must_use]
    pub fn new(config: TransformerLayerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PipelineLayer for TransformerLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Transformer
    }

    async fn process(
        &self,
        envelope: Envelope,
        direction: Direction,
        ctx: &mut LayerContext,
    ) -> Result<Envelope> {
        match (direction, envelope) {
            (Direction::Request, Envelope::CanonicalRequest(request)) => {
                if !self.config.known_models.iter().any(|m| m == &self.config.target_model) {
                    return Err(Error::transform(format!(
                        "InvalidModel: provider has no mapping for `{}`",
                        self.config.target_model
                    )));
                }
                let body = transform::request_out(
                    self.config.family,
                    &request,
                    &self.config.target_model,
                )?;
                Ok(Envelope::ProviderRequest(body))
            }
            (Direction::Response, Envelope::ProviderResponse(body)) => {
                let response =
                    transform::response_in(self.config.family, &body, &ctx.virtual_model)?;
                Ok(Envelope::CanonicalResponse(response))
            }
            (_, other) => Err(unexpected_envelope(LayerKind::Transformer, &other)),
        }
    }
}

/// Layer 4 — HTTP dialect of the target family.
///
/// Decides the endpoint URL and whether the upstream call streams; on the
/// way back, checks the repaired response satisfies the family's envelope
/// invariants.
pub struct ProtocolLayer {
    config: ProtocolLayerConfig,
}

impl ProtocolLayer {
    /// Create the layer.
    #[must_use]
    pub fn new(config: ProtocolLayerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PipelineLayer for ProtocolLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Protocol
    }

    async fn process(
        &self,
        envelope: Envelope,
        direction: Direction,
        ctx: &mut LayerContext,
    ) -> Result<Envelope> {
        match (direction, envelope) {
            (Direction::Request, Envelope::ProviderRequest(body)) => {
                if !body.is_object() {
                    return Err(Error::internal("provider request body must be an object"));
                }
                ctx.upstream_stream = ctx.client_stream && self.config.supports_streaming;
                ctx.endpoint = self.config.family.endpoint(
                    &self.config.base_url,
                    &self.config.model,
                    ctx.upstream_stream,
                );
                Ok(Envelope::ProviderRequest(body))
            }
            (Direction::Response, Envelope::ProviderResponse(body)) => {
                // Post-repair envelope check; anything still missing here is
                // beyond fixing.
                let well_formed = match self.config.family {
                    crate::protocol::ProtocolFamily::Openai => {
                        body.get("choices").is_some_and(serde_json::Value::is_array)
                    }
                    crate::protocol::ProtocolFamily::Gemini => {
                        body.get("candidates").is_some_and(serde_json::Value::is_array)
                    }
                };
                if !well_formed {
                    return Err(Error::upstream_protocol(
                        "upstream response envelope is malformed beyond repair",
                    ));
                }
                Ok(Envelope::ProviderResponse(body))
            }
            (_, other) => Err(unexpected_envelope(LayerKind::Protocol, &other)),
        }
    }
}

/// Layer 5 — provider quirk handling.
pub struct CompatibilityLayer {
    config: CompatibilityLayerConfig,
}

impl CompatibilityLayer {
    /// Create the layer.
    #[must_use]
    pub fn new(config: CompatibilityLayerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PipelineLayer for CompatibilityLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Compatibility
    }

    async fn process(
        &self,
        envelope: Envelope,
        direction: Direction,
        _ctx: &mut LayerContext,
    ) -> Result<Envelope> {
        match (direction, envelope) {
            (Direction::Request, Envelope::ProviderRequest(body)) => {
                let body = compat::preprocess_request(&self.config.provider, body);
                Ok(Envelope::ProviderRequest(body))
            }
            (Direction::Response, Envelope::ProviderResponse(body)) => {
                let body = compat::apply_fixes(&self.config.provider.response_fixes, body);
                Ok(Envelope::ProviderResponse(body))
            }
            (_, other) => Err(unexpected_envelope(LayerKind::Compatibility, &other)),
        }
    }
}

/// Layer 6 — outbound HTTP execution.
///
/// The request-direction step performs the actual upstream call and turns
/// the envelope around: the provider request goes in, the (buffered,
/// reassembled) provider response comes out. The response-direction step is
/// a pass-through.
pub struct ServerLayer {
    config: ServerLayerConfig,
    executor: Arc<HttpExecutor>,
}

impl ServerLayer {
    /// Create the layer.
    #[must_use]
    pub fn new(config: ServerLayerConfig, executor: Arc<HttpExecutor>) -> Self {
        Self { config, executor }
    }
}

#[async_trait]
impl PipelineLayer for ServerLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Server
    }

    async fn process(
        &self,
        envelope: Envelope,
        direction: Direction,
        ctx: &mut LayerContext,
    ) -> Result<Envelope> {
        match (direction, envelope) {
            (Direction::Request, Envelope::ProviderRequest(body)) => {
                let call = UpstreamCall {
                    provider: &self.config.provider,
                    family: self.config.family,
                    endpoint: &ctx.endpoint,
                    body: &body,
                    stream: ctx.upstream_stream,
                    timeout: self.config.timeout,
                    request_id: &ctx.request_id,
                };
                let response = self.executor.execute(&call, &ctx.cancel).await;
                match response {
                    Ok(value) => Ok(Envelope::ProviderResponse(value)),
                    Err(e) => {
                        ctx.upstream_status = e.upstream_status;
                        Err(e)
                    }
                }
            }
            (Direction::Response, envelope @ Envelope::ProviderResponse(_)) => Ok(envelope),
            (_, other) => Err(unexpected_envelope(LayerKind::Server, &other)),
        }
    }
}

fn unexpected_envelope(kind: LayerKind, envelope: &Envelope) -> Error {
    let label = match envelope {
        Envelope::CanonicalRequest(_) => "canonical request",
        Envelope::ProviderRequest(_) => "provider request",
        Envelope::ProviderResponse(_) => "provider response",
        Envelope::CanonicalResponse(_) => "canonical response",
    };
    Error::internal(format!("{} layer received unexpected {label} envelope", kind.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolFamily;
    use crate::protocol::messages::{Message, RequestMetadata};
    use serde_json::json;

    fn request(messages: Vec<Message>) -> CanonicalRequest {
        CanonicalRequest {
            model: "default".into(),
            max_tokens: 50,
            messages,
            system: None,
            tools: Vec::new(),
            tool_choice: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: Vec::new(),
            stream: false,
            metadata: RequestMetadata::default(),
        }
    }

    fn user(text: &str) -> Message {
        Message {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    fn assistant_tool_use(id: &str) -> Message {
        Message {
            role: Role::Assistant,
            content: MessageContent::Blocks(vec![ContentBlock::ToolUse {
                id: id.into(),
                name: "f".into(),
                input: json!({}),
            }]),
        }
    }

    fn ctx() -> LayerContext {
        LayerContext::new("req-1", "default")
    }

    #[tokio::test]
    async fn client_layer_accepts_a_valid_request() {
        let layer = ClientLayer::new(ClientLayerConfig::default());
        let out = layer
            .process(
                Envelope::CanonicalRequest(request(vec![user("hi")])),
                Direction::Request,
                &mut ctx(),
            )
            .await;
        assert!(out.is_ok());
    }

    #[tokio::test]
    async fn client_layer_rejects_assistant_first_message() {
        let layer = ClientLayer::new(ClientLayerConfig::default());
        let bad = request(vec![Message {
            role: Role::Assistant,
            content: MessageContent::Text("hello".into()),
        }]);
        let err = layer
            .process(Envelope::CanonicalRequest(bad), Direction::Request, &mut ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn client_layer_rejects_zero_max_tokens() {
        let layer = ClientLayer::new(ClientLayerConfig::default());
        let mut bad = request(vec![user("hi")]);
        bad.max_tokens = 0;
        let err = layer
            .process(Envelope::CanonicalRequest(bad), Direction::Request, &mut ctx())
            .await
            .unwrap_err();
        assert!(err.message.contains("max_tokens"));
    }

    #[tokio::test]
    async fn client_layer_rejects_orphan_tool_result() {
        let layer = ClientLayer::new(ClientLayerConfig::default());
        let bad = request(vec![
            user("hi"),
            Message {
                role: Role::User,
                content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                    tool_use_id: "toolu_missing".into(),
                    content: json!("x"),
                    is_error: None,
                }]),
            },
        ]);
        let err = layer
            .process(Envelope::CanonicalRequest(bad), Direction::Request, &mut ctx())
            .await
            .unwrap_err();
        assert!(err.message.contains("toolu_missing"));
    }

    #[tokio::test]
    async fn client_layer_accepts_tool_result_after_tool_use() {
        let layer = ClientLayer::new(ClientLayerConfig::default());
        let good = request(vec![
            user("hi"),
            assistant_tool_use("toolu_1"),
            Message {
                role: Role::User,
                content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                    tool_use_id: "toolu_1".into(),
                    content: json!("42"),
                    is_error: None,
                }]),
            },
        ]);
        let out = layer
            .process(Envelope::CanonicalRequest(good), Direction::Request, &mut ctx())
            .await;
        assert!(out.is_ok());
    }

    #[tokio::test]
    async fn router_layer_stamps_the_context() {
        let layer = RouterLayer::new(RouterLayerConfig {
            route: "default".into(),
            provider: "p1".into(),
            target_model: "m1".into(),
        });
        let mut ctx = ctx();
        let mut req = request(vec![user("hi")]);
        req.stream = true;
        layer
            .process(Envelope::CanonicalRequest(req), Direction::Request, &mut ctx)
            .await
            .unwrap();
        assert_eq!(ctx.route, "default");
        assert_eq!(ctx.provider, "p1");
        assert_eq!(ctx.target_model, "m1");
        assert!(ctx.client_stream);
    }

    #[tokio::test]
    async fn transformer_layer_converts_and_checks_model() {
        let layer = TransformerLayer::new(TransformerLayerConfig {
            family: ProtocolFamily::Openai,
            target_model: "m1".into(),
            known_models: vec!["m1".into()],
        });
        let out = layer
            .process(
                Envelope::CanonicalRequest(request(vec![user("hi")])),
                Direction::Request,
                &mut ctx(),
            )
            .await
            .unwrap();
        match out {
            Envelope::ProviderRequest(body) => assert_eq!(body["model"], "m1"),
            other => panic!("wrong envelope: {other:?}"),
        }
    }

    #[tokio::test]
    async fn transformer_layer_fails_on_unknown_model() {
        let layer = TransformerLayer::new(TransformerLayerConfig {
            family: ProtocolFamily::Openai,
            target_model: "ghost".into(),
            known_models: vec!["m1".into()],
        });
        let err = layer
            .process(
                Envelope::CanonicalRequest(request(vec![user("hi")])),
                Direction::Request,
                &mut ctx(),
            )
            .await
            .unwrap_err();
        assert!(err.message.contains("InvalidModel"));
    }

    #[tokio::test]
    async fn protocol_layer_sets_endpoint_and_stream_flag() {
        let layer = ProtocolLayer::new(ProtocolLayerConfig {
            family: ProtocolFamily::Openai,
            base_url: "http://localhost:1234".into(),
            model: "m1".into(),
            supports_streaming: true,
        });
        let mut ctx = ctx();
        ctx.client_stream = true;
        layer
            .process(
                Envelope::ProviderRequest(json!({"model": "m1"})),
                Direction::Request,
                &mut ctx,
            )
            .await
            .unwrap();
        assert!(ctx.upstream_stream);
        assert_eq!(ctx.endpoint, "http://localhost:1234/v1/chat/completions");
    }

    #[tokio::test]
    async fn protocol_layer_disables_streaming_when_unsupported() {
        let layer = ProtocolLayer::new(ProtocolLayerConfig {
            family: ProtocolFamily::Openai,
            base_url: "http://localhost:1234".into(),
            model: "m1".into(),
            supports_streaming: false,
        });
        let mut ctx = ctx();
        ctx.client_stream = true;
        layer
            .process(
                Envelope::ProviderRequest(json!({})),
                Direction::Request,
                &mut ctx,
            )
            .await
            .unwrap();
        assert!(!ctx.upstream_stream);
    }

    #[tokio::test]
    async fn protocol_layer_rejects_unrepairable_response() {
        let layer = ProtocolLayer::new(ProtocolLayerConfig {
            family: ProtocolFamily::Openai,
            base_url: "http://localhost:1234".into(),
            model: "m1".into(),
            supports_streaming: true,
        });
        let err = layer
            .process(
                Envelope::ProviderResponse(json!({"weird": true})),
                Direction::Response,
                &mut ctx(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::UpstreamProtocol);
    }
}
