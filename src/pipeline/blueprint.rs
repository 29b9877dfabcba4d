//! Pipeline blueprints
//!
//! The router preprocessor: a pure function from the routing table to the
//! declarative descriptions pipelines are assembled from. One blueprint per
//! (provider, model) pair; routes referencing the same pair share the
//! pipeline (the runtime router maps route names to id lists separately).

use std::time::Duration;

use crate::config::SwitchingConfig;
use crate::error::{Error, Result};
use crate::protocol::ProtocolFamily;
use crate::routing::{ProviderSpec, RoutingTable};

use super::LayerKind;

/// Client layer configuration: inbound validation bounds.
#[derive(Debug, Clone)]
pub struct ClientLayerConfig {
    /// Maximum messages per request
    pub max_messages: usize,
    /// Maximum tool declarations per request
    pub max_tools: usize,
    /// Maximum stop sequences per request
    pub max_stop_sequences: usize,
    /// Maximum `max_tokens` value
    pub max_output_tokens: u32,
}

impl Default for ClientLayerConfig {
    fn default() -> Self {
        Self {
            max_messages: 100,
            max_tools: 20,
            max_stop_sequences: 4,
            max_output_tokens: 200_000,
        }
    }
}

/// Router layer configuration: the routing decision this pipeline serves.
#[derive(Debug, Clone)]
pub struct RouterLayerConfig {
    /// Route name
    pub route: String,
    /// Provider name
    pub provider: String,
    /// Concrete model
    pub target_model: String,
}

/// Transformer layer configuration.
#[derive(Debug, Clone)]
pub struct TransformerLayerConfig {
    /// Wire family to convert to/from
    pub family: ProtocolFamily,
    /// Concrete model written into outgoing requests
    pub target_model: String,
    /// Models (and aliases) the provider accepts, for the InvalidModel check
    pub known_models: Vec<String>,
}

/// Protocol layer configuration.
#[derive(Debug, Clone)]
pub struct ProtocolLayerConfig {
    /// Wire family
    pub family: ProtocolFamily,
    /// Provider base URL
    pub base_url: String,
    /// Concrete model (needed for Gemini URL construction)
    pub model: String,
    /// Whether the provider can stream
    pub supports_streaming: bool,
}

/// Compatibility layer configuration: the provider's quirk profile.
#[derive(Debug, Clone)]
pub struct CompatibilityLayerConfig {
    /// Full provider spec (limits, capabilities, fixes, aliases)
    pub provider: ProviderSpec,
}

/// Server layer configuration.
#[derive(Debug, Clone)]
pub struct ServerLayerConfig {
    /// Provider name (key-ring lookup)
    pub provider: String,
    /// Wire family (auth header style, SSE reassembly)
    pub family: ProtocolFamily,
    /// Outbound HTTP call timeout
    pub timeout: Duration,
}

/// One layer descriptor inside a blueprint. Every blueprint carries all
/// six, even when a layer is a no-op for its provider.
#[derive(Debug, Clone)]
pub enum LayerDescriptor {
    /// Client layer (1)
    Client(ClientLayerConfig),
    /// Router layer (2)
    Router(RouterLayerConfig),
    /// Transformer layer (3)
    Transformer(TransformerLayerConfig),
    /// Protocol layer (4)
    Protocol(ProtocolLayerConfig),
    /// Compatibility layer (5)
    Compatibility(CompatibilityLayerConfig),
    /// Server layer (6)
    Server(ServerLayerConfig),
}

impl LayerDescriptor {
    /// Which layer kind this descriptor configures.
    #[must_use]
    pub fn kind(&self) -> LayerKind {
        match self {
            Self::Client(_) => LayerKind::Client,
            Self::Router(_) => LayerKind::Router,
            Self::Transformer(_) => LayerKind::Transformer,
            Self::Protocol(_) => LayerKind::Protocol,
            Self::Compatibility(_) => LayerKind::Compatibility,
            Self::Server(_) => LayerKind::Server,
        }
    }
}

/// Declarative description a pipeline is assembled from.
#[derive(Debug, Clone)]
pub struct PipelineBlueprint {
    /// `pipeline_{provider}_{model}`
    pub id: String,
    /// Route that first referenced this pipeline
    pub route: String,
    /// Provider name
    pub provider: String,
    /// Concrete model
    pub model: String,
    /// Canonical endpoint URL
    pub endpoint: String,
    /// Index into the provider's ordered key list where rotation starts
    pub key_index: usize,
    /// Per-request wall-clock timeout
    pub timeout: Duration,
    /// Retry budget across alternate pipelines
    pub retry_budget: u32,
    /// The six ordered layer descriptors
    pub layers: Vec<LayerDescriptor>,
}

impl PipelineBlueprint {
    /// Validate the blueprint: id, endpoint, and the fixed six-layer order.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::config("blueprint has an empty id"));
        }
        if self.endpoint.is_empty() {
            return Err(Error::config(format!("blueprint {} has no endpoint", self.id)));
        }
        let kinds: Vec<LayerKind> = self.layers.iter().map(LayerDescriptor::kind).collect();
        if kinds != LayerKind::ORDER {
            return Err(Error::config(format!(
                "blueprint {} layers out of order: {kinds:?}",
                self.id
            )));
        }
        Ok(())
    }
}

/// Build the pipeline id for a (provider, model) pair.
#[must_use]
pub fn pipeline_id(provider: &str, model: &str) -> String {
    format!("pipeline_{provider}_{model}")
}

/// Preprocess the routing table into blueprints.
///
/// Pure function: for every (route, target) pair a blueprint exists; pairs
/// sharing a (provider, model) share one blueprint keyed by its id. Within
/// a route, config order is priority order and is preserved by the caller's
/// route → id mapping.
pub fn blueprints_from_table(
    table: &RoutingTable,
    switching: &SwitchingConfig,
) -> Vec<PipelineBlueprint> {
    let mut blueprints: Vec<PipelineBlueprint> = Vec::new();

    // Deterministic emission order: route names sorted, targets in priority
    // order within each route.
    let mut route_names: Vec<&String> = table.routes.keys().collect();
    route_names.sort();

    for route_name in route_names {
        for target in &table.routes[route_name] {
            let id = pipeline_id(&target.provider, &target.model);
            if blueprints.iter().any(|b| b.id == id) {
                continue;
            }
            let Some(provider) = table.providers.get(&target.provider) else {
                // Routing preprocessing already rejected this; skip defensively.
                continue;
            };
            blueprints.push(build_blueprint(route_name, provider, &target.model, switching));
        }
    }
    blueprints
}

fn build_blueprint(
    route: &str,
    provider: &ProviderSpec,
    model: &str,
    switching: &SwitchingConfig,
) -> PipelineBlueprint {
    let mut known_models = provider.models.clone();
    known_models.extend(provider.model_aliases.keys().cloned());

    let layers = vec![
        LayerDescriptor::Client(ClientLayerConfig::default()),
        LayerDescriptor::Router(RouterLayerConfig {
            route: route.to_string(),
            provider: provider.name.clone(),
            target_model: model.to_string(),
        }),
        LayerDescriptor::Transformer(TransformerLayerConfig {
            family: provider.family,
            target_model: model.to_string(),
            known_models,
        }),
        LayerDescriptor::Protocol(ProtocolLayerConfig {
            family: provider.family,
            base_url: provider.base_url.clone(),
            model: model.to_string(),
            supports_streaming: provider.capabilities.supports_streaming,
        }),
        LayerDescriptor::Compatibility(CompatibilityLayerConfig {
            provider: provider.clone(),
        }),
        LayerDescriptor::Server(ServerLayerConfig {
            provider: provider.name.clone(),
            family: provider.family,
            timeout: provider.timeout,
        }),
    ];

    PipelineBlueprint {
        id: pipeline_id(&provider.name, model),
        route: route.to_string(),
        provider: provider.name.clone(),
        model: model.to_string(),
        endpoint: provider.family.endpoint(&provider.base_url, model, false),
        key_index: 0,
        timeout: provider.timeout,
        retry_budget: switching.retry_budget,
        layers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiKeys, Config, ProviderConfig, RouteSpec};
    use crate::routing::preprocess;
    use std::collections::HashMap;

    fn table_with_two_providers() -> RoutingTable {
        let mut config = Config::default();
        for (name, model) in [("p1", "m1"), ("p2", "m2")] {
            config.providers.insert(
                name.into(),
                ProviderConfig {
                    protocol: "openai".into(),
                    api_base_url: "http://localhost:1234".into(),
                    api_key: ApiKeys::One("k".into()),
                    models: vec![model.into()],
                    capabilities: crate::config::Capabilities::default(),
                    parameter_limits: HashMap::new(),
                    response_fixes: Vec::new(),
                    model_aliases: HashMap::new(),
                    timeout: Duration::from_secs(60),
                },
            );
        }
        config.routing.insert(
            "default".into(),
            RouteSpec::Many(vec!["p1,m1".into(), "p2,m2".into()]),
        );
        config
            .routing
            .insert("background".into(), RouteSpec::One("p1,m1".into()));
        preprocess(&config).unwrap()
    }

    #[test]
    fn one_blueprint_per_provider_model_pair() {
        let table = table_with_two_providers();
        let blueprints = blueprints_from_table(&table, &SwitchingConfig::default());
        // p1,m1 appears in two routes but yields one blueprint.
        assert_eq!(blueprints.len(), 2);
        let ids: Vec<&str> = blueprints.iter().map(|b| b.id.as_str()).collect();
        assert!(ids.contains(&"pipeline_p1_m1"));
        assert!(ids.contains(&"pipeline_p2_m2"));
    }

    #[test]
    fn every_blueprint_carries_all_six_layers_in_order() {
        let table = table_with_two_providers();
        for blueprint in blueprints_from_table(&table, &SwitchingConfig::default()) {
            blueprint.validate().unwrap();
            assert_eq!(blueprint.layers.len(), 6);
        }
    }

    #[test]
    fn blueprint_endpoint_is_concrete() {
        let table = table_with_two_providers();
        let blueprints = blueprints_from_table(&table, &SwitchingConfig::default());
        let bp = blueprints.iter().find(|b| b.id == "pipeline_p1_m1").unwrap();
        assert_eq!(bp.endpoint, "http://localhost:1234/v1/chat/completions");
        assert_eq!(bp.key_index, 0);
    }

    #[test]
    fn validation_rejects_missing_endpoint() {
        let table = table_with_two_providers();
        let mut bp = blueprints_from_table(&table, &SwitchingConfig::default())
            .into_iter()
            .next()
            .unwrap();
        bp.endpoint = String::new();
        assert!(bp.validate().is_err());
    }

    #[test]
    fn validation_rejects_misordered_layers() {
        let table = table_with_two_providers();
        let mut bp = blueprints_from_table(&table, &SwitchingConfig::default())
            .into_iter()
            .next()
            .unwrap();
        bp.layers.swap(0, 5);
        assert!(bp.validate().is_err());
    }

    #[test]
    fn retry_budget_comes_from_switching_config() {
        let table = table_with_two_providers();
        let switching = SwitchingConfig {
            retry_budget: 7,
            ..SwitchingConfig::default()
        };
        let blueprints = blueprints_from_table(&table, &switching);
        assert!(blueprints.iter().all(|b| b.retry_budget == 7));
    }
}
