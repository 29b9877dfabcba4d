//! Routing table preprocessing
//!
//! Turns the raw config document into a validated [`RoutingTable`]: routes
//! canonicalised to `{routeName: "provider,model"}` target lists in priority
//! order, plus a provider catalogue in which each provider appears exactly
//! once regardless of how many routes reference it.

use std::collections::HashMap;
use std::time::Duration;

use url::Url;

use crate::compat::FixTag;
use crate::config::{Capabilities, Config, ConfigError, ParamLimit};
use crate::protocol::ProtocolFamily;

/// One `"provider,model"` target of a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    /// Provider name (catalogue key)
    pub provider: String,
    /// Concrete model at that provider
    pub model: String,
}

/// Validated provider catalogue entry.
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    /// Provider name
    pub name: String,
    /// Wire protocol family
    pub family: ProtocolFamily,
    /// Base URL
    pub base_url: String,
    /// Ordered API keys
    pub api_keys: Vec<String>,
    /// Advertised model names
    pub models: Vec<String>,
    /// Capability flags
    pub capabilities: Capabilities,
    /// Per-parameter numeric limits
    pub parameter_limits: HashMap<String, ParamLimit>,
    /// Ordered response-fix tags
    pub response_fixes: Vec<FixTag>,
    /// Model-name remap table
    pub model_aliases: HashMap<String, String>,
    /// Outbound HTTP call timeout
    pub timeout: Duration,
}

impl ProviderSpec {
    /// Whether the provider advertises the model, directly or via alias.
    #[must_use]
    pub fn advertises(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model) || self.model_aliases.contains_key(model)
    }
}

/// The validated routing table.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    /// Route name → ordered targets (priority order preserved from config)
    pub routes: HashMap<String, Vec<RouteTarget>>,
    /// The designated fallback route name
    pub default_route: String,
    /// Provider catalogue
    pub providers: HashMap<String, ProviderSpec>,
}

impl RoutingTable {
    /// Targets of a route, falling back to the default route when the name
    /// is unknown.
    #[must_use]
    pub fn targets(&self, route: &str) -> &[RouteTarget] {
        self.routes
            .get(route)
            .or_else(|| self.routes.get(&self.default_route))
            .map_or(&[], Vec::as_slice)
    }

    /// Whether a route with this exact name exists.
    #[must_use]
    pub fn has_route(&self, route: &str) -> bool {
        self.routes.contains_key(route)
    }
}

/// Preprocess the config into a routing table and provider catalogue.
///
/// Every field required by downstream layers must be present; no defaults
/// are substituted for provider credentials or endpoints.
pub fn preprocess(config: &Config) -> Result<RoutingTable, ConfigError> {
    if config.routing.is_empty() {
        return Err(ConfigError::invalid("routing", "no routes configured"));
    }
    if !config.routing.contains_key("default") {
        return Err(ConfigError::invalid("routing.default", "default route is required"));
    }

    let mut providers = HashMap::new();
    for (name, provider) in &config.providers {
        let path = format!("providers.{name}");
        let family = ProtocolFamily::parse(&provider.protocol)
            .map_err(|e| ConfigError::invalid(format!("{path}.protocol"), e.message))?;

        if provider.api_base_url.is_empty() {
            return Err(ConfigError::invalid(
                format!("{path}.api_base_url"),
                "endpoint is required",
            ));
        }
        Url::parse(&provider.api_base_url).map_err(|e| {
            ConfigError::invalid(format!("{path}.api_base_url"), format!("not a valid URL: {e}"))
        })?;

        let api_keys = provider.api_key.to_vec();
        if api_keys.is_empty() || api_keys.iter().any(String::is_empty) {
            return Err(ConfigError::invalid(
                format!("{path}.api_key"),
                "at least one non-empty API key is required",
            ));
        }
        if provider.models.is_empty() {
            return Err(ConfigError::invalid(
                format!("{path}.models"),
                "at least one model is required",
            ));
        }

        providers.insert(
            name.clone(),
            ProviderSpec {
                name: name.clone(),
                family,
                base_url: provider.api_base_url.clone(),
                api_keys,
                models: provider.models.clone(),
                capabilities: provider.capabilities,
                parameter_limits: provider.parameter_limits.clone(),
                response_fixes: provider.response_fixes.clone(),
                model_aliases: provider.model_aliases.clone(),
                timeout: provider.timeout,
            },
        );
    }

    let mut routes = HashMap::new();
    for (route_name, spec) in &config.routing {
        let mut targets = Vec::new();
        for (i, target) in spec.targets().iter().enumerate() {
            let path = format!("routing.{route_name}[{i}]");
            let Some((provider_name, model)) = target.split_once(',') else {
                return Err(ConfigError::invalid(
                    path,
                    format!("target `{target}` is not of the form \"provider,model\""),
                ));
            };
            let provider_name = provider_name.trim();
            let model = model.trim();
            let Some(provider) = providers.get(provider_name) else {
                return Err(ConfigError::invalid(
                    path,
                    format!("unknown provider `{provider_name}`"),
                ));
            };
            if !provider.advertises(model) {
                return Err(ConfigError::invalid(
                    path,
                    format!("provider `{provider_name}` does not advertise model `{model}`"),
                ));
            }
            targets.push(RouteTarget {
                provider: provider_name.to_string(),
                model: model.to_string(),
            });
        }
        if targets.is_empty() {
            return Err(ConfigError::invalid(
                format!("routing.{route_name}"),
                "route has no targets",
            ));
        }
        routes.insert(route_name.clone(), targets);
    }

    Ok(RoutingTable {
        routes,
        default_route: "default".to_string(),
        providers,
    })
}
