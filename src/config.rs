//! Configuration loading and preprocessing
//!
//! Loads the JSON config document, substitutes `${VAR}` environment
//! placeholders, and validates the result into enumerated per-section
//! structs. Unknown fields are configuration errors, not silent
//! pass-throughs.

use std::{collections::HashMap, env, fs, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Serialized},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::compat::FixTag;

/// Typed configuration failure.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file does not exist
    #[error("config file not found: {0}")]
    MissingConfig(String),
    /// A field is absent or malformed; the message is path-qualified
    #[error("invalid config at {path}: {message}")]
    InvalidConfig {
        /// JSON path of the offending field
        path: String,
        /// What is wrong with it
        message: String,
    },
    /// A `${VAR}` placeholder could not be resolved
    #[error("environment variable not set: {0}")]
    EnvironmentVariableMissing(String),
}

impl ConfigError {
    /// Shorthand for a path-qualified invalid-config error.
    pub fn invalid(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl From<ConfigError> for crate::error::Error {
    fn from(e: ConfigError) -> Self {
        crate::error::Error::config(e.to_string())
    }
}

/// Main configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Environment files loaded before `${VAR}` resolution
    pub env_files: Vec<String>,
    /// Front server settings
    pub server: ServerConfig,
    /// Provider catalogue source
    pub providers: HashMap<String, ProviderConfig>,
    /// Virtual-model routing table source
    pub routing: HashMap<String, RouteSpec>,
    /// Debug trace settings
    pub debug: DebugConfig,
    /// Streaming simulation settings
    pub streaming: StreamingConfig,
    /// Flow controller settings
    pub flow: FlowConfig,
    /// Pipeline switching settings
    pub switching: SwitchingConfig,
    /// Runtime router settings
    pub router: RouterConfig,
}

/// Front HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Per-request wall-clock timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown drain timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3456,
            request_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 50 * 1024 * 1024,
        }
    }
}

/// One or many API keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApiKeys {
    /// Single key
    One(String),
    /// Ordered key list for rotation
    Many(Vec<String>),
}

impl ApiKeys {
    /// Flatten to the ordered key list.
    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(k) => vec![k.clone()],
            Self::Many(ks) => ks.clone(),
        }
    }
}

impl Default for ApiKeys {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

/// Per-provider capability flags.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Capabilities {
    /// Provider accepts tool declarations
    pub supports_tools: bool,
    /// Provider accepts thinking/reasoning parameters
    pub supports_thinking: bool,
    /// Provider can stream responses
    pub supports_streaming: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            supports_tools: true,
            supports_thinking: false,
            supports_streaming: true,
        }
    }
}

/// Advertised min/max for one numeric knob.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParamLimit {
    /// Inclusive minimum
    pub min: Option<f64>,
    /// Inclusive maximum
    pub max: Option<f64>,
}

/// One provider entry in the config document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Protocol family label: openai | lmstudio | ollama | gemini
    pub protocol: String,
    /// Base URL of the provider API
    pub api_base_url: String,
    /// API key(s); `${VAR}` placeholders are resolved at load time
    #[serde(default)]
    pub api_key: ApiKeys,
    /// Advertised model names
    pub models: Vec<String>,
    /// Capability flags
    #[serde(default)]
    pub capabilities: Capabilities,
    /// Per-parameter numeric limits
    #[serde(default, rename = "parameterLimits")]
    pub parameter_limits: HashMap<String, ParamLimit>,
    /// Ordered response-fix tags to apply
    #[serde(default, rename = "responseFixesNeeded")]
    pub response_fixes: Vec<FixTag>,
    /// Model-name remap table applied by the compatibility layer
    #[serde(default, rename = "modelAliases")]
    pub model_aliases: HashMap<String, String>,
    /// Outbound HTTP call timeout for this provider
    #[serde(default = "default_provider_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_provider_timeout() -> Duration {
    Duration::from_secs(60)
}

/// A route value: one target or an ordered priority list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RouteSpec {
    /// Single `"provider,model"` target
    One(String),
    /// Ordered `"provider,model"` targets, highest priority first
    Many(Vec<String>),
}

impl RouteSpec {
    /// Flatten to the ordered target list.
    #[must_use]
    pub fn targets(&self) -> Vec<String> {
        match self {
            Self::One(t) => vec![t.clone()],
            Self::Many(ts) => ts.clone(),
        }
    }
}

/// Debug trace configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DebugConfig {
    /// Write per-layer trace files
    pub enabled: bool,
    /// Log level when debug is on
    #[serde(rename = "logLevel")]
    pub log_level: String,
    /// Trace directory root
    #[serde(rename = "logDir")]
    pub log_dir: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_level: "info".to_string(),
            log_dir: default_log_dir(),
        }
    }
}

fn default_log_dir() -> String {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".llm-gateway")
        .join("logs")
        .display()
        .to_string()
}

/// Streaming simulation configuration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamingConfig {
    /// Text chunk size (chars) when simulating streaming; unset means a
    /// single end-of-stream burst
    pub simulated_chunk_size: Option<usize>,
}

/// Flow controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlowConfig {
    /// Max sessions per client
    pub max_sessions: usize,
    /// Max conversations per session
    pub max_conversations_per_session: usize,
    /// Max queued requests per conversation
    pub max_requests_per_conversation: usize,
    /// Session idle timeout
    #[serde(with = "humantime_serde")]
    pub session_idle_timeout: Duration,
    /// Conversation idle timeout
    #[serde(with = "humantime_serde")]
    pub conversation_idle_timeout: Duration,
    /// Pending request expiry
    #[serde(with = "humantime_serde")]
    pub request_idle_timeout: Duration,
    /// Cleanup sweep interval
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_sessions: 1000,
            max_conversations_per_session: 100,
            max_requests_per_conversation: 50,
            session_idle_timeout: Duration::from_secs(3600),
            conversation_idle_timeout: Duration::from_secs(1800),
            request_idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Pipeline switching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SwitchingConfig {
    /// Retry budget per request across alternate pipelines
    pub retry_budget: u32,
    /// Base cooldown after a recoverable failure
    #[serde(with = "humantime_serde")]
    pub cooldown_base: Duration,
    /// Cooldown cap
    #[serde(with = "humantime_serde")]
    pub cooldown_max: Duration,
    /// Remove blacklisted pipelines from their routes entirely
    pub destroy_on_blacklist: bool,
}

impl Default for SwitchingConfig {
    fn default() -> Self {
        Self {
            retry_budget: 3,
            cooldown_base: Duration::from_secs(1),
            cooldown_max: Duration::from_secs(120),
            destroy_on_blacklist: false,
        }
    }
}

/// Runtime router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouterConfig {
    /// Estimated-token threshold above which requests route to
    /// the `longcontext` route
    pub long_context_threshold: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            long_context_threshold: 60_000,
        }
    }
}

impl Config {
    /// Load the config document from `path`.
    ///
    /// Order of operations: read file, load `env_files` into the process
    /// environment, substitute `${VAR}` placeholders, merge
    /// `LLM_GATEWAY_`-prefixed environment overrides, deserialize.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingConfig`] when the file is absent,
    /// [`ConfigError::EnvironmentVariableMissing`] when a placeholder cannot
    /// be resolved, [`ConfigError::InvalidConfig`] otherwise.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::MissingConfig(path.display().to_string()));
        }
        let text = fs::read_to_string(path)
            .map_err(|e| ConfigError::invalid(path.display().to_string(), e.to_string()))?;
        let raw: Value = serde_json::from_str(&text)
            .map_err(|e| ConfigError::invalid(path.display().to_string(), e.to_string()))?;

        load_env_files(&raw);

        let expanded = expand_env_vars(raw)?;

        let figment = Figment::from(Serialized::defaults(expanded))
            .merge(Env::prefixed("LLM_GATEWAY_").split("__"));

        figment
            .extract()
            .map_err(|e| ConfigError::invalid(path.display().to_string(), e.to_string()))
    }
}

/// Load env files named in the raw document into the process environment.
/// Missing files are skipped with a debug log; `~` expands to the home dir.
fn load_env_files(raw: &Value) {
    let Some(files) = raw.get("env_files").and_then(Value::as_array) else {
        return;
    };
    for file in files.iter().filter_map(Value::as_str) {
        let expanded = if let Some(rest) = file.strip_prefix("~/") {
            dirs::home_dir().map_or_else(|| file.to_string(), |h| h.join(rest).display().to_string())
        } else {
            file.to_string()
        };
        let path = Path::new(&expanded);
        if path.exists() {
            match dotenvy::from_path(path) {
                Ok(()) => tracing::info!(file = %expanded, "Loaded env file"),
                Err(e) => tracing::warn!(file = %expanded, error = %e, "Failed to load env file"),
            }
        } else {
            tracing::debug!(file = %expanded, "Env file not found (skipped)");
        }
    }
}

/// Substitute `${VAR}` placeholders in every string value of the document.
///
/// There are no implicit fallbacks: an unset variable is an error.
fn expand_env_vars(value: Value) -> Result<Value, ConfigError> {
    match value {
        Value::String(s) => Ok(Value::String(expand_string(&s)?)),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(expand_env_vars(item)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                let child = expand_env_vars(v)?;
                out.insert(k, child);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other),
    }
}

fn expand_string(value: &str) -> Result<String, ConfigError> {
    // Pattern: ${VAR}
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex");
    let mut missing: Option<String> = None;
    let expanded = re.replace_all(value, |caps: &regex::Captures<'_>| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            if missing.is_none() {
                missing = Some(var_name.to_string());
            }
            String::new()
        })
    });
    match missing {
        Some(var) => Err(ConfigError::EnvironmentVariableMissing(var)),
        None => Ok(expanded.into_owned()),
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string (e.g. "30s").
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() > 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    /// Deserialize a human-readable duration string ("30s", "5m", "100ms").
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
