//! llm-gateway library
//!
//! A local HTTP gateway that accepts requests in Anthropic's Messages wire
//! format and forwards them to heterogeneous upstream AI providers
//! (OpenAI-compatible servers, LMStudio, Ollama, Gemini), translating
//! request and response formats bidirectionally.
//!
//! The core is a six-stage, per-request, ordered transformation chain —
//! client, router, transformer, protocol, compatibility, server — whose
//! stages are assembled once at startup from configuration and reused for
//! the lifetime of the process. Around it: the configuration preprocessor,
//! the runtime router, the pipeline switching & health controller, and the
//! per-conversation flow controller.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod compat;
pub mod config;
pub mod error;
pub mod flow;
pub mod gateway;
pub mod pipeline;
pub mod protocol;
pub mod router;
pub mod routing;
pub mod stats;
pub mod switching;
pub mod trace;
pub mod transform;
pub mod upstream;

pub use error::{Error, ErrorKind, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
