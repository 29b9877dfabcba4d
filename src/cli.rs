//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// llm-gateway — Anthropic-compatible gateway to heterogeneous providers
#[derive(Parser, Debug)]
#[command(name = "llm-gateway", version, about)]
pub struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, env = "LLM_GATEWAY_CONFIG", default_value = "config.json")]
    pub config: PathBuf,

    /// Override the configured port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Override the configured host
    #[arg(long)]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log format (text or json)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Enable debug traces regardless of the config file
    #[arg(long)]
    pub debug: bool,

    /// Subcommand; none means "run the gateway"
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Operator subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Validate the configuration and print the routing table summary
    Check,
}
