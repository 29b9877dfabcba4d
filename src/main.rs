//! llm-gateway — Anthropic-compatible gateway to heterogeneous providers

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use llm_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    routing, setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.debug { "debug" } else { &cli.log_level };
    if let Err(e) = setup_tracing(level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(&cli.config) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            if cli.debug {
                config.debug.enabled = true;
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(Command::Check) = cli.command {
        return check_config(&config);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        providers = config.providers.len(),
        routes = config.routing.len(),
        debug = config.debug.enabled,
        "Starting llm-gateway"
    );

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}

/// Operator preflight: validate the config and print the routing table.
fn check_config(config: &Config) -> ExitCode {
    match routing::preprocess(config) {
        Ok(table) => {
            println!("configuration OK");
            println!("providers: {}", table.providers.len());
            let mut routes: Vec<_> = table.routes.iter().collect();
            routes.sort_by_key(|(name, _)| (*name).clone());
            for (name, targets) in routes {
                let rendered: Vec<String> = targets
                    .iter()
                    .map(|t| format!("{},{}", t.provider, t.model))
                    .collect();
                println!("route {name}: {}", rendered.join(" -> "));
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("configuration invalid: {e}");
            ExitCode::FAILURE
        }
    }
}
