//! Gateway server
//!
//! Wires the subsystems together at startup — config preprocessing,
//! blueprint generation, pipeline assembly, switching controller, flow
//! controller, front HTTP server — and runs until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::router::{AppState, create_router};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::flow::FlowController;
use crate::pipeline::{PipelineAssembler, blueprints_from_table};
use crate::router::{RouteDispatcher, RuntimeRouter};
use crate::routing::{self, RoutingTable};
use crate::stats::UsageStats;
use crate::switching::SwitchingController;
use crate::trace::TraceWriter;
use crate::upstream::HttpExecutor;

/// The assembled gateway.
pub struct Gateway {
    config: Config,
    state: Arc<AppState>,
}

impl Gateway {
    /// Build every subsystem from the loaded configuration. No network
    /// traffic happens here.
    pub fn new(config: Config) -> Result<Self> {
        let table: Arc<RoutingTable> = Arc::new(routing::preprocess(&config)?);
        info!(
            routes = table.routes.len(),
            providers = table.providers.len(),
            "Routing table preprocessed"
        );

        let blueprints = blueprints_from_table(&table, &config.switching);
        let executor = Arc::new(HttpExecutor::new(&table.providers)?);
        let (assembler, report) = PipelineAssembler::assemble(&blueprints, &executor);
        let assembler = Arc::new(assembler);
        info!(
            healthy = report.healthy,
            failed = report.failed,
            "Pipeline assembly complete"
        );
        for (id, reason) in &report.failures {
            warn!(pipeline = %id, reason = %reason, "Blueprint failed");
        }
        if report.healthy == 0 {
            return Err(Error::config("no healthy pipeline could be assembled"));
        }

        let trace = if config.debug.enabled {
            Some(Arc::new(TraceWriter::new(
                &config.debug.log_dir,
                config.server.port,
            )?))
        } else {
            None
        };

        let switching = Arc::new(SwitchingController::new(config.switching.clone()));
        let stats = Arc::new(UsageStats::new());
        let runtime_router = RuntimeRouter::new(Arc::clone(&table), &assembler, &config.router);
        let dispatcher = Arc::new(RouteDispatcher::new(
            runtime_router,
            Arc::clone(&switching),
            Arc::clone(&stats),
            trace,
            config.server.request_timeout,
        ));
        let flow = Arc::new(FlowController::new(config.flow.clone(), dispatcher));

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

        let state = Arc::new(AppState {
            flow,
            assembler,
            switching,
            executor,
            stats,
            table,
            config: config.clone(),
            shutdown_tx,
        });

        Ok(Self { config, state })
    }

    /// Shared state (integration tests drive handlers directly).
    #[must_use]
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Run the gateway until SIGINT/SIGTERM or `POST /shutdown`.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::config(format!("invalid host: {e}")))?,
            self.config.server.port,
        );

        let shutdown_tx = self.state.shutdown_tx.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();

        // Idle-state sweeper runs until shutdown.
        tokio::spawn(
            Arc::clone(&self.state.flow).run_sweeper(shutdown_tx.subscribe()),
        );

        let router = create_router(Arc::clone(&self.state));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::config(format!("cannot bind {addr}: {e}")))?;
        info!(%addr, "Gateway listening");

        let shutdown_timeout = self.config.server.shutdown_timeout;
        let signal_tx = shutdown_tx.clone();
        let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_rx.recv() => info!("Shutdown signal received (API)"),
                () = shutdown_signal() => {
                    info!("Shutdown signal received (OS)");
                    // Stop the sweeper and any other shutdown listeners too.
                    let _ = signal_tx.send(());
                }
            }
        });

        // Bound the in-flight drain after a shutdown signal.
        let mut drain_rx = shutdown_tx.subscribe();
        tokio::select! {
            result = serve => {
                result.map_err(|e| Error::internal(format!("server error: {e}")))?;
            }
            () = async {
                let _ = drain_rx.recv().await;
                tokio::time::sleep(shutdown_timeout).await;
            } => {
                warn!("Drain deadline exceeded; aborting in-flight requests");
            }
        }

        info!("Gateway stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = signal::unix::signal(signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
