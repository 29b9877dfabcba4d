//! Runtime router and route dispatcher
//!
//! The router picks a route for each request from metadata flags and size
//! heuristics, then the dispatcher drives pipeline selection, the
//! per-request wall-clock timeout, and alternate-pipeline retries through
//! the switching controller.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use tokio_util::sync::CancellationToken;

use crate::config::RouterConfig;
use crate::error::{Error, Result};
use crate::flow::RequestExecutor;
use crate::pipeline::{LayerContext, Pipeline, PipelineAssembler, blueprint::pipeline_id};
use crate::protocol::messages::{CanonicalRequest, CanonicalResponse};
use crate::routing::RoutingTable;
use crate::stats::UsageStats;
use crate::switching::{Recoverability, SwitchingController};
use crate::trace::TraceWriter;

/// Category selection, applied in order; first match wins.
///
/// `background` beats `tools` when both flags are present.
fn categorize(request: &CanonicalRequest, table: &RoutingTable, long_context_threshold: usize) -> &'static str {
    if request.metadata.background == Some(true) {
        return "background";
    }
    if !request.tools.is_empty() && table.has_route("tooluse") {
        return "tooluse";
    }
    if request.estimated_tokens() > long_context_threshold {
        return "longcontext";
    }
    if request.metadata.thinking == Some(true) {
        return "thinking";
    }
    if request.metadata.search == Some(true) {
        return "search";
    }
    "default"
}

/// Maps route names to their priority-ordered pipelines. Built once at
/// startup; read lock-free afterwards.
pub struct RuntimeRouter {
    table: Arc<RoutingTable>,
    route_pipelines: HashMap<String, Vec<Arc<Pipeline>>>,
    long_context_threshold: usize,
}

impl RuntimeRouter {
    /// Build the route → pipeline mapping from the assembled pipelines.
    #[must_use]
    pub fn new(table: Arc<RoutingTable>, assembler: &PipelineAssembler, config: &RouterConfig) -> Self {
        let mut route_pipelines = HashMap::new();
        for (route_name, targets) in &table.routes {
            let pipelines: Vec<Arc<Pipeline>> = targets
                .iter()
                .filter_map(|t| assembler.get(&pipeline_id(&t.provider, &t.model)))
                .collect();
            route_pipelines.insert(route_name.clone(), pipelines);
        }
        Self {
            table,
            route_pipelines,
            long_context_threshold: config.long_context_threshold,
        }
    }

    /// Pick the route for a request.
    #[must_use]
    pub fn route_for(&self, request: &CanonicalRequest) -> &'static str {
        categorize(request, &self.table, self.long_context_threshold)
    }

    /// The priority-ordered pipelines of a route, falling back to the
    /// default route for unknown names. Never crosses into another route.
    #[must_use]
    pub fn pipelines(&self, route: &str) -> &[Arc<Pipeline>] {
        self.route_pipelines
            .get(route)
            .or_else(|| self.route_pipelines.get(&self.table.default_route))
            .map_or(&[], Vec::as_slice)
    }

    /// All routes with their pipelines (status surface).
    #[must_use]
    pub fn all_routes(&self) -> &HashMap<String, Vec<Arc<Pipeline>>> {
        &self.route_pipelines
    }
}

/// Drives one request end to end: route choice, pipeline pick, wall-clock
/// timeout, failure classification, alternate-pipeline switching.
pub struct RouteDispatcher {
    router: RuntimeRouter,
    switching: Arc<SwitchingController>,
    stats: Arc<UsageStats>,
    trace: Option<Arc<TraceWriter>>,
    request_timeout: Duration,
}

impl RouteDispatcher {
    /// Create the dispatcher.
    #[must_use]
    pub fn new(
        router: RuntimeRouter,
        switching: Arc<SwitchingController>,
        stats: Arc<UsageStats>,
        trace: Option<Arc<TraceWriter>>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            router,
            switching,
            stats,
            trace,
            request_timeout,
        }
    }

    /// The runtime router (status surface).
    #[must_use]
    pub fn router(&self) -> &RuntimeRouter {
        &self.router
    }

    fn retry_backoff() -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: Duration::from_millis(200),
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(5),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }

    async fn dispatch(
        &self,
        request: &CanonicalRequest,
        request_id: &str,
        cancel: &CancellationToken,
    ) -> Result<CanonicalResponse> {
        let route = self.router.route_for(request);
        let candidates = self.router.pipelines(route);
        if candidates.is_empty() {
            return Err(Error::routing(format!("route {route} has no pipelines")));
        }

        let budget = self.switching.retry_budget();
        let mut excluded: HashSet<String> = HashSet::new();
        let mut retries = 0u32;
        let mut backoff = Self::retry_backoff();
        let mut last_error: Option<Error> = None;

        loop {
            let picked = if retries == 0 && excluded.is_empty() {
                self.switching.pick_primary(candidates, &excluded)
            } else {
                self.switching.pick_alternate(candidates, &excluded)
            };
            let Some(pipeline) = picked else {
                self.stats.record_failure();
                // Surface the real upstream failure when there was one; a
                // bare NoHealthyPipeline means everything was already down.
                return Err(last_error.unwrap_or_else(|| {
                    Error::routing(format!(
                        "NoHealthyPipeline: route {route} has no healthy pipeline left"
                    ))
                    .with_request_id(request_id)
                }));
            };

            self.stats.record_attempt(route, &pipeline.id);
            tracing::info!(
                request_id = %request_id,
                route = %route,
                pipeline = %pipeline.id,
                retries,
                "Dispatching request"
            );

            let mut ctx = LayerContext::new(request_id, request.model.clone());
            ctx.client_stream = request.stream;
            ctx.cancel = cancel.clone();
            ctx.trace = self.trace.clone();

            match pipeline.execute(request.clone(), &mut ctx).await {
                Ok(response) => {
                    self.switching.record_success(&pipeline);
                    self.stats.record_success();
                    return Ok(response);
                }
                Err(mut error) => {
                    if error.request_id.is_none() {
                        error.request_id = Some(request_id.to_string());
                    }
                    match self.switching.record_failure(&pipeline, &error) {
                        Recoverability::Terminal => {
                            self.stats.record_failure();
                            return Err(error);
                        }
                        Recoverability::NonRecoverable => {
                            // Blacklisted; switch immediately without
                            // consuming the retry budget.
                            excluded.insert(pipeline.id.clone());
                            last_error = Some(error);
                        }
                        Recoverability::Recoverable => {
                            retries += 1;
                            if retries > budget {
                                self.stats.record_failure();
                                return Err(error);
                            }
                            self.stats.record_retry();
                            excluded.insert(pipeline.id.clone());
                            last_error = Some(error);
                            if let Some(delay) = backoff.next_backoff() {
                                tokio::select! {
                                    () = tokio::time::sleep(delay) => {}
                                    () = cancel.cancelled() => {
                                        return Err(Error::internal("request cancelled during pipeline switch")
                                            .with_request_id(request_id));
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl RequestExecutor for RouteDispatcher {
    async fn execute(
        &self,
        request: CanonicalRequest,
        request_id: &str,
        cancel: CancellationToken,
    ) -> Result<CanonicalResponse> {
        // One wall-clock budget bounds the whole dispatch, switches and
        // backoff sleeps included; the per-HTTP-call timeout lives in the
        // server layer.
        match tokio::time::timeout(self.request_timeout, self.dispatch(&request, request_id, &cancel))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                self.stats.record_failure();
                Err(Error::timeout("per-request timeout exceeded").with_request_id(request_id))
            }
        }
    }
}
