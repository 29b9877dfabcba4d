//! Pipeline assembly
//!
//! Consumes blueprints and constructs the six layer objects per pipeline.
//! Only local validation happens here — the network is never probed. A
//! blueprint that fails validation does not abort assembly: its pipeline is
//! constructed anyway, reported, and blacklisted from the start.

use std::collections::HashMap;
use std::sync::Arc;

use crate::upstream::HttpExecutor;

use super::blueprint::{LayerDescriptor, PipelineBlueprint};
use super::layers::{
    ClientLayer, CompatibilityLayer, ProtocolLayer, RouterLayer, ServerLayer, TransformerLayer,
};
use super::{Pipeline, PipelineLayer, PipelineStatus};

/// Outcome of one assembly run.
#[derive(Debug, Default)]
pub struct AssemblyReport {
    /// Pipelines assembled healthy
    pub healthy: usize,
    /// Pipelines blacklisted at assembly time
    pub failed: usize,
    /// (pipeline id, reason) per failure
    pub failures: Vec<(String, String)>,
}

/// Owns every pipeline. The map is written once here and read lock-free
/// for the life of the process.
pub struct PipelineAssembler {
    pipelines: HashMap<String, Arc<Pipeline>>,
}

impl PipelineAssembler {
    /// Assemble pipelines from blueprints.
    pub fn assemble(
        blueprints: &[PipelineBlueprint],
        executor: &Arc<HttpExecutor>,
    ) -> (Self, AssemblyReport) {
        let mut pipelines = HashMap::with_capacity(blueprints.len());
        let mut report = AssemblyReport::default();

        for blueprint in blueprints {
            let initial_status = match blueprint.validate() {
                Ok(()) => PipelineStatus::Healthy,
                Err(e) => {
                    tracing::warn!(
                        pipeline = %blueprint.id,
                        error = %e,
                        "Blueprint validation failed; pipeline blacklisted from the start"
                    );
                    report.failures.push((blueprint.id.clone(), e.message.clone()));
                    PipelineStatus::Blacklisted
                }
            };

            let layers = build_layers(blueprint, executor);
            match Pipeline::new(blueprint, layers, initial_status) {
                Ok(pipeline) => {
                    if initial_status == PipelineStatus::Healthy {
                        report.healthy += 1;
                    } else {
                        report.failed += 1;
                    }
                    tracing::info!(
                        pipeline = %pipeline.id,
                        provider = %pipeline.provider,
                        model = %pipeline.model,
                        status = %pipeline.status().as_str(),
                        "Pipeline assembled"
                    );
                    pipelines.insert(pipeline.id.clone(), Arc::new(pipeline));
                }
                Err(e) => {
                    report.failed += 1;
                    report.failures.push((blueprint.id.clone(), e.message));
                }
            }
        }

        (Self { pipelines }, report)
    }

    /// Look up a pipeline by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Pipeline>> {
        self.pipelines.get(id).map(Arc::clone)
    }

    /// All pipelines, keyed by id.
    #[must_use]
    pub fn pipelines(&self) -> &HashMap<String, Arc<Pipeline>> {
        &self.pipelines
    }
}

fn build_layers(
    blueprint: &PipelineBlueprint,
    executor: &Arc<HttpExecutor>,
) -> Vec<Box<dyn PipelineLayer>> {
    blueprint
        .layers
        .iter()
        .map(|descriptor| -> Box<dyn PipelineLayer> {
            match descriptor {
                LayerDescriptor::Client(c) => Box::new(ClientLayer::new(c.clone())),
                LayerDescriptor::Router(c) => Box::new(RouterLayer::new(c.clone())),
                LayerDescriptor::Transformer(c) => Box::new(TransformerLayer::new(c.clone())),
                LayerDescriptor::Protocol(c) => Box::new(ProtocolLayer::new(c.clone())),
                LayerDescriptor::Compatibility(c) => Box::new(CompatibilityLayer::new(c.clone())),
                LayerDescriptor::Server(c) => {
                    Box::new(ServerLayer::new(c.clone(), Arc::clone(executor)))
                }
            }
        })
        .collect()
}
