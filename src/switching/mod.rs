//! Pipeline switching controller
//!
//! Classifies pipeline failures with a priority-ordered rule set, tracks
//! per-pipeline health records, applies exponential cooldowns after
//! recoverable failures, blacklists (and optionally destroys) pipelines on
//! non-recoverable ones, and selects alternates within the same route.
//! Success on an alternate never heals the failed pipeline; healing needs
//! the cooldown to expire or an operator reset.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::config::SwitchingConfig;
use crate::error::{Error, ErrorKind};
use crate::pipeline::{Pipeline, PipelineStatus};

/// How a classified failure may be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recoverability {
    /// Retry on an alternate pipeline within the route
    Recoverable,
    /// Blacklist this pipeline, then switch
    NonRecoverable,
    /// Surface to the client unchanged; no retry, no blacklist
    Terminal,
}

/// One classification rule: any matching field set wins.
struct ClassificationRule {
    statuses: &'static [u16],
    keywords: &'static [&'static str],
    kinds: &'static [ErrorKind],
    outcome: Recoverability,
}

/// Priority-ordered rule set; first match wins.
const RULES: &[ClassificationRule] = &[
    // Terminal client-side errors keep their original status.
    ClassificationRule {
        statuses: &[400, 413, 414, 415],
        keywords: &[],
        kinds: &[ErrorKind::Validation, ErrorKind::Transform],
        outcome: Recoverability::Terminal,
    },
    // Auth failures, unknown models, and upstream-internal bugs poison the
    // pipeline permanently.
    ClassificationRule {
        statuses: &[401, 403, 404, 500],
        keywords: &["model_not_found", "unauthorized", "forbidden"],
        kinds: &[ErrorKind::Auth],
        outcome: Recoverability::NonRecoverable,
    },
    // Transient upstream conditions.
    ClassificationRule {
        statuses: &[429, 502, 503, 504],
        keywords: &["timeout", "timed out", "connection refused", "connection reset", "overloaded"],
        kinds: &[ErrorKind::RateLimit, ErrorKind::UpstreamTimeout, ErrorKind::UpstreamServer],
        outcome: Recoverability::Recoverable,
    },
    // Unfixable response shapes: worth one try elsewhere in the route.
    ClassificationRule {
        statuses: &[],
        keywords: &[],
        kinds: &[ErrorKind::UpstreamProtocol],
        outcome: Recoverability::Recoverable,
    },
];

/// Classify an error by the priority-ordered rule set.
#[must_use]
pub fn classify(error: &Error) -> Recoverability {
    for rule in RULES {
        let status_match = error
            .upstream_status
            .is_some_and(|s| rule.statuses.contains(&s));
        let keyword_match = rule
            .keywords
            .iter()
            .any(|k| error.message.to_ascii_lowercase().contains(k));
        let kind_match = rule.kinds.contains(&error.kind);
        if status_match || keyword_match || kind_match {
            return rule.outcome;
        }
    }
    // Anything unclassified (internal bugs, cancellations) must not loop.
    Recoverability::Terminal
}

/// Per-pipeline health record.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineHealthRecord {
    /// Consecutive failure count
    pub consecutive_failures: u32,
    /// Last failure timestamp (epoch millis, 0 = never)
    pub last_failure_ms: u64,
    /// Cooldown expiry (epoch millis) while temporarily blocked
    pub cooldown_until_ms: u64,
}

/// The switching controller. Owns the health-record map; reads pipeline
/// status through the shared pipeline objects.
pub struct SwitchingController {
    records: DashMap<String, PipelineHealthRecord>,
    config: SwitchingConfig,
}

impl SwitchingController {
    /// Create the controller.
    #[must_use]
    pub fn new(config: SwitchingConfig) -> Self {
        Self {
            records: DashMap::new(),
            config,
        }
    }

    /// Configured retry budget.
    #[must_use]
    pub fn retry_budget(&self) -> u32 {
        self.config.retry_budget
    }

    /// Record a success: clears the failure streak. Does not heal other
    /// pipelines.
    pub fn record_success(&self, pipeline: &Pipeline) {
        self.records
            .entry(pipeline.id.clone())
            .and_modify(|r| {
                r.consecutive_failures = 0;
                r.cooldown_until_ms = 0;
            })
            .or_default();
        if pipeline.status() == PipelineStatus::TemporarilyBlocked {
            pipeline.set_status(PipelineStatus::Healthy);
        }
    }

    /// Record a failure, classify it, and transition the pipeline.
    pub fn record_failure(&self, pipeline: &Pipeline, error: &Error) -> Recoverability {
        let outcome = classify(error);
        match outcome {
            Recoverability::Terminal => {
                // Not the pipeline's fault; nothing to record.
            }
            Recoverability::Recoverable => {
                let mut record = self.records.entry(pipeline.id.clone()).or_default();
                record.consecutive_failures += 1;
                record.last_failure_ms = epoch_millis();
                let cooldown = cooldown_for(
                    record.consecutive_failures,
                    self.config.cooldown_base,
                    self.config.cooldown_max,
                );
                record.cooldown_until_ms = epoch_millis() + duration_millis(cooldown);
                drop(record);
                pipeline.set_status(PipelineStatus::TemporarilyBlocked);
                tracing::warn!(
                    pipeline = %pipeline.id,
                    error = %error,
                    cooldown = ?cooldown,
                    "Recoverable failure; pipeline temporarily blocked"
                );
            }
            Recoverability::NonRecoverable => {
                let mut record = self.records.entry(pipeline.id.clone()).or_default();
                record.consecutive_failures += 1;
                record.last_failure_ms = epoch_millis();
                drop(record);
                pipeline.set_status(PipelineStatus::Blacklisted);
                if self.config.destroy_on_blacklist {
                    pipeline.set_status(PipelineStatus::Destroyed);
                }
                tracing::error!(
                    pipeline = %pipeline.id,
                    error = %error,
                    destroyed = self.config.destroy_on_blacklist,
                    "Non-recoverable failure; pipeline blacklisted"
                );
            }
        }
        outcome
    }

    /// Whether a pipeline may serve a request right now. An expired
    /// cooldown heals a temporarily blocked pipeline lazily.
    pub fn is_available(&self, pipeline: &Pipeline) -> bool {
        match pipeline.status() {
            PipelineStatus::Healthy => true,
            PipelineStatus::TemporarilyBlocked => {
                let expired = self
                    .records
                    .get(&pipeline.id)
                    .is_none_or(|r| epoch_millis() >= r.cooldown_until_ms);
                if expired {
                    pipeline.set_status(PipelineStatus::Healthy);
                }
                expired
            }
            PipelineStatus::Blacklisted | PipelineStatus::Destroyed => false,
        }
    }

    /// First available pipeline in priority order (the router's pick).
    pub fn pick_primary(
        &self,
        candidates: &[Arc<Pipeline>],
        exclude: &HashSet<String>,
    ) -> Option<Arc<Pipeline>> {
        candidates
            .iter()
            .find(|p| !exclude.contains(&p.id) && self.is_available(p))
            .map(Arc::clone)
    }

    /// Best alternate: available, not excluded, fewest recent failures,
    /// earlier last-failure as tie-break.
    pub fn pick_alternate(
        &self,
        candidates: &[Arc<Pipeline>],
        exclude: &HashSet<String>,
    ) -> Option<Arc<Pipeline>> {
        let mut available: Vec<&Arc<Pipeline>> = candidates
            .iter()
            .filter(|p| !exclude.contains(&p.id) && self.is_available(p))
            .collect();
        available.sort_by_key(|p| {
            let record = self.records.get(&p.id).map(|r| *r).unwrap_or_default();
            (record.consecutive_failures, record.last_failure_ms)
        });
        available.first().map(|p| Arc::clone(p))
    }

    /// Health record snapshot for one pipeline.
    #[must_use]
    pub fn record(&self, pipeline_id: &str) -> PipelineHealthRecord {
        self.records
            .get(pipeline_id)
            .map(|r| *r)
            .unwrap_or_default()
    }

    /// Clear a pipeline's record (operator reset).
    pub fn reset(&self, pipeline_id: &str) {
        self.records.remove(pipeline_id);
    }
}

/// Exponential cooldown: `base * 2^(failures-1)`, capped.
fn cooldown_for(consecutive_failures: u32, base: Duration, max: Duration) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(16);
    let factor = 2u32.saturating_pow(exponent);
    base.saturating_mul(factor).min(max)
}

#[allow(clippy::cast_possible_truncation)]
fn duration_millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

#[allow(clippy::cast_possible_truncation)]
fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
