//! Per-agent state
//!
//! One `AgentState` exists per agent instance and is owned exclusively by
//! that agent's controller task; it is never shared across threads.

use evo_core::{
    AgentId, AgentStatus, ChangePayload, EvolutionConfig, ExperimentId, Fingerprint, History,
    HistoryEntry, RecentFingerprints, ResourceSnapshot, TriggerContext,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A change in flight: proposed but not yet completed, failed, or discarded
#[derive(Debug, Clone)]
pub struct PendingChange {
    /// The change itself
    pub payload: ChangePayload,
    /// Content hash
    pub fingerprint: Fingerprint,
    /// What prompted it
    pub trigger: TriggerContext,
    /// Pre-change resource baseline (captured on the apply path)
    pub baseline: Option<ResourceSnapshot>,
    /// Previously applied code, kept for rollback
    pub previous: Option<ChangePayload>,
    /// Cycle at which the change left `Idle`
    pub started_cycle: u64,
    /// Sandbox experiment, when the change took the high-risk route
    pub experiment: Option<ExperimentId>,
    /// Set when the sandbox merged with adaptations
    pub low_confidence: bool,
    /// Whether a cluster reservation is held for the fingerprint
    pub reserved: bool,
}

/// A completed change whose delayed regression validation is outstanding
#[derive(Debug, Clone)]
pub struct ValidationWindow {
    /// Version the change produced
    pub version: u64,
    /// Content hash of the applied change
    pub fingerprint: Fingerprint,
    /// Pre-change baseline to compare against
    pub baseline: ResourceSnapshot,
    /// Code to resubmit if validation detects a regression
    pub previous: Option<ChangePayload>,
}

/// All mutable state of one agent's evolution loop
#[derive(Debug)]
pub struct AgentState {
    /// Stable identifier
    pub id: AgentId,
    /// Monotonic version, advanced on completed applies
    pub version: u64,
    /// Lifecycle status
    pub status: AgentStatus,
    /// Monotonic tick counter
    pub cycle: u64,
    /// Merged metric counters (`successes`/`failures` among them)
    pub metrics: HashMap<String, f64>,
    /// Last computed health score
    pub last_score: f64,
    /// The in-flight change, at most one
    pub pending: Option<PendingChange>,
    /// Completed changes awaiting delayed validation, keyed by version.
    /// Several can be outstanding when applies complete faster than the
    /// validation delay.
    pub validating: HashMap<u64, ValidationWindow>,
    /// Ring of survived changes
    pub history: History,
    /// Fingerprints suppressed shortly after success
    pub recents: RecentFingerprints,
    /// Cycle of the last validated improvement
    pub last_improvement_cycle: u64,
    /// Cycle of the last failed apply
    pub last_failure_cycle: u64,
    /// Reason set by `force_improvement`, consumed on the next tick
    pub force_requested: Option<String>,
    /// Last successfully applied payload (rollback source)
    pub current_code: Option<ChangePayload>,
}

impl AgentState {
    /// Fresh state for an agent
    #[must_use]
    pub fn new(id: AgentId, config: &EvolutionConfig) -> Self {
        Self {
            id,
            version: 0,
            status: AgentStatus::Idle,
            cycle: 0,
            metrics: HashMap::new(),
            last_score: 1.0,
            pending: None,
            validating: HashMap::new(),
            history: History::with_capacity(config.history_capacity),
            recents: RecentFingerprints::new(config.recent_cap, config.recent_trim_to),
            last_improvement_cycle: 0,
            last_failure_cycle: 0,
            force_requested: None,
            current_code: None,
        }
    }

    /// Whether a fingerprint is known anywhere it must not be re-applied
    /// from: the pending change, any outstanding validation window, or the
    /// recently-validated set. (The queue is checked by the controller.)
    #[must_use]
    pub fn knows_fingerprint(&self, fingerprint: &Fingerprint) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|p| &p.fingerprint == fingerprint)
            || self
                .validating
                .values()
                .any(|v| &v.fingerprint == fingerprint)
            || self.recents.contains(fingerprint)
    }

    /// Bump a metric counter
    pub fn bump_metric(&mut self, key: &str) {
        *self.metrics.entry(key.to_string()).or_insert(0.0) += 1.0;
    }

    /// Merge a metrics delta, key by key
    pub fn merge_metrics(&mut self, delta: HashMap<String, f64>) {
        for (key, value) in delta {
            self.metrics.insert(key, value);
        }
    }

    /// Record a survived change in the history ring
    pub fn record_history(&mut self, version: u64, trigger: TriggerContext) {
        self.history.push(HistoryEntry {
            version,
            completed_at: chrono::Utc::now(),
            cycle: self.cycle,
            trigger,
        });
    }
}

/// Read-only view of an agent's state for observability and testing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    /// Stable identifier
    pub id: AgentId,
    /// Current version
    pub version: u64,
    /// Lifecycle status
    pub status: AgentStatus,
    /// Tick counter
    pub cycle: u64,
    /// Metric counters
    pub metrics: HashMap<String, f64>,
    /// Last computed health score
    pub last_score: f64,
    /// Fingerprint of the in-flight change, if any
    pub pending_fingerprint: Option<Fingerprint>,
    /// Versions awaiting delayed validation, ascending
    pub validating_versions: Vec<u64>,
    /// Backlog length
    pub queue_len: usize,
    /// Survived-change history, oldest first
    pub history: Vec<HistoryEntry>,
    /// Size of the recently-validated fingerprint set
    pub recent_count: usize,
}
