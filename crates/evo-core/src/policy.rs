//! Decision policy
//!
//! Pure classification of the current situation into "do nothing", "apply
//! locally" (low risk) or "test in sandbox first" (high risk). The policy
//! never mutates state and never performs IO; the controller acts on the
//! returned decision.

use crate::config::PolicyConfig;
use crate::types::ChangePayload;
use std::collections::HashMap;

/// Metric key for the running success counter
pub const SUCCESSES: &str = "successes";
/// Metric key for the running failure counter
pub const FAILURES: &str = "failures";

/// What the policy wants the controller to do this tick
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Nothing to do; loop back to waiting
    Continue,
    /// Apply a low-risk change directly
    ProposeLocal(ChangePayload),
    /// Exercise a high-risk change in the sandbox first
    ProposeSandbox(ChangePayload),
}

/// Risk tier of a change payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskTier {
    /// Parameter-only tuning, safe to apply directly
    Local,
    /// Core-logic or wide-radius change, sandboxed first
    Sandboxed,
}

/// Inputs the policy reasons over
#[derive(Debug)]
pub struct PolicyInput<'a> {
    /// Current metric counters
    pub metrics: &'a HashMap<String, f64>,
    /// Current tick cycle
    pub cycle: u64,
    /// Cycle of the last validated improvement
    pub last_improvement_cycle: u64,
    /// Cycle of the last failed apply
    pub last_failure_cycle: u64,
    /// Explicit override: always yields an action
    pub force: bool,
}

/// Health score in [0, 1]: successes over total outcomes, 1.0 with no samples
#[must_use]
pub fn health_score(metrics: &HashMap<String, f64>) -> f64 {
    let successes = metrics.get(SUCCESSES).copied().unwrap_or(0.0);
    let failures = metrics.get(FAILURES).copied().unwrap_or(0.0);
    let total = successes + failures;
    if total <= 0.0 {
        1.0
    } else {
        successes / total
    }
}

/// Classify a payload's risk tier
///
/// Core-path targets and wide blast radii always route to the sandbox;
/// parameter-only tuning is local. Opaque raw payloads cannot be inspected
/// and are treated as code-level changes.
#[must_use]
pub fn classify_risk(payload: &ChangePayload, config: &PolicyConfig) -> RiskTier {
    if let Some(radius) = payload.field_u64("blast_radius") {
        if radius > config.max_blast_radius {
            return RiskTier::Sandboxed;
        }
    }
    if let Some(target) = payload.field_str("target") {
        if config
            .core_paths
            .iter()
            .any(|core| target == core || target.starts_with(&format!("{core}/")))
        {
            return RiskTier::Sandboxed;
        }
    }
    match payload.field_str("kind") {
        Some("parameters") => RiskTier::Local,
        _ => RiskTier::Sandboxed,
    }
}

/// Decide what to do this tick
#[must_use]
pub fn decide(input: &PolicyInput<'_>, config: &PolicyConfig) -> Decision {
    let score = health_score(input.metrics);
    let stagnation = input.cycle.saturating_sub(input.last_improvement_cycle);
    let score_low = score < config.score_floor;
    let stagnant = stagnation > config.stagnation_limit;

    if input.force {
        // Explicit override: act regardless of score or stagnation.
        return propose(tuning_payload(score, input.cycle), config);
    }

    // Hold off shortly after a failed apply.
    if input.last_failure_cycle > 0
        && input.cycle.saturating_sub(input.last_failure_cycle) < config.failure_cooldown
    {
        return Decision::Continue;
    }

    match (score_low, stagnant) {
        // Both justify action: prefer the less risky route.
        (true, true) | (true, false) => propose(tuning_payload(score, input.cycle), config),
        (false, true) => propose(exploration_payload(stagnation, input.cycle), config),
        (false, false) => Decision::Continue,
    }
}

fn propose(payload: ChangePayload, config: &PolicyConfig) -> Decision {
    match classify_risk(&payload, config) {
        RiskTier::Local => Decision::ProposeLocal(payload),
        RiskTier::Sandboxed => Decision::ProposeSandbox(payload),
    }
}

// Parameter-only tuning nudges runtime knobs toward the weak spot.
fn tuning_payload(score: f64, cycle: u64) -> ChangePayload {
    ChangePayload::Structured(serde_json::json!({
        "kind": "parameters",
        "target": "runtime/tuning",
        "score": score,
        "cycle": cycle,
    }))
}

// Stagnation exploration rewrites behavior, so it carries a code kind and
// is routed through the sandbox by classification.
fn exploration_payload(stagnation: u64, cycle: u64) -> ChangePayload {
    ChangePayload::Structured(serde_json::json!({
        "kind": "code",
        "target": "strategy/exploration",
        "stagnation": stagnation,
        "cycle": cycle,
    }))
}
