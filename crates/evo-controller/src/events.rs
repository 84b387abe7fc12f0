//! Telemetry events
//!
//! Everything observable about one agent's evolution loop flows through a
//! single event channel. Emission is best-effort: a closed or unread
//! channel never blocks or fails the actor.

use evo_core::{AgentId, ExperimentId, Fingerprint};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// One observable step of the evolution loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EvolutionEvent {
    /// Preflight validation rejected a proposal
    Invalid {
        agent: AgentId,
        reason: String,
        cycle: u64,
    },
    /// A proposal matched an already-known fingerprint and was dropped
    Duplicate {
        agent: AgentId,
        fingerprint: Fingerprint,
    },
    /// A proposal joined the durable backlog
    Queued {
        agent: AgentId,
        fingerprint: Fingerprint,
        queue_len: usize,
    },
    /// A change was handed to the live code publisher
    Applying {
        agent: AgentId,
        fingerprint: Fingerprint,
        target_version: u64,
    },
    /// The publisher confirmed the change; validation is scheduled
    Applied { agent: AgentId, version: u64 },
    /// The publisher reported failure
    ApplyFailed {
        agent: AgentId,
        reason: String,
        cycle: u64,
    },
    /// A high-risk change entered the sandbox
    SandboxSubmitted {
        agent: AgentId,
        experiment: ExperimentId,
        fingerprint: Fingerprint,
    },
    /// Delayed validation passed; the change is final
    Validated { agent: AgentId, version: u64 },
    /// A regression or sandbox verdict discarded a change
    Rollback {
        agent: AgentId,
        version: u64,
        reason: String,
    },
    /// Supervisory timeout fired for a change that never resolved
    Stuck {
        agent: AgentId,
        since_cycle: u64,
        cycle: u64,
    },
}

/// Sending half of the telemetry channel
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<EvolutionEvent>,
}

impl EventSink {
    /// Emit an event; drops it silently if nobody is listening
    pub fn emit(&self, event: EvolutionEvent) {
        let _ = self.tx.send(event);
    }

    /// A sink that discards everything (tests, headless deployments)
    #[must_use]
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }
}

/// Create a telemetry channel
#[must_use]
pub fn channel() -> (EventSink, mpsc::UnboundedReceiver<EvolutionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, rx)
}
