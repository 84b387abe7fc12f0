//! Evo Controller - per-agent evolution actor
//!
//! Drives the autonomous self-improvement loop for one agent replica:
//! - Tick-driven decision policy with risk routing
//! - Proposal intake with preflight validation and fingerprint dedup
//! - Cluster-wide reservation before any local apply
//! - Rate-limited, durable FIFO backlog
//! - Delayed regression validation with automatic rollback
//!
//! Each agent gets its own tokio task owning all of its state; interaction
//! happens through a cloneable [`AgentHandle`].

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod collaborators;
pub mod controller;
pub mod events;
pub mod state;

// Re-exports for convenience
pub use collaborators::{
    CodeValidator, LivePublisher, SandboxRequest, SandboxService, SandboxVerdict,
    SnapshotProvider, VerdictMetrics,
};
pub use controller::{AgentHandle, Collaborators, EvolutionController, ProposeOutcome};
pub use events::{channel, EventSink, EvolutionEvent};
pub use state::{AgentSnapshot, AgentState, PendingChange, ValidationWindow};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
