//! Evo Core - evolution controller building blocks
//!
//! Pure and self-contained pieces of the self-improvement loop:
//! - Data model (agent identity, payloads, history, recent fingerprints)
//! - Payload fingerprinting with canonical hashing
//! - Decision policy (health score, stagnation, risk routing)
//! - Per-agent rate limiting
//! - Regression validation against a resource baseline
//! - Durable FIFO change queue
//!
//! # Example
//!
//! ```rust
//! use evo_core::{fingerprint, ChangePayload};
//!
//! let a = ChangePayload::Structured(serde_json::json!({"x": 1, "y": 2}));
//! let b = ChangePayload::Structured(serde_json::json!({"y": 2, "x": 1}));
//! assert_eq!(fingerprint::fingerprint(&a), fingerprint::fingerprint(&b));
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod limiter;
pub mod policy;
pub mod queue;
pub mod regression;
pub mod types;

// Re-exports for convenience
pub use config::{EvolutionConfig, PolicyConfig, RegressionThresholds};
pub use error::EvolutionError;
pub use limiter::RateLimiter;
pub use policy::{classify_risk, decide, health_score, Decision, PolicyInput, RiskTier};
pub use queue::{ChangeQueue, DurableQueueStore, JsonFileQueueStore, MemoryQueueStore};
pub use regression::{validate, RegressionVerdict};
pub use types::{
    AgentId, AgentStatus, ChangePayload, ExperimentId, Fingerprint, History, HistoryEntry,
    QueueEntry, RecentFingerprints, ResourceSnapshot, TriggerContext,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
