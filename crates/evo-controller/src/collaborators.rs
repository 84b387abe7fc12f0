//! External collaborator interfaces
//!
//! The controller composes with four out-of-scope services through these
//! traits. The synchronous two are required to be fast and bounded; the
//! asynchronous two follow a request/callback contract: the request call
//! returns promptly and the eventual outcome arrives as a message on the
//! agent's mailbox (see [`crate::AgentHandle`]).

use async_trait::async_trait;
use evo_core::{AgentId, ChangePayload, EvolutionError, ExperimentId, Fingerprint, ResourceSnapshot, TriggerContext};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Static change validator
///
/// Synchronous and side-effect free; called as preflight on every proposal.
pub trait CodeValidator: Send + Sync {
    /// Accept or reject a payload before it is queued or applied
    fn validate(&self, payload: &ChangePayload) -> Result<(), String>;
}

/// Resource-snapshot provider used for regression comparison
///
/// Synchronous and cheap; called once to capture a baseline and once per
/// delayed validation.
pub trait SnapshotProvider: Send + Sync {
    /// Current resource measurements
    fn snapshot(&self) -> ResourceSnapshot;
}

/// Component that loads a validated change into a running process
///
/// `enqueue` must only hand the payload off; the publisher later delivers
/// exactly one completion or failure through
/// [`crate::AgentHandle::apply_completed`] /
/// [`crate::AgentHandle::apply_failed`].
#[async_trait]
pub trait LivePublisher: Send + Sync {
    /// Hand a change to the publisher for version `version`
    async fn enqueue(
        &self,
        agent: &AgentId,
        payload: &ChangePayload,
        version: u64,
    ) -> Result<(), EvolutionError>;
}

/// Isolated execution service for high-risk changes
///
/// `submit` returns the experiment id promptly; the verdict later arrives
/// through [`crate::AgentHandle::sandbox_verdict`].
#[async_trait]
pub trait SandboxService: Send + Sync {
    /// Submit an experiment for isolated execution
    async fn submit(&self, request: SandboxRequest) -> Result<ExperimentId, EvolutionError>;
}

/// What the sandbox asked the controller to do with an experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxVerdict {
    /// Apply the change as-is
    Merge,
    /// Apply the change, adapted by the sandbox (lower confidence)
    MergeWithAdaptations,
    /// Discard the change
    Rollback,
}

/// Experiment submission payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRequest {
    /// Agent the change belongs to
    pub agent: AgentId,
    /// The change under test
    pub payload: ChangePayload,
    /// Content hash of the change
    pub fingerprint: Fingerprint,
    /// What prompted the change
    pub trigger: TriggerContext,
}

/// Metrics reported alongside a sandbox verdict
pub type VerdictMetrics = HashMap<String, f64>;
