//! Shared test doubles for the evo workspace
//!
//! Deterministic, scriptable implementations of the controller's
//! collaborator traits, plus a tracing initializer for tests.

#![warn(unreachable_pub)]
#![allow(missing_docs)]

use async_trait::async_trait;
use evo_controller::{
    CodeValidator, LivePublisher, SandboxRequest, SandboxService, SnapshotProvider,
};
use evo_core::{AgentId, ChangePayload, EvolutionError, ExperimentId, ResourceSnapshot};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

pub use evo_core::MemoryQueueStore;

/// Install a test tracing subscriber once per process
pub fn init_tracing() {
    static INIT: Lazy<()> = Lazy::new(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
    Lazy::force(&INIT);
}

/// Validator that accepts everything, or rejects everything with a fixed
/// reason
pub struct StaticValidator {
    reject_with: Option<String>,
}

impl StaticValidator {
    /// Accept every payload
    #[must_use]
    pub fn accepting() -> Self {
        Self { reject_with: None }
    }

    /// Reject every payload with the given reason
    #[must_use]
    pub fn rejecting(reason: impl Into<String>) -> Self {
        Self {
            reject_with: Some(reason.into()),
        }
    }
}

impl CodeValidator for StaticValidator {
    fn validate(&self, _payload: &ChangePayload) -> Result<(), String> {
        match &self.reject_with {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }
}

/// Snapshot provider returning whatever the test last set
pub struct StubSnapshots {
    current: Mutex<ResourceSnapshot>,
}

impl StubSnapshots {
    /// Start from the given snapshot
    #[must_use]
    pub fn new(initial: ResourceSnapshot) -> Self {
        Self {
            current: Mutex::new(initial),
        }
    }

    /// Replace the snapshot subsequent calls will observe
    pub fn set(&self, snapshot: ResourceSnapshot) {
        *self.current.lock() = snapshot;
    }
}

impl SnapshotProvider for StubSnapshots {
    fn snapshot(&self) -> ResourceSnapshot {
        self.current.lock().clone()
    }
}

/// Publisher that records every enqueued change
///
/// Does not deliver completions on its own; tests drive
/// `AgentHandle::apply_completed` / `apply_failed` explicitly to keep
/// ordering deterministic.
#[derive(Default)]
pub struct ScriptedPublisher {
    enqueued: Mutex<Vec<(AgentId, ChangePayload, u64)>>,
    fail_with: Mutex<Option<String>>,
}

impl ScriptedPublisher {
    /// A publisher that accepts every enqueue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent enqueues fail with the given reason
    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.fail_with.lock() = Some(reason.into());
    }

    /// Everything enqueued so far, in order
    #[must_use]
    pub fn enqueued(&self) -> Vec<(AgentId, ChangePayload, u64)> {
        self.enqueued.lock().clone()
    }

    /// Version of the most recent enqueue
    #[must_use]
    pub fn last_version(&self) -> Option<u64> {
        self.enqueued.lock().last().map(|(_, _, v)| *v)
    }
}

#[async_trait]
impl LivePublisher for ScriptedPublisher {
    async fn enqueue(
        &self,
        agent: &AgentId,
        payload: &ChangePayload,
        version: u64,
    ) -> Result<(), EvolutionError> {
        if let Some(reason) = self.fail_with.lock().clone() {
            return Err(EvolutionError::CollaboratorUnreachable(reason));
        }
        self.enqueued
            .lock()
            .push((agent.clone(), payload.clone(), version));
        Ok(())
    }
}

/// Sandbox that records submissions and hands out experiment ids
///
/// Verdicts are delivered by the test through
/// `AgentHandle::sandbox_verdict`.
#[derive(Default)]
pub struct ScriptedSandbox {
    submitted: Mutex<Vec<SandboxRequest>>,
    experiments: Mutex<Vec<ExperimentId>>,
    fail_with: Mutex<Option<String>>,
}

impl ScriptedSandbox {
    /// A sandbox that accepts every submission
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent submissions fail with the given reason
    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.fail_with.lock() = Some(reason.into());
    }

    /// Every submitted request so far, in order
    #[must_use]
    pub fn submitted(&self) -> Vec<SandboxRequest> {
        self.submitted.lock().clone()
    }

    /// Experiment id of the most recent submission
    #[must_use]
    pub fn last_experiment(&self) -> Option<ExperimentId> {
        self.experiments.lock().last().copied()
    }
}

#[async_trait]
impl SandboxService for ScriptedSandbox {
    async fn submit(&self, request: SandboxRequest) -> Result<ExperimentId, EvolutionError> {
        if let Some(reason) = self.fail_with.lock().clone() {
            return Err(EvolutionError::CollaboratorUnreachable(reason));
        }
        let experiment = ExperimentId::new();
        self.submitted.lock().push(request);
        self.experiments.lock().push(experiment);
        Ok(experiment)
    }
}
