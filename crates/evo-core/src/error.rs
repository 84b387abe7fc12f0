//! Error taxonomy for the evolution controller
//!
//! Nothing here is fatal to the process: a failed or regressed change
//! always returns the agent to `Idle` and the loop continues.

use crate::types::Fingerprint;

/// Main evolution error type
#[derive(Debug, Clone, thiserror::Error)]
pub enum EvolutionError {
    /// Preflight validation failed; the payload is never queued or retried
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The fingerprint is already pending, queued, or recently validated
    #[error("duplicate change: {0}")]
    Duplicate(Fingerprint),

    /// A collaborator reported an application failure
    #[error("apply failed: {0}")]
    ApplyFailed(String),

    /// Post-change measurement exceeded configured thresholds
    #[error("regression detected: {0}")]
    RegressionDetected(String),

    /// A collaborator could not be reached
    #[error("collaborator unreachable: {0}")]
    CollaboratorUnreachable(String),

    /// The durable queue store failed
    #[error("queue store error: {0}")]
    Store(String),

    /// The agent's mailbox is gone (controller task stopped)
    #[error("agent mailbox closed")]
    MailboxClosed,
}

impl EvolutionError {
    /// Whether the same operation may reasonably be attempted again
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ApplyFailed(_) | Self::CollaboratorUnreachable(_) | Self::Store(_)
        )
    }

    /// Whether this is an expected control-flow outcome rather than a fault
    #[inline]
    #[must_use]
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::Duplicate(_) | Self::RegressionDetected(_))
    }
}
