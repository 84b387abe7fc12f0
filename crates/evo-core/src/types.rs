//! Core types for the evolution controller
//!
//! Defines the fundamental types shared across the workspace:
//! - Agent and fingerprint identifiers
//! - Change payloads and trigger contexts
//! - Per-agent state fragments (history ring, recent-fingerprint set)
//! - Resource snapshots used for regression comparison

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use ulid::Ulid;

/// Stable agent identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    /// Create an agent id from any string-like value
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable content hash identifying a change payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    /// Borrow the raw hash string
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sandbox experiment identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExperimentId(pub Ulid);

impl ExperimentId {
    /// Generate a new experiment id
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ExperimentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A self-generated change awaiting application
///
/// Structured payloads carry machine-readable fields that the decision
/// policy inspects for risk routing (`kind`, `target`, `blast_radius`).
/// Raw payloads are opaque text and are fingerprinted byte-for-byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangePayload {
    /// Machine-readable change description
    Structured(serde_json::Value),
    /// Opaque text (e.g. a source diff)
    Raw(String),
}

impl ChangePayload {
    /// String value of a top-level field, when the payload is structured
    #[must_use]
    pub fn field_str(&self, key: &str) -> Option<&str> {
        match self {
            Self::Structured(value) => value.get(key)?.as_str(),
            Self::Raw(_) => None,
        }
    }

    /// Numeric value of a top-level field, when the payload is structured
    #[must_use]
    pub fn field_u64(&self, key: &str) -> Option<u64> {
        match self {
            Self::Structured(value) => value.get(key)?.as_u64(),
            Self::Raw(_) => None,
        }
    }
}

/// Why a change was proposed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerContext {
    /// Human-readable reason
    pub reason: String,
    /// Tick cycle at which the trigger fired
    pub cycle: u64,
    /// Whether the proposal bypassed score/stagnation gating
    pub forced: bool,
}

impl TriggerContext {
    /// Create a trigger context
    #[inline]
    pub fn new(reason: impl Into<String>, cycle: u64) -> Self {
        Self {
            reason: reason.into(),
            cycle,
            forced: false,
        }
    }

    /// Mark the trigger as forced
    #[inline]
    #[must_use]
    pub fn forced(mut self) -> Self {
        self.forced = true;
        self
    }
}

/// Lifecycle status of one agent's controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    /// Waiting for the next tick or proposal
    Idle,
    /// A change is in flight at the live code publisher
    Applying,
    /// A high-risk change is being exercised in the sandbox
    AwaitingSandbox,
}

/// Point-in-time resource measurement used for regression comparison
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Resident memory, in whatever unit the provider reports (must be
    /// consistent between baseline and current)
    pub memory: f64,
    /// Scheduler run-queue length
    pub run_queue: f64,
    /// Additional provider-specific measurements
    #[serde(default)]
    pub extra: HashMap<String, f64>,
}

impl ResourceSnapshot {
    /// Snapshot with just the two threshold-checked dimensions
    #[inline]
    #[must_use]
    pub fn new(memory: f64, run_queue: f64) -> Self {
        Self {
            memory,
            run_queue,
            extra: HashMap::new(),
        }
    }
}

/// One completed-and-survived change in an agent's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Version the agent reached with this change
    pub version: u64,
    /// Completion time
    pub completed_at: chrono::DateTime<chrono::Utc>,
    /// Tick cycle at completion
    pub cycle: u64,
    /// What prompted the change
    pub trigger: TriggerContext,
}

/// Bounded ring buffer of history entries, oldest evicted first
#[derive(Debug, Clone, Default)]
pub struct History {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl History {
    /// Create a history ring with the given capacity
    #[inline]
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record an entry, evicting the oldest when full
    pub fn push(&mut self, entry: HistoryEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Number of retained entries
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ring is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate oldest-first
    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// Most recent entry
    #[inline]
    #[must_use]
    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }
}

/// Bounded set of fingerprints that recently survived validation
///
/// Suppresses re-proposal of a change shortly after it succeeded. When the
/// set exceeds `cap` it is trimmed, oldest insertions first, down to
/// `trim_to`.
#[derive(Debug, Clone)]
pub struct RecentFingerprints {
    order: VecDeque<Fingerprint>,
    set: HashSet<Fingerprint>,
    cap: usize,
    trim_to: usize,
}

impl RecentFingerprints {
    /// Create with explicit bounds
    #[must_use]
    pub fn new(cap: usize, trim_to: usize) -> Self {
        debug_assert!(trim_to <= cap);
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            cap,
            trim_to,
        }
    }

    /// Record a validated fingerprint, trimming on overflow
    pub fn insert(&mut self, fingerprint: Fingerprint) {
        if self.set.insert(fingerprint.clone()) {
            self.order.push_back(fingerprint);
        }
        if self.set.len() > self.cap {
            while self.set.len() > self.trim_to {
                if let Some(evicted) = self.order.pop_front() {
                    self.set.remove(&evicted);
                } else {
                    break;
                }
            }
        }
    }

    /// Whether a fingerprint was recently validated
    #[inline]
    #[must_use]
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.set.contains(fingerprint)
    }

    /// Number of retained fingerprints
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Whether the set is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

impl Default for RecentFingerprints {
    fn default() -> Self {
        Self::new(500, 400)
    }
}

/// Durable backlog entry awaiting application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// The change itself
    pub payload: ChangePayload,
    /// What prompted it
    pub trigger: TriggerContext,
    /// Content hash, computed at enqueue time
    pub fingerprint: Fingerprint,
    /// Enqueue time
    pub inserted_at: chrono::DateTime<chrono::Utc>,
}
