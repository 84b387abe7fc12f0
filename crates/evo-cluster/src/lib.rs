//! Evo Cluster - cluster-wide reservation table
//!
//! The sole cross-cluster synchronization point of the evolution loop: an
//! eventually-consistent record of "fingerprint F is being applied by agent
//! A". A reservation is TTL-bound and removed on explicit release or expiry,
//! whichever comes first; a holder that crashes before releasing simply
//! lets its record expire. Callers treat expiry identically to release.
//!
//! Replicas exchange their records and merge with a last-writer-wins rule:
//! a created record beats an absent one, and among concurrent creations for
//! the same key the earliest timestamp wins, ties broken by replica id.
//! That rule is what makes the at-most-once guarantee hold cluster-wide.

#![warn(unreachable_pub)]
#![allow(missing_docs)]

use dashmap::DashMap;
use evo_core::{AgentId, Fingerprint};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use ulid::Ulid;

/// Identifier of one replica of the reservation table
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(pub String);

impl ReplicaId {
    /// Generate a fresh replica id
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Composite reservation key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationKey {
    /// Agent applying the change
    pub agent: AgentId,
    /// Fingerprint of the change
    pub fingerprint: Fingerprint,
}

/// One reservation record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRecord {
    /// Replica that created the record
    pub holder: ReplicaId,
    /// Creation time, unix millis; the LWW merge timestamp
    pub created_at_ms: u64,
    /// Expiry time, unix millis
    pub expires_at_ms: u64,
}

impl ReservationRecord {
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }

    // First-writer-wins: earlier creation beats later; equal timestamps
    // fall back to replica-id ordering so exactly one replica wins.
    fn wins_over(&self, other: &Self) -> bool {
        (self.created_at_ms, &self.holder) < (other.created_at_ms, &other.holder)
    }
}

/// Replicated reservation table with TTL
#[derive(Debug)]
pub struct ReservationTable {
    replica: ReplicaId,
    ttl: Duration,
    records: DashMap<ReservationKey, ReservationRecord>,
}

impl ReservationTable {
    /// Create a table for this replica with the given reservation TTL
    #[must_use]
    pub fn new(replica: ReplicaId, ttl: Duration) -> Self {
        Self {
            replica,
            ttl,
            records: DashMap::new(),
        }
    }

    /// This replica's identifier
    #[inline]
    #[must_use]
    pub fn replica(&self) -> &ReplicaId {
        &self.replica
    }

    /// Try to reserve `(agent, fingerprint)`
    ///
    /// Returns `true` only if no unexpired record exists for the key at
    /// call time; the new record carries this table's TTL. The map entry is
    /// held exclusively for the duration of the check-and-insert, so
    /// concurrent callers on one replica see exactly one `true`.
    pub fn reserve(&self, agent: &AgentId, fingerprint: &Fingerprint) -> bool {
        let now = now_ms();
        let key = ReservationKey {
            agent: agent.clone(),
            fingerprint: fingerprint.clone(),
        };
        match self.records.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(self.fresh_record(now));
                    true
                } else {
                    tracing::debug!(
                        holder = %occupied.get().holder,
                        "reservation refused, key already held"
                    );
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(self.fresh_record(now));
                true
            }
        }
    }

    /// Remove a reservation immediately
    ///
    /// Called on completion, failure, or rollback. Releasing an absent or
    /// already-expired key is a no-op.
    pub fn release(&self, agent: &AgentId, fingerprint: &Fingerprint) {
        let key = ReservationKey {
            agent: agent.clone(),
            fingerprint: fingerprint.clone(),
        };
        self.records.remove(&key);
    }

    /// Whether an unexpired reservation exists for the key
    #[must_use]
    pub fn is_reserved(&self, agent: &AgentId, fingerprint: &Fingerprint) -> bool {
        let key = ReservationKey {
            agent: agent.clone(),
            fingerprint: fingerprint.clone(),
        };
        self.records
            .get(&key)
            .is_some_and(|record| !record.is_expired(now_ms()))
    }

    /// Drop all expired records
    pub fn purge_expired(&self) {
        let now = now_ms();
        self.records.retain(|_, record| !record.is_expired(now));
    }

    /// Export unexpired records for replica exchange
    #[must_use]
    pub fn export(&self) -> Vec<(ReservationKey, ReservationRecord)> {
        let now = now_ms();
        self.records
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Merge records received from another replica
    ///
    /// Created beats absent; for concurrent creations of the same key the
    /// first writer (timestamp, then replica id) wins. Expired remote
    /// records are ignored rather than resurrected.
    pub fn merge(&self, remote: impl IntoIterator<Item = (ReservationKey, ReservationRecord)>) {
        let now = now_ms();
        for (key, incoming) in remote {
            if incoming.is_expired(now) {
                continue;
            }
            match self.records.entry(key) {
                dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                    let local = occupied.get();
                    if local.is_expired(now) || incoming.wins_over(local) {
                        occupied.insert(incoming);
                    }
                }
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    vacant.insert(incoming);
                }
            }
        }
    }

    /// Number of live (unexpired) reservations
    #[must_use]
    pub fn len(&self) -> usize {
        let now = now_ms();
        self.records
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .count()
    }

    /// Whether no live reservations exist
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fresh_record(&self, now: u64) -> ReservationRecord {
        ReservationRecord {
            holder: self.replica.clone(),
            created_at_ms: now,
            expires_at_ms: now + self.ttl.as_millis() as u64,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
