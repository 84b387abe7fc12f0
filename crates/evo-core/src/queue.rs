//! Durable change queue
//!
//! Ordered per-agent backlog of changes awaiting application. The queue is
//! persisted after every mutation so a restart reconstructs an equivalent
//! ordered queue from the last durable write.

use crate::error::EvolutionError;
use crate::types::{AgentId, Fingerprint, QueueEntry};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

/// Durable store backing queue persistence
///
/// Implementations must be safe for concurrent access from independent
/// agent actors. Both calls are expected to be fast and bounded.
pub trait DurableQueueStore: Send + Sync {
    /// Load the persisted queue for an agent (empty when none was saved)
    fn load(&self, agent: &AgentId) -> Result<Vec<QueueEntry>, EvolutionError>;
    /// Replace the persisted queue for an agent
    fn save(&self, agent: &AgentId, entries: &[QueueEntry]) -> Result<(), EvolutionError>;
}

/// FIFO backlog persisted on every mutation
pub struct ChangeQueue {
    agent: AgentId,
    entries: VecDeque<QueueEntry>,
    store: std::sync::Arc<dyn DurableQueueStore>,
}

impl ChangeQueue {
    /// Restore an agent's queue from the durable store
    pub fn restore(
        agent: AgentId,
        store: std::sync::Arc<dyn DurableQueueStore>,
    ) -> Result<Self, EvolutionError> {
        let entries = store.load(&agent)?.into();
        Ok(Self {
            agent,
            entries,
            store,
        })
    }

    /// Append an entry and persist
    pub fn push(&mut self, entry: QueueEntry) -> Result<(), EvolutionError> {
        self.entries.push_back(entry);
        self.persist()
    }

    /// Re-insert an entry at the front (rate-limited retry) and persist
    ///
    /// Preserves the relative order of the remaining entries.
    pub fn push_front(&mut self, entry: QueueEntry) -> Result<(), EvolutionError> {
        self.entries.push_front(entry);
        self.persist()
    }

    /// Remove and return the oldest entry, persisting the removal
    pub fn pop(&mut self) -> Result<Option<QueueEntry>, EvolutionError> {
        match self.entries.pop_front() {
            Some(entry) => {
                // On save failure the entry goes back where it was; the
                // in-memory queue never diverges from what the caller sees.
                if let Err(err) = self.persist() {
                    self.entries.push_front(entry);
                    return Err(err);
                }
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Whether any queued entry carries this fingerprint
    #[must_use]
    pub fn contains_fingerprint(&self, fingerprint: &Fingerprint) -> bool {
        self.entries.iter().any(|e| &e.fingerprint == fingerprint)
    }

    /// Number of queued entries
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the backlog is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries oldest-first
    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    fn persist(&self) -> Result<(), EvolutionError> {
        let entries: Vec<QueueEntry> = self.entries.iter().cloned().collect();
        self.store.save(&self.agent, &entries)
    }
}

/// In-memory durable store
///
/// Keeps the last saved queue per agent behind a mutex; dropping a
/// [`ChangeQueue`] and restoring from the same store models a crash where
/// the last durable write wins.
#[derive(Default)]
pub struct MemoryQueueStore {
    saved: Mutex<HashMap<AgentId, Vec<QueueEntry>>>,
    save_count: Mutex<u64>,
}

impl MemoryQueueStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of save calls observed (persistence-per-mutation checks)
    #[must_use]
    pub fn save_count(&self) -> u64 {
        *self.save_count.lock()
    }
}

impl DurableQueueStore for MemoryQueueStore {
    fn load(&self, agent: &AgentId) -> Result<Vec<QueueEntry>, EvolutionError> {
        Ok(self.saved.lock().get(agent).cloned().unwrap_or_default())
    }

    fn save(&self, agent: &AgentId, entries: &[QueueEntry]) -> Result<(), EvolutionError> {
        *self.save_count.lock() += 1;
        self.saved.lock().insert(agent.clone(), entries.to_vec());
        Ok(())
    }
}

/// File-backed durable store, one JSON document per agent
pub struct JsonFileQueueStore {
    root: PathBuf,
}

impl JsonFileQueueStore {
    /// Create a store rooted at `root` (created on first save)
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, agent: &AgentId) -> PathBuf {
        // Agent ids are caller-controlled; keep the filename safe.
        let safe: String = agent
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.root.join(format!("{safe}.queue.json"))
    }
}

impl DurableQueueStore for JsonFileQueueStore {
    fn load(&self, agent: &AgentId) -> Result<Vec<QueueEntry>, EvolutionError> {
        let path = self.path_for(agent);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let bytes = std::fs::read(&path).map_err(|e| EvolutionError::Store(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| EvolutionError::Store(e.to_string()))
    }

    fn save(&self, agent: &AgentId, entries: &[QueueEntry]) -> Result<(), EvolutionError> {
        std::fs::create_dir_all(&self.root).map_err(|e| EvolutionError::Store(e.to_string()))?;
        let path = self.path_for(agent);
        let tmp = path.with_extension("json.tmp");
        let bytes =
            serde_json::to_vec(entries).map_err(|e| EvolutionError::Store(e.to_string()))?;
        std::fs::write(&tmp, bytes).map_err(|e| EvolutionError::Store(e.to_string()))?;
        // Atomic replace so a crash mid-save leaves the previous document.
        std::fs::rename(&tmp, &path).map_err(|e| EvolutionError::Store(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangePayload, TriggerContext};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn entry(tag: &str) -> QueueEntry {
        QueueEntry {
            payload: ChangePayload::Raw(tag.to_string()),
            trigger: TriggerContext::new(tag, 1),
            fingerprint: Fingerprint(format!("fp-{tag}")),
            inserted_at: chrono::Utc::now(),
        }
    }

    fn tags(queue: &ChangeQueue) -> Vec<String> {
        queue
            .iter()
            .map(|e| e.trigger.reason.clone())
            .collect()
    }

    #[test]
    fn fifo_order_is_preserved() {
        let store = Arc::new(MemoryQueueStore::new());
        let mut queue = ChangeQueue::restore(AgentId::new("a"), store).unwrap();
        queue.push(entry("one")).unwrap();
        queue.push(entry("two")).unwrap();
        queue.push(entry("three")).unwrap();

        assert_eq!(queue.pop().unwrap().unwrap().trigger.reason, "one");
        assert_eq!(tags(&queue), vec!["two", "three"]);
    }

    #[test]
    fn push_front_after_denied_pop_preserves_remaining_order() {
        let store = Arc::new(MemoryQueueStore::new());
        let mut queue = ChangeQueue::restore(AgentId::new("a"), store).unwrap();
        for tag in ["one", "two", "three"] {
            queue.push(entry(tag)).unwrap();
        }

        // Rate limiter denied: the popped entry goes back to the front.
        let denied = queue.pop().unwrap().unwrap();
        queue.push_front(denied).unwrap();

        assert_eq!(tags(&queue), vec!["one", "two", "three"]);
    }

    #[test]
    fn every_mutation_persists() {
        let store = Arc::new(MemoryQueueStore::new());
        let mut queue = ChangeQueue::restore(AgentId::new("a"), store.clone()).unwrap();
        queue.push(entry("one")).unwrap();
        queue.push(entry("two")).unwrap();
        queue.pop().unwrap();
        let popped = queue.pop().unwrap().unwrap();
        queue.push_front(popped).unwrap();
        assert_eq!(store.save_count(), 5);
    }

    #[test]
    fn restore_reconstructs_the_saved_queue() {
        let store = Arc::new(MemoryQueueStore::new());
        let agent = AgentId::new("a");
        {
            let mut queue = ChangeQueue::restore(agent.clone(), store.clone()).unwrap();
            queue.push(entry("one")).unwrap();
            queue.push(entry("two")).unwrap();
            // Queue dropped here: simulated crash.
        }
        let restored = ChangeQueue::restore(agent, store).unwrap();
        assert_eq!(tags(&restored), vec!["one", "two"]);
    }

    #[test]
    fn crash_mid_mutation_keeps_the_last_durable_write() {
        let store = Arc::new(MemoryQueueStore::new());
        let agent = AgentId::new("a");
        let mut queue = ChangeQueue::restore(agent.clone(), store.clone()).unwrap();
        queue.push(entry("one")).unwrap();
        queue.push(entry("two")).unwrap();
        queue.pop().unwrap();
        drop(queue);

        let restored = ChangeQueue::restore(agent, store).unwrap();
        assert_eq!(tags(&restored), vec!["two"]);
    }

    #[test]
    fn fingerprint_lookup() {
        let store = Arc::new(MemoryQueueStore::new());
        let mut queue = ChangeQueue::restore(AgentId::new("a"), store).unwrap();
        queue.push(entry("one")).unwrap();
        assert!(queue.contains_fingerprint(&Fingerprint("fp-one".into())));
        assert!(!queue.contains_fingerprint(&Fingerprint("fp-two".into())));
    }

    #[test]
    fn file_store_round_trips_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let agent = AgentId::new("agent/1");
        {
            let store = Arc::new(JsonFileQueueStore::new(dir.path()));
            let mut queue = ChangeQueue::restore(agent.clone(), store).unwrap();
            queue.push(entry("one")).unwrap();
            queue.push(entry("two")).unwrap();
        }
        let store = Arc::new(JsonFileQueueStore::new(dir.path()));
        let restored = ChangeQueue::restore(agent, store).unwrap();
        assert_eq!(tags(&restored), vec!["one", "two"]);
    }
}
