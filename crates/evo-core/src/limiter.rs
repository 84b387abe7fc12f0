//! Per-agent rate limiting
//!
//! Sliding-window admission control for apply attempts. Denied attempts are
//! queued by the caller, never dropped.

use crate::types::AgentId;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sliding-window limiter keyed by agent
#[derive(Debug)]
pub struct RateLimiter {
    max_attempts: u32,
    window: Duration,
    windows: DashMap<AgentId, VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a limiter admitting `max_attempts` per `window` per agent
    #[must_use]
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            windows: DashMap::new(),
        }
    }

    /// Whether an apply attempt is admitted now; admits record an attempt
    pub fn allow(&self, agent: &AgentId) -> bool {
        let now = Instant::now();
        let mut entry = self.windows.entry(agent.clone()).or_default();
        while let Some(front) = entry.front() {
            if now.duration_since(*front) > self.window {
                entry.pop_front();
            } else {
                break;
            }
        }
        if entry.len() < self.max_attempts as usize {
            entry.push_back(now);
            true
        } else {
            false
        }
    }

    /// Clear an agent's window (used after rollback so the retry of the
    /// reverted code is not penalized for the failed attempt)
    pub fn reset(&self, agent: &AgentId) {
        self.windows.remove(agent);
    }
}
