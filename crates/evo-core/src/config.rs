//! Controller configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning knobs for one agent's evolution controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionConfig {
    /// Tick period driving the decision loop
    pub tick_interval_ms: u64,
    /// Delay between a successful apply and its regression validation
    pub validation_delay_ms: u64,
    /// Reservation time-to-live
    pub reservation_ttl_ms: u64,
    /// Backoff before retrying a rate-limited queue entry
    pub retry_backoff_ms: u64,
    /// Apply attempts admitted per agent within the limiter window
    pub rate_limit_max: u32,
    /// Rate limiter window
    pub rate_limit_window_ms: u64,
    /// History ring capacity
    pub history_capacity: usize,
    /// Recent-fingerprint set cap
    pub recent_cap: usize,
    /// Recent-fingerprint trim target on overflow
    pub recent_trim_to: usize,
    /// Ticks after which a pending change with no completion or verdict is
    /// failed by supervision
    pub stuck_after_ticks: u64,
    /// Decision policy tuning
    pub policy: PolicyConfig,
    /// Regression thresholds
    pub thresholds: RegressionThresholds,
}

impl EvolutionConfig {
    /// Create the default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With a custom tick period
    #[inline]
    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = interval.as_millis() as u64;
        self
    }

    /// With a custom validation delay
    #[inline]
    #[must_use]
    pub fn with_validation_delay(mut self, delay: Duration) -> Self {
        self.validation_delay_ms = delay.as_millis() as u64;
        self
    }

    /// With a custom rate limit
    #[inline]
    #[must_use]
    pub fn with_rate_limit(mut self, max: u32, window: Duration) -> Self {
        self.rate_limit_max = max;
        self.rate_limit_window_ms = window.as_millis() as u64;
        self
    }

    /// With custom regression thresholds
    #[inline]
    #[must_use]
    pub fn with_thresholds(mut self, thresholds: RegressionThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// With a custom supervisory timeout, in ticks
    #[inline]
    #[must_use]
    pub fn with_stuck_after_ticks(mut self, ticks: u64) -> Self {
        self.stuck_after_ticks = ticks;
        self
    }

    /// Tick period as a [`Duration`]
    #[inline]
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Validation delay as a [`Duration`]
    #[inline]
    #[must_use]
    pub fn validation_delay(&self) -> Duration {
        Duration::from_millis(self.validation_delay_ms)
    }

    /// Queue retry backoff as a [`Duration`]
    #[inline]
    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5_000,
            validation_delay_ms: 30_000,
            reservation_ttl_ms: 60_000,
            retry_backoff_ms: 5_000,
            rate_limit_max: 3,
            rate_limit_window_ms: 60_000,
            history_capacity: 25,
            recent_cap: 500,
            recent_trim_to: 400,
            stuck_after_ticks: 24,
            policy: PolicyConfig::default(),
            thresholds: RegressionThresholds::default(),
        }
    }
}

/// Decision policy tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Health score below which a tuning change is proposed
    pub score_floor: f64,
    /// Cycles without improvement after which exploration is proposed
    pub stagnation_limit: u64,
    /// Cycles to hold off after a failed apply, unless forced
    pub failure_cooldown: u64,
    /// Target prefixes considered core control logic (always sandboxed)
    pub core_paths: Vec<String>,
    /// Blast radius above which a change is always sandboxed
    pub max_blast_radius: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            score_floor: 0.7,
            stagnation_limit: 20,
            failure_cooldown: 3,
            core_paths: vec![
                "controller".to_string(),
                "policy".to_string(),
                "supervisor".to_string(),
            ],
            max_blast_radius: 200,
        }
    }
}

/// Regression thresholds for post-change validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionThresholds {
    /// Regression when `current.memory > baseline.memory * factor`
    pub memory_growth_factor: f64,
    /// Regression when `current.run_queue > baseline.run_queue + delta`
    pub run_queue_delta: f64,
}

impl Default for RegressionThresholds {
    fn default() -> Self {
        Self {
            memory_growth_factor: 1.25,
            run_queue_delta: 50.0,
        }
    }
}
