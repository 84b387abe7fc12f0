//! Regression validation
//!
//! Compares a post-change resource snapshot against the pre-change baseline.
//! A violation of either configured threshold triggers rollback.

use crate::config::RegressionThresholds;
use crate::types::ResourceSnapshot;

/// Outcome of comparing current measurements to the baseline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegressionVerdict {
    /// Within thresholds
    Ok,
    /// Thresholds exceeded; the change must be rolled back
    Regression(String),
}

impl RegressionVerdict {
    /// Whether the change survived validation
    #[inline]
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Validate a post-change snapshot against its baseline
#[must_use]
pub fn validate(
    baseline: &ResourceSnapshot,
    current: &ResourceSnapshot,
    thresholds: &RegressionThresholds,
) -> RegressionVerdict {
    if baseline.memory > 0.0 && current.memory > baseline.memory * thresholds.memory_growth_factor {
        return RegressionVerdict::Regression(format!(
            "memory {} exceeds baseline {} x {}",
            current.memory, baseline.memory, thresholds.memory_growth_factor
        ));
    }
    if current.run_queue > baseline.run_queue + thresholds.run_queue_delta {
        return RegressionVerdict::Regression(format!(
            "run queue {} exceeds baseline {} + {}",
            current.run_queue, baseline.run_queue, thresholds.run_queue_delta
        ));
    }
    RegressionVerdict::Ok
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> RegressionThresholds {
        RegressionThresholds::default()
    }

    #[test]
    fn memory_over_factor_is_a_regression() {
        // 130 > 100 * 1.25
        let verdict = validate(
            &ResourceSnapshot::new(100.0, 10.0),
            &ResourceSnapshot::new(130.0, 10.0),
            &thresholds(),
        );
        assert!(matches!(verdict, RegressionVerdict::Regression(_)));
    }

    #[test]
    fn memory_within_factor_is_ok() {
        // 120 <= 125
        let verdict = validate(
            &ResourceSnapshot::new(100.0, 10.0),
            &ResourceSnapshot::new(120.0, 10.0),
            &thresholds(),
        );
        assert_eq!(verdict, RegressionVerdict::Ok);
    }

    #[test]
    fn run_queue_over_delta_is_a_regression() {
        let verdict = validate(
            &ResourceSnapshot::new(100.0, 10.0),
            &ResourceSnapshot::new(100.0, 61.0),
            &thresholds(),
        );
        assert!(matches!(verdict, RegressionVerdict::Regression(_)));
    }

    #[test]
    fn zero_memory_baseline_skips_the_memory_check() {
        let verdict = validate(
            &ResourceSnapshot::new(0.0, 10.0),
            &ResourceSnapshot::new(500.0, 10.0),
            &thresholds(),
        );
        assert_eq!(verdict, RegressionVerdict::Ok);
    }

    #[test]
    fn custom_thresholds_are_honored() {
        let custom = RegressionThresholds {
            memory_growth_factor: 2.0,
            run_queue_delta: 5.0,
        };
        let baseline = ResourceSnapshot::new(100.0, 10.0);
        assert_eq!(
            validate(&baseline, &ResourceSnapshot::new(150.0, 10.0), &custom),
            RegressionVerdict::Ok
        );
        assert!(matches!(
            validate(&baseline, &ResourceSnapshot::new(100.0, 16.0), &custom),
            RegressionVerdict::Regression(_)
        ));
    }
}
