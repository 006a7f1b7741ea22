//! Consecutive-failure tracking for reconnect backoff.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffPolicy;

/// Failure count and current delay, reset whenever the link proves healthy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryBudget {
    failures: u32,
    current_delay: Duration,
}

impl RetryBudget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure and returns the delay to wait before the next attempt.
    pub fn record_failure(&mut self, policy: &BackoffPolicy) -> Duration {
        let sample: f64 = rand::thread_rng().r#gen();
        self.record_failure_with(policy, sample)
    }

    /// Same as `record_failure` with an explicit jitter sample in `[0, 1)`.
    ///
    /// The returned delay never drops below the previous one, even when the
    /// jitter span is wider than the growth factor.
    pub fn record_failure_with(&mut self, policy: &BackoffPolicy, sample: f64) -> Duration {
        let computed = policy.delay_for(self.failures, sample);
        self.current_delay = computed.max(self.current_delay).min(policy.max);
        self.failures = self.failures.saturating_add(1);
        self.current_delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.current_delay = Duration::ZERO;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(80),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }

    #[test]
    fn test_delays_are_non_decreasing_up_to_cap() {
        let policy = policy();
        let mut budget = RetryBudget::new();
        let mut previous = Duration::ZERO;
        for _ in 0..20 {
            let delay = budget.record_failure(&policy);
            assert!(delay >= previous, "{:?} < {:?}", delay, previous);
            assert!(delay <= policy.max);
            previous = delay;
        }
        assert_eq!(budget.failures(), 20);
        assert_eq!(previous, policy.max);
    }

    #[test]
    fn test_reset_starts_over() {
        let policy = policy();
        let mut budget = RetryBudget::new();
        budget.record_failure_with(&policy, 0.0);
        budget.record_failure_with(&policy, 0.0);
        assert_eq!(budget.current_delay(), Duration::from_millis(20));

        budget.reset();
        assert_eq!(budget, RetryBudget::new());
        assert_eq!(
            budget.record_failure_with(&policy, 0.0),
            Duration::from_millis(10)
        );
    }

    #[test]
    fn test_jitter_stays_within_fraction() {
        let policy = policy();
        let mut budget = RetryBudget::new();
        let delay = budget.record_failure_with(&policy, 0.999);
        assert!(delay >= Duration::from_millis(10));
        assert!(delay < Duration::from_micros(12_500));
    }

    #[test]
    fn test_flat_multiplier_with_wide_jitter_never_decreases() {
        let policy = BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 1.0,
            jitter: 0.5,
        };
        assert_eq!(policy.validate(), Ok(()));

        let mut budget = RetryBudget::new();
        let first = budget.record_failure_with(&policy, 0.9);
        let second = budget.record_failure_with(&policy, 0.0);
        assert!(first > Duration::from_millis(140), "{:?}", first);
        assert!(second >= first, "{:?} -> {:?}", first, second);

        let mut previous = second;
        for sample in [0.3, 0.0, 0.99, 0.1, 0.0] {
            let delay = budget.record_failure_with(&policy, sample);
            assert!(delay >= previous, "{:?} -> {:?}", previous, delay);
            assert!(delay <= policy.max);
            previous = delay;
        }
    }
}
