//! Retry policy: classification glue and jittered exponential backoff.

use rand::Rng;
use std::time::Duration;

use relay_types::RelayError;

use crate::ExecutionConfig;

/// Backoff schedule for retryable failures.
///
/// Delay for retry k (1-based) is `base * multiplier^(k-1)`, capped, then
/// jittered by a uniform factor in [0.8, 1.2] and capped again, so the final
/// delay always lands inside `[0, max_delay]`. A `Retry-After` hint from the
/// upstream replaces the computed base.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            enabled: config.enable_retry,
            max_retries: config.max_retries,
            base_delay: config.retry_delay,
            multiplier: config.retry_multiplier,
            max_delay: config.max_retry_delay,
        }
    }

    /// Whether a failed attempt number `attempt` (1-based) may be retried.
    pub fn should_retry(&self, err: &RelayError, attempt: u32) -> bool {
        self.enabled && attempt <= self.max_retries && err.retryable()
    }

    /// Jittered delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let cap = self.max_delay.as_millis() as f64;
        let base = match hint {
            Some(hint) => hint.as_millis() as f64,
            None => {
                self.base_delay.as_millis() as f64
                    * self.multiplier.powi(attempt.saturating_sub(1) as i32)
            }
        };
        let capped = base.min(cap);
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        Duration::from_millis((capped * jitter).min(cap) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            enabled: true,
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(1000),
        }
    }

    #[test]
    fn delay_stays_inside_the_jitter_envelope() {
        let policy = policy();
        for attempt in 1..=3u32 {
            let nominal = 100.0 * 2.0f64.powi(attempt as i32 - 1);
            for _ in 0..200 {
                let delay = policy.delay_for(attempt, None).as_millis() as f64;
                assert!(delay >= (nominal * 0.8).floor(), "attempt {attempt}: {delay}");
                assert!(delay <= (nominal * 1.2).min(1000.0), "attempt {attempt}: {delay}");
            }
        }
    }

    #[test]
    fn delay_never_exceeds_the_cap() {
        let policy = policy();
        for _ in 0..200 {
            // attempt 10 would nominally be 51_200ms
            assert!(policy.delay_for(10, None) <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn retry_after_hint_replaces_the_schedule() {
        let policy = policy();
        for _ in 0..50 {
            let delay = policy.delay_for(1, Some(Duration::from_millis(500)));
            let ms = delay.as_millis() as f64;
            assert!((400.0..=600.0).contains(&ms));
        }
    }

    #[test]
    fn classification_gates_retries() {
        let policy = policy();
        let transient = RelayError::Network("reset".into());
        let terminal = RelayError::Cancelled;
        assert!(policy.should_retry(&transient, 1));
        assert!(policy.should_retry(&transient, 3));
        assert!(!policy.should_retry(&transient, 4));
        assert!(!policy.should_retry(&terminal, 1));

        let disabled = RetryPolicy {
            enabled: false,
            ..policy
        };
        assert!(!disabled.should_retry(&transient, 1));
    }
}
