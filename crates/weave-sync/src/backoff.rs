//! Retry policy with exponential backoff and jitter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How failed syncs are retried.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the initial failure before giving up.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Upper bound (exclusive) of the random delay added to each retry.
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter_ms: 500,
        }
    }
}

impl RetryPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Draw a jitter value in `[0, jitter_ms)`.
    pub fn sample_jitter(&self) -> u64 {
        if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.jitter_ms)
        }
    }

    /// Delay before retry number `attempt` (zero-based), with fresh jitter.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        compute_backoff(attempt, self, self.sample_jitter())
    }
}

/// `min(base * 2^attempt + jitter, max)`.
pub fn compute_backoff(attempt: u32, policy: &RetryPolicy, jitter_ms: u64) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let delay = policy
        .base_delay_ms
        .saturating_mul(factor)
        .saturating_add(jitter_ms)
        .min(policy.max_delay_ms);
    Duration::from_millis(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            jitter_ms: 50,
        }
    }

    #[test]
    fn test_exponential_growth() {
        let p = policy();
        assert_eq!(compute_backoff(0, &p, 0), Duration::from_millis(100));
        assert_eq!(compute_backoff(1, &p, 0), Duration::from_millis(200));
        assert_eq!(compute_backoff(3, &p, 10), Duration::from_millis(810));
    }

    #[test]
    fn test_capped_at_max_delay() {
        let p = policy();
        assert_eq!(compute_backoff(10, &p, 0), p.max_delay());
        assert_eq!(compute_backoff(200, &p, 49), p.max_delay());
    }

    #[test]
    fn test_jitter_within_bounds() {
        let p = policy();
        for _ in 0..100 {
            assert!(p.sample_jitter() < p.jitter_ms);
        }
        let fixed = RetryPolicy { jitter_ms: 0, ..p };
        assert_eq!(fixed.sample_jitter(), 0);
    }

    proptest! {
        #[test]
        fn prop_delay_bounded_and_monotonic(attempt in 0u32..80, jitter in 0u64..50) {
            let p = policy();
            let delay = compute_backoff(attempt, &p, jitter);
            prop_assert!(delay <= p.max_delay());
            prop_assert!(compute_backoff(attempt + 1, &p, 0) >= compute_backoff(attempt, &p, 0));
        }
    }
}
