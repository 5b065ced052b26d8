//! # Exponential Backoff
//!
//! Retry delays for failed reconciles: `base * 2^failures`, capped at a
//! maximum. The stateful [`ExponentialBackoff`] is used for re-opening broken
//! watches; [`ItemBackoff`] keeps one failure counter per work-queue key.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Exponential backoff calculator
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay after the first failure
    base: Duration,
    /// Upper bound on any delay
    max: Duration,
    /// Consecutive failures seen so far
    failures: u32,
}

impl ExponentialBackoff {
    /// Create a backoff starting at `base` and capped at `max`
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let delay = Self::calculate_for_error_count(self.failures, self.base, self.max);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures recorded since the last reset
    #[must_use]
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Calculate the backoff duration for a given error count (stateless)
    ///
    /// `error_count` is 0-indexed: the first retry waits `base`, the second
    /// `2 * base`, and so on, capped at `max`.
    #[must_use]
    pub fn calculate_for_error_count(error_count: u32, base: Duration, max: Duration) -> Duration {
        let factor = 1u32.checked_shl(error_count).unwrap_or(u32::MAX);
        base.checked_mul(factor).map_or(max, |delay| delay.min(max))
    }
}

/// Per-key failure counters for the work queue's rate limiter.
#[derive(Debug)]
pub struct ItemBackoff<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> ItemBackoff<K> {
    /// Creates a limiter with the given bounds.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Records a failure of `key` and returns how long to wait before retrying.
    pub fn next_delay(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(key.clone()).or_insert(0);
        let delay = ExponentialBackoff::calculate_for_error_count(*count, self.base, self.max);
        *count = count.saturating_add(1);
        delay
    }

    /// Clears the failure history of `key`.
    pub fn forget(&self, key: &K) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Failures recorded for `key` since it last succeeded.
    pub fn failures(&self, key: &K) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(5), Duration::from_secs(300));

        assert_eq!(backoff.next_backoff(), Duration::from_millis(5));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(10));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(20));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(40));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(80));
        assert_eq!(backoff.failures(), 5);
    }

    #[test]
    fn test_exponential_backoff_max_cap() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10));

        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(4));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(8));
        // Next would be 16s, but should be capped at 10s
        assert_eq!(backoff.next_backoff(), Duration::from_secs(10));
        // Should stay at max
        assert_eq!(backoff.next_backoff(), Duration::from_secs(10));
    }

    #[test]
    fn test_exponential_backoff_reset() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10));

        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(2));

        backoff.reset();

        // Should restart from beginning after success
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
    }

    #[test]
    fn test_calculate_for_error_count_saturates() {
        let max = Duration::from_secs(300);
        assert_eq!(
            ExponentialBackoff::calculate_for_error_count(0, Duration::from_millis(5), max),
            Duration::from_millis(5)
        );
        assert_eq!(
            ExponentialBackoff::calculate_for_error_count(64, Duration::from_millis(5), max),
            max
        );
        assert_eq!(
            ExponentialBackoff::calculate_for_error_count(u32::MAX, Duration::from_secs(1), max),
            max
        );
    }

    #[test]
    fn test_item_backoff_per_key() {
        let backoff = ItemBackoff::new(Duration::from_millis(5), Duration::from_secs(1));

        assert_eq!(backoff.next_delay(&"a"), Duration::from_millis(5));
        assert_eq!(backoff.next_delay(&"a"), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(&"b"), Duration::from_millis(5));
        assert_eq!(backoff.failures(&"a"), 2);

        backoff.forget(&"a");
        assert_eq!(backoff.failures(&"a"), 0);
        assert_eq!(backoff.next_delay(&"a"), Duration::from_millis(5));
    }
}
