//! # Fibonacci Backoff
//!
//! Requeue delays for failed reconciliations grow along the Fibonacci
//! sequence in whole minutes: 1m, 1m, 2m, 3m, 5m, 8m, then capped at 10m.
//! Each KubemarkMachine keeps its own sequence, reset after a successful pass.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

const MIN_MINUTES: u64 = 1;
const MAX_MINUTES: u64 = 10;

/// Fibonacci backoff calculator
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_minutes: u64,
    max_minutes: u64,
    prev_minutes: u64,
    current_minutes: u64,
}

impl FibonacciBackoff {
    /// Sequence starting at `min_minutes` and capped at `max_minutes`
    #[must_use]
    pub fn new(min_minutes: u64, max_minutes: u64) -> Self {
        Self {
            min_minutes,
            max_minutes,
            prev_minutes: 0,
            current_minutes: min_minutes,
        }
    }

    /// Current delay; advances the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let delay = Duration::from_secs(self.current_minutes * 60);
        let next_minutes = self.prev_minutes + self.current_minutes;
        self.prev_minutes = self.current_minutes;
        self.current_minutes = next_minutes.min(self.max_minutes);
        delay
    }

    /// Start the sequence over
    pub fn reset(&mut self) {
        self.prev_minutes = 0;
        self.current_minutes = self.min_minutes;
    }
}

impl Default for FibonacciBackoff {
    fn default() -> Self {
        Self::new(MIN_MINUTES, MAX_MINUTES)
    }
}

/// Per-object backoff sequences (`namespace/name` -> backoff)
#[derive(Debug, Default)]
pub struct BackoffTracker {
    states: Mutex<HashMap<String, FibonacciBackoff>>,
}

impl BackoffTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay before retrying `key` after another failure
    pub fn next_delay(&self, key: &str) -> Duration {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .next_backoff()
    }

    /// Forget the failure history of `key`
    pub fn reset(&self, key: &str) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minutes(m: u64) -> Duration {
        Duration::from_secs(m * 60)
    }

    #[test]
    fn test_fibonacci_backoff_sequence() {
        let mut backoff = FibonacciBackoff::default();

        // 1m, 1m, 2m, 3m, 5m, 8m, 10m (max)
        for expected in [1, 1, 2, 3, 5, 8, 10, 10, 10] {
            assert_eq!(backoff.next_backoff(), minutes(expected));
        }
    }

    #[test]
    fn test_fibonacci_backoff_reset() {
        let mut backoff = FibonacciBackoff::new(1, 10);
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.next_backoff();

        backoff.reset();

        assert_eq!(backoff.next_backoff(), minutes(1));
        assert_eq!(backoff.next_backoff(), minutes(1));
        assert_eq!(backoff.next_backoff(), minutes(2));
    }

    #[test]
    fn test_tracker_keeps_sequences_per_key() {
        let tracker = BackoffTracker::new();

        assert_eq!(tracker.next_delay("default/km-1"), minutes(1));
        assert_eq!(tracker.next_delay("default/km-1"), minutes(1));
        assert_eq!(tracker.next_delay("default/km-1"), minutes(2));
        assert_eq!(tracker.next_delay("default/km-2"), minutes(1));

        tracker.reset("default/km-1");
        assert_eq!(tracker.next_delay("default/km-1"), minutes(1));
    }
}
