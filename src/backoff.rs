//! Exponential backoff utility for polling intervals.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with configurable min/max.
///
/// Used while waiting for a freshly provisioned sandbox to publish its
/// first status file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExponentialBackoff {
    max: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    /// Creates a new backoff starting at `initial`, capping at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            max,
            current: initial,
        }
    }

    /// Returns the current backoff duration.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Advances to the next backoff interval (doubles, capped at max).
    pub fn next(&mut self) {
        self.current = (self.current * 2).min(self.max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn backoff_starts_at_initial() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(200), Duration::from_secs(5));
        assert_eq!(backoff.current(), Duration::from_millis(200));
    }

    #[test]
    fn backoff_doubles_on_next() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(200), Duration::from_secs(5));
        backoff.next();
        assert_eq!(backoff.current(), Duration::from_millis(400));
        backoff.next();
        assert_eq!(backoff.current(), Duration::from_millis(800));
    }

    #[test]
    fn backoff_caps_at_max() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(2), Duration::from_secs(5));
        backoff.next(); // 4s
        backoff.next(); // 8s -> capped to 5s
        assert_eq!(backoff.current(), Duration::from_secs(5));
    }
}
