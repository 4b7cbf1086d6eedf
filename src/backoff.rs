//! Exponential backoff for CI status polling.

use std::time::Duration;

use crate::config::CompletionConfig;

/// Poll delay that doubles after every attempt up to a ceiling.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    /// `max` below `initial` is raised to `initial`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Backoff between CI check polls as configured for task completion.
    pub fn for_ci(config: &CompletionConfig) -> Self {
        Self::new(
            Duration::from_secs(config.ci_poll_initial_secs),
            Duration::from_secs(config.ci_poll_max_secs),
        )
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Returns the delay to wait now and advances (doubling, capped at max).
    ///
    /// The returned delay never exceeds `remaining`, so a poll loop with a
    /// deadline wakes up in time to observe it.
    pub fn next_delay(&mut self, remaining: Duration) -> Duration {
        let delay = self.current.min(remaining);
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Starts over from the initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
