//! Exponential backoff used by reconnect and retry loops.

use std::time::Duration;

/// Default multiplier for exponential backoff.
pub const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Tracks the current delay of a retry loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: BACKOFF_MULTIPLIER,
            current: initial,
            attempts: 0,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Returns the delay to wait now and grows the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(
            Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier),
            self.max,
        );
        self.attempts += 1;
        delay
    }

    /// Resets after a successful attempt.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    /// Failed attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
