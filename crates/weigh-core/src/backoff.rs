//! Capped exponential backoff for reconnection.

use std::time::Duration;

/// Delay before reconnection attempt `attempt` (1-based):
/// `initial * 2^(attempt - 1)`, never more than `max`.
pub fn retry_delay(initial: Duration, max: Duration, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let shift = attempt.saturating_sub(1).min(31);
    initial.saturating_mul(1u32 << shift).min(max)
}

/// Stateful backoff: each failure lengthens the next delay, a success
/// resets it.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempt: 0,
        }
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        retry_delay(self.initial, self.max, self.attempt)
    }

    /// Failures since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
