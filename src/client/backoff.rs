//! Exponential reconnect backoff.

use std::time::Duration;

/// `min(max, base * 2^retry)`, with the exponent clamped at `ceiling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Highest retry count; beyond it the delay no longer grows.
    pub ceiling: u32,
}

impl Backoff {
    /// Builds a backoff whose ceiling is the first exponent that reaches `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        let mut ceiling = 0;
        while ceiling < 31 && base.saturating_mul(1 << ceiling) < max {
            ceiling += 1;
        }
        Self { base, max, ceiling }
    }

    pub fn delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.min(self.ceiling).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}
