//! Restart backoff for Optimistic-Retry sessions.

use std::time::Duration;

/// Delay between a lost race and the next pass.
///
/// Off by default: the reference behaviour restarts immediately.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first restart.
    pub base_delay: Duration,

    pub multiplier: f64,
}

impl RetryPolicy {
    /// `base_delay * multiplier^(restart - 1)`; `restart` is 1-indexed.
    ///
    /// With base_delay=10ms, multiplier=2.0:
    /// - restart 1: 10ms
    /// - restart 2: 20ms
    /// - restart 3: 40ms
    pub fn next_delay(&self, restart: u32) -> Duration {
        let exponent = i32::try_from(restart.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        // powi overflows to inf long before Duration does
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}
