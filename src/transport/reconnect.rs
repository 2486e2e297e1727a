//! Reconnection backoff schedule
//!
//! Delays double from the base on every failed attempt and are capped at
//! the maximum. No jitter is applied.

use std::time::Duration;

/// Default delay before the first reconnect attempt
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(2000);

/// Default ceiling for the reconnect delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);

/// Exponential backoff configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before attempt 1
    pub base_delay: Duration,

    /// Upper bound for any delay
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay to wait before reconnect `attempt` (1-based).
    ///
    /// `min(base * 2^(attempt-1), max)`; attempt 0 is treated as 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;

        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}
