//! Exponential reconnect delay.

use std::time::Duration;

/// Doubling delay, starting at `base` and capped at `ceiling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
}

impl Backoff {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling: ceiling.max(base),
        }
    }

    /// Delay to wait after the `attempt`-th consecutive failure (1-based).
    ///
    /// `attempt = 0` is treated like the first failure.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.ceiling)
            .min(self.ceiling)
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }
}
