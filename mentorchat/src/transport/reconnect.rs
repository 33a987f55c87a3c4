//! Reconnect backoff for the push channel.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff applied when the push channel drops.
///
/// Attempt `n` (starting at 0) waits `initial_delay * multiplier^n`, capped
/// at `max_delay`. With `jitter` the wait is scaled by a random factor in
/// `[0.5, 1.0]` so many clients do not reconnect in lockstep.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Growth factor between attempts.
    pub multiplier: f64,
    /// Attempts before giving up. `0` disables reconnection.
    pub max_attempts: u32,
    /// Randomize delays.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 8,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never reconnects.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Whether any reconnect attempt will be made.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }

    /// Whether `attempt` (0-based) is still within the budget.
    #[must_use]
    pub const fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Un-jittered delay before attempt `attempt` (0-based).
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        if secs.is_finite() && secs < max {
            Duration::from_secs_f64(secs)
        } else {
            self.max_delay
        }
    }

    /// Delay before attempt `attempt`, with jitter applied if enabled.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter {
            let factor: f64 = rand::rng().random_range(0.5..=1.0);
            base.mul_f64(factor)
        } else {
            base
        }
    }
}
