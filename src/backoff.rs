//! Reconnect delay policy: capped exponential growth with jitter.
//!
//! `ceiling(n) = min(base * 2^n, max)` and the actual delay is the ceiling
//! scaled by a uniform factor in `[0.5, 1.0)`, so clients that dropped at
//! the same moment do not retry in lockstep.

use std::time::Duration;

use rand::Rng;

use crate::config::ConnectionConfig;

const JITTER_MIN: f64 = 0.5;
const JITTER_MAX: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self { base, max, max_attempts }
    }

    #[must_use]
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(config.backoff_base, config.backoff_max, config.max_reconnect_attempts)
    }

    /// Whether another automatic attempt is allowed after `attempts` failures.
    #[must_use]
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Un-jittered delay for the given attempt counter.
    #[must_use]
    pub fn ceiling(&self, attempts: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempts);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay for `attempts` scaled by `jitter`, clamped into `[0.5, 1.0]`.
    #[must_use]
    pub fn delay(&self, attempts: u32, jitter: f64) -> Duration {
        self.ceiling(attempts).mul_f64(jitter.clamp(JITTER_MIN, JITTER_MAX))
    }

    /// Delay for `attempts` with a freshly drawn jitter factor.
    #[must_use]
    pub fn jittered(&self, attempts: u32) -> Duration {
        let jitter = rand::rng().random_range(JITTER_MIN..JITTER_MAX);
        self.delay(attempts, jitter)
    }
}

#[cfg(test)]
#[path = "backoff_test.rs"]
mod tests;
