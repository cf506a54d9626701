//! Exponential backoff with jitter.
//!
//! Used twice: by the worker runtime between empty polls and by the retry
//! manager to push a failed task's `run_after` into the future.

use std::time::Duration;

use rand::RngExt;
use rand_chacha::ChaCha8Rng;

/// Exponential backoff schedule.
///
/// `attempt` is 1-indexed: the first delay is `initial`, each following
/// delay is `multiplier` times the previous one, capped at `max`. Jitter
/// spreads each delay uniformly over `±jitter` of its value.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction in `[0, 1]`.
    pub jitter: f64,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    /// Default schedule between empty polls: 50ms doubling to 5s.
    pub fn poll_default() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_secs(5)).with_jitter(0.2)
    }

    /// Default schedule between retries: 2s doubling to 10 minutes.
    pub fn retry_default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(600)).with_jitter(0.2)
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before `attempt`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max
        }
    }

    /// Delay before `attempt`, with jitter applied and the result capped at `max`.
    pub fn delay(&self, attempt: u32, rng: &mut ChaCha8Rng) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = rng.random_range((1.0 - jitter)..=(1.0 + jitter));
        let secs = (base.as_secs_f64() * factor).min(self.max.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }
}
