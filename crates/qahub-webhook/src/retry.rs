//! Retry policy for webhook deliveries
//!
//! Capped exponential backoff with symmetric jitter:
//! `delay(n) = min(base * 2^(n-1), cap) * (1 ± jitter)`, clamped to `cap`,
//! where `n` is the number of attempts already made.

use qahub_core::DeliveryConfig;
use rand::Rng;
use std::time::Duration;

/// Retry policy applied by the scheduler to failed attempts
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts allowed before a delivery is failed for good
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter_factor: 0.0,
        }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(config.max_attempts, config.backoff_base(), config.backoff_cap())
            .with_jitter_factor(config.jitter_factor)
    }

    /// Set jitter factor
    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Whether no further attempt is allowed after `attempts_made`
    pub fn is_exhausted(&self, attempts_made: u32) -> bool {
        attempts_made >= self.max_attempts
    }

    /// Backoff before the next attempt, without jitter
    pub fn base_delay_for(&self, attempts_made: u32) -> Duration {
        if attempts_made == 0 {
            return Duration::ZERO;
        }

        let factor = 2u32.checked_pow(attempts_made - 1);
        factor
            .and_then(|f| self.base_delay.checked_mul(f))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Backoff before the next attempt, with jitter applied
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let delay = self.base_delay_for(attempts_made);
        if self.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }

        let offset = rand::thread_rng().gen_range(-self.jitter_factor..=self.jitter_factor);
        delay.mul_f64(1.0 + offset).min(self.max_delay)
    }
}
