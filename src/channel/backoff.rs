//! Reconnect backoff: capped exponential growth with downward jitter.

use std::time::Duration;

use crate::config::ConnectionConfig;

/// Reconnect schedule for one manager.
///
/// The nth delay is `min(max, base * 2^n)` shortened by up to `jitter` of its
/// length. Jittered delays are clamped to never fall below the previous delay,
/// so a run of failures waits a non-decreasing, capped amount of time.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    jitter: f64,
    attempt: u32,
    last: Duration,
}

impl Backoff {
    /// Create a schedule.
    pub fn new(base: Duration, max: Duration, max_attempts: u32, jitter: f64) -> Self {
        Self {
            base,
            max,
            max_attempts,
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
            last: Duration::ZERO,
        }
    }

    /// Schedule configured for a connection.
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_base_delay_ms),
            Duration::from_millis(config.reconnect_max_delay_ms),
            config.max_reconnect_attempts,
            config.reconnect_jitter,
        )
    }

    /// Un-jittered delay for a zero-based attempt number.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Attempts scheduled since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether the attempt budget is spent.
    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Delay before the next attempt. Advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.base_delay(self.attempt);
        let cut = if self.jitter > 0.0 {
            nominal.mul_f64(self.jitter * rand::random::<f64>())
        } else {
            Duration::ZERO
        };
        let delay = nominal.saturating_sub(cut).max(self.last).min(self.max);
        self.attempt = self.attempt.saturating_add(1);
        self.last = delay;
        delay
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }
}
