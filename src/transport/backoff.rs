//! Reconnect policy
//!
//! Attempt `n` (1-indexed) waits `base * n` under the default linear policy,
//! or `base * 2^(n-1)` capped at `max_delay` under the exponential one.
//! Past `max_attempts` the policy refuses to schedule and the connection
//! goes to `Failed`. Every successful open resets the counter.

use std::time::Duration;

use crate::config::{BackoffKind, StreamConfig};

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    kind: BackoffKind,
    base: Duration,
    max_delay: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(kind: BackoffKind, base: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            kind,
            base,
            max_delay,
            max_attempts,
            attempts: 0,
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(
            config.backoff,
            Duration::from_millis(config.reconnect_base_ms),
            Duration::from_millis(config.backoff_max_ms),
            config.max_reconnect_attempts,
        )
    }

    /// Delay before attempt `attempt` (1-indexed)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let n = attempt.max(1);
        match self.kind {
            BackoffKind::Linear => self.base.saturating_mul(n),
            BackoffKind::Exponential => {
                let factor = 1u32.checked_shl(n - 1).unwrap_or(u32::MAX);
                self.base.saturating_mul(factor).min(self.max_delay)
            }
        }
    }

    /// Claim the next attempt. `None` once the budget is spent.
    pub fn next_attempt(&mut self) -> Option<(u32, Duration)> {
        if self.is_exhausted() {
            return None;
        }
        self.attempts += 1;
        Some((self.attempts, self.delay_for(self.attempts)))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts_used(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}
