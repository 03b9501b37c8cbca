//! Retry policy: exponential backoff with uniform jitter.

use std::time::Duration;

use rand::Rng;

/// Pure delay calculator shared by every task type.
///
/// `max_attempts` is the policy-wide cap; the effective cap for a task is
/// `min(task.max_attempts, policy.max_attempts)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_attempts: i64,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_attempts: i64) -> Self {
        Self {
            base_delay,
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> i64 {
        self.max_attempts
    }

    /// Attempts allowed for a task that carries its own cap.
    pub fn effective_cap(&self, task_max_attempts: i64) -> i64 {
        self.max_attempts.min(task_max_attempts)
    }

    /// Delay before the next attempt: `base · 2^(attempt−1)` plus up to a
    /// third of the base as jitter.
    pub fn next_delay(&self, attempt_number: i64) -> Duration {
        let exponent = attempt_number.saturating_sub(1).max(0).min(32) as u32;
        let backoff = self.base_delay.as_secs_f64() * f64::from(2u32.saturating_pow(exponent));
        let jitter = if self.base_delay.is_zero() {
            0.0
        } else {
            rand::thread_rng().gen_range(0.0..self.base_delay.as_secs_f64() / 3.0)
        };
        Duration::from_secs_f64(backoff + jitter)
    }
}
