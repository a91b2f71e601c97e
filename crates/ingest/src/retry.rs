//! Retry/backoff policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Outcome of consulting the policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after this delay.
    Retry(Duration),
    /// The attempt budget is spent; abandon the job to the dead-letter set.
    DeadLetter,
}

/// Exponential backoff with jitter and a delay cap.
///
/// Pure: the decision is a function of `attempt_count` alone. The jitter is
/// derived deterministically from the attempt number, which keeps retries
/// de-synchronized across jobs enqueued together while leaving the delay
/// bounds exactly testable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts after which a failing job is dead-lettered.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Upper bound on any computed delay.
    pub max_delay: Duration,
    /// Jitter fraction (0.0-1.0) applied around the computed delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// Disable jitter (exact delays, mostly for tests).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Decide what happens after the `attempt_count`-th failed attempt
    /// (1-indexed: the first failure consults the policy with 1).
    pub fn decide(&self, attempt_count: u32) -> RetryDecision {
        if attempt_count >= self.max_attempts {
            return RetryDecision::DeadLetter;
        }
        RetryDecision::Retry(self.delay_for_attempt(attempt_count))
    }

    /// Delay before the attempt following `attempt_count` failures:
    /// `base * 2^(attempt_count-1)` ± jitter, clamped to `[0, max_delay]`.
    pub fn delay_for_attempt(&self, attempt_count: u32) -> Duration {
        if attempt_count == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        // Clamp the exponent; beyond 63 doublings the cap decides anyway.
        let exponent = (attempt_count - 1).min(63) as i32;
        let scaled = (base_ms * 2_f64.powi(exponent)).min(max_ms);

        let spread = scaled * self.jitter;
        let jitter_ms = if spread > 0.0 {
            // Knuth multiplicative hash of the attempt number, mapped to [-1, 1).
            let unit = (attempt_count.wrapping_mul(2_654_435_761) % 1000) as f64 / 1000.0;
            spread * (unit - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((scaled + jitter_ms).clamp(0.0, max_ms) as u64)
    }
}
