// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Exponential backoff applied to batches that fail with a retryable error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Exponential factor applied for every additional failure.
    pub factor: f64,
    /// Upper bound of any delay, jitter included.
    pub max_delay: Duration,
    /// Failures tolerated before the batch is abandoned.
    pub max_retries: u32,
    /// Fraction of the delay that may be shaved off at random, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(10),
            factor: 2.0,
            max_delay: Duration::from_secs(5 * 60),
            max_retries: 5,
            jitter: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Abandon,
}

impl RetryPolicy {
    /// Delay before retrying after the `failures`-th consecutive failure,
    /// without jitter. `failures` starts at 1.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        // Cap exponent to keep the powi() argument in range.
        let capped_exponent = exponent.min(100) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.factor.max(1.0).powi(capped_exponent);
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Randomly shortens a delay by up to `jitter` of its length.
    #[must_use]
    pub fn jittered(&self, delay: Duration) -> Duration {
        let jitter = if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if jitter == 0.0 {
            return delay.min(self.max_delay);
        }
        let scale = 1.0 - jitter * fastrand::f64();
        delay.mul_f64(scale).min(self.max_delay)
    }

    /// Decides what to do with a batch that has now failed `failures` times.
    #[must_use]
    pub fn decide(&self, failures: u32) -> RetryDecision {
        if failures > self.max_retries {
            RetryDecision::Abandon
        } else {
            RetryDecision::Retry {
                delay: self.jittered(self.delay_for(failures)),
            }
        }
    }
}
