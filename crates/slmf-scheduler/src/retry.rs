// SPDX-License-Identifier: MIT OR Apache-2.0
//! Retry policy for failed task executions.

use crate::task::TaskError;
use std::time::Duration;

/// Exponential backoff with a cap and an attempt limit.
///
/// Defaults: 60 s base, doubling, capped at one hour, three attempts in
/// total. Permanent errors are never retried regardless of policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on any retry delay.
    pub cap: Duration,
    /// Total attempts, the initial one included.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            cap: Duration::from_secs(3600),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry_index` (0-based): base × 2^i,
    /// capped.
    #[must_use]
    pub fn delay_for(&self, retry_index: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_index).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Whether another attempt is allowed after `attempts_made` tries
    /// ended with `error`.
    #[must_use]
    pub fn should_retry(&self, attempts_made: u32, error: &TaskError) -> bool {
        match error {
            TaskError::Permanent(_) => false,
            TaskError::Transient(_) => attempts_made < self.max_attempts,
        }
    }
}
