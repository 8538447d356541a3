//! Exponential backoff for failed deliveries.
//!
//! `delay = min(base * 2^failureCount, maxWait)`, where the failure count
//! includes the failure being scheduled. With the default 1s base the
//! retries of one range wait 2s, 4s, 8s, ... up to the group's
//! `maxWaitMinutes`. Each group owns its own count and timer, so a failing
//! group never delays any other.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::types::Cursor;

/// Default backoff base.
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(1);

/// A scheduled retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPlan {
    /// Consecutive failures including this one.
    pub attempt: u32,
    pub delay: Duration,
    pub next_attempt_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryScheduler {
    base: Duration,
}

impl RetryScheduler {
    pub fn new(base: Duration) -> Self {
        RetryScheduler { base }
    }

    /// Delay after `failure_count` consecutive failures, capped at `max_wait`.
    pub fn delay(&self, failure_count: u32, max_wait: Duration) -> Duration {
        let factor = 2u32.saturating_pow(failure_count);
        self.base.saturating_mul(factor).min(max_wait)
    }

    /// Counts a failure on `cursor` and schedules the next attempt.
    pub fn record_failure(
        &self,
        cursor: &mut Cursor,
        max_wait: Duration,
        now: DateTime<Utc>,
    ) -> RetryPlan {
        cursor.failure_count = cursor.failure_count.saturating_add(1);
        let delay = self.delay(cursor.failure_count, max_wait);
        let next_attempt_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        cursor.next_attempt_at = Some(next_attempt_at);

        RetryPlan {
            attempt: cursor.failure_count,
            delay,
            next_attempt_at,
        }
    }
}

impl Default for RetryScheduler {
    fn default() -> Self {
        RetryScheduler::new(DEFAULT_RETRY_BASE)
    }
}
