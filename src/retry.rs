// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry/Backoff Policy
//!
//! Decides what happens to a delivery whose indexing failed. Each redelivery is
//! a new message carrying the attempt count forward in `x-retry-count`, so the
//! policy only needs the count read from the failed delivery.

use std::time::Duration;

/// Default number of redeliveries before a message is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default backoff unit; the n-th retry waits n times this.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(5);

/// What to do with a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Republish after `delay` with `x-retry-count = attempt`.
    Retry { attempt: i64, delay: Duration },
    /// Retry budget spent; `attempts` redeliveries already happened.
    GiveUp { attempts: i64 },
}

/// Terminal state of one delivery as seen by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    RetryScheduled { attempt: i64, delay: Duration },
    DroppedAfterMaxRetries { attempts: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        RetryPolicy {
            max_retries,
            base_delay,
        }
    }

    /// Decides the fate of a delivery that failed after `previous_attempts`
    /// redeliveries.
    ///
    /// A message is redelivered at most `max_retries` times, so it is applied
    /// at most `max_retries + 1` times in total.
    pub fn decide(&self, previous_attempts: i64) -> RetryDecision {
        let attempt = previous_attempts.max(0) + 1;

        if attempt > i64::from(self.max_retries) {
            return RetryDecision::GiveUp {
                attempts: attempt - 1,
            };
        }

        RetryDecision::Retry {
            attempt,
            delay: self.delay_for(attempt),
        }
    }

    /// Backoff before redelivery number `attempt`.
    pub fn delay_for(&self, attempt: i64) -> Duration {
        let factor = u32::try_from(attempt.max(0)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}
