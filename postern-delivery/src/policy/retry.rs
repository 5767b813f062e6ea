//! Retry policy for delivery attempts and store access.
//!
//! [`RetryPolicy`] decides when a soft-failed message is tried again and when
//! it has run out of chances. [`StoreRetryPolicy`] covers transient failures
//! of the message store itself, which are retried in place before the
//! failure is surfaced.

use std::{
    future::Future,
    time::{Duration, SystemTime},
};

use postern_store::StoreError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Backoff and give-up rules for soft failures
///
/// The delay after the `n`th failure is `base * 2^(n - 1)`, capped at
/// `max_retry_delay_secs` and randomised within ±`retry_jitter_factor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Default: 300 seconds (5 minutes)
    #[serde(default = "defaults::base_retry_delay_secs")]
    pub base_retry_delay_secs: u64,

    /// Default: 14400 seconds (4 hours)
    #[serde(default = "defaults::max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,

    /// Default: 0.0 (no jitter)
    #[serde(default = "defaults::retry_jitter_factor")]
    pub retry_jitter_factor: f64,

    /// How long after enqueue a message may still be retried
    ///
    /// Default: 432000 seconds (5 days)
    #[serde(default = "defaults::max_retry_window_secs")]
    pub max_retry_window_secs: u64,

    /// Default: 30
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_retry_delay_secs: defaults::base_retry_delay_secs(),
            max_retry_delay_secs: defaults::max_retry_delay_secs(),
            retry_jitter_factor: defaults::retry_jitter_factor(),
            max_retry_window_secs: defaults::max_retry_window_secs(),
            max_attempts: defaults::max_attempts(),
        }
    }
}

/// What to do with a message after a soft failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAt(SystemTime),
    /// The retry window or attempt budget is spent
    Exhausted,
}

impl RetryPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Backoff after `failures` soft failures, before jitter
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        let secs = if exponent >= 63 {
            self.max_retry_delay_secs
        } else {
            self.base_retry_delay_secs
                .saturating_mul(1u64 << exponent)
                .min(self.max_retry_delay_secs)
        };
        Duration::from_secs(secs)
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn jittered(&self, delay: Duration) -> Duration {
        if self.retry_jitter_factor <= 0.0 {
            return delay;
        }

        let secs = delay.as_secs_f64();
        let range = secs * self.retry_jitter_factor;
        let jitter: f64 = rand::rng().random_range(-range..=range);
        Duration::from_secs((secs + jitter).max(0.0) as u64)
    }

    /// Decide the next step after the `failures`th soft failure
    ///
    /// `previous` is the message's current `next_delivery_scheduled_at`; the
    /// returned time is always at least one second after it, so successive
    /// failures strictly move the schedule forward.
    #[must_use]
    pub fn decide(
        &self,
        failures: u32,
        added_at: SystemTime,
        previous: SystemTime,
        now: SystemTime,
    ) -> RetryDecision {
        if failures >= self.max_attempts {
            return RetryDecision::Exhausted;
        }

        let next = (now + self.jittered(self.delay(failures))).max(previous + Duration::from_secs(1));
        let deadline = added_at + Duration::from_secs(self.max_retry_window_secs);

        if next > deadline {
            RetryDecision::Exhausted
        } else {
            RetryDecision::RetryAt(next)
        }
    }
}

/// In-place retries for transient message store failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRetryPolicy {
    /// Default: 5
    #[serde(default = "defaults::store_attempts")]
    pub attempts: u32,

    /// Doubled after every failed try. Default: 100 milliseconds
    #[serde(default = "defaults::store_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for StoreRetryPolicy {
    fn default() -> Self {
        Self {
            attempts: defaults::store_attempts(),
            base_delay_ms: defaults::store_base_delay_ms(),
        }
    }
}

impl StoreRetryPolicy {
    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts run out
    ///
    /// # Errors
    /// Returns the last error seen
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut delay = Duration::from_millis(self.base_delay_ms);
        let mut tries = 1;

        loop {
            match op().await {
                Err(err) if err.is_unavailable() && tries < self.attempts => {
                    warn!(
                        operation = what,
                        attempt = tries,
                        error = %err,
                        "Store unavailable, retrying in {}ms",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    tries += 1;
                }
                result => return result,
            }
        }
    }
}

mod defaults {
    pub const fn base_retry_delay_secs() -> u64 {
        300 // 5 minutes
    }

    pub const fn max_retry_delay_secs() -> u64 {
        14400 // 4 hours
    }

    pub const fn retry_jitter_factor() -> f64 {
        0.0
    }

    pub const fn max_retry_window_secs() -> u64 {
        432_000 // 5 days
    }

    pub const fn max_attempts() -> u32 {
        30
    }

    pub const fn store_attempts() -> u32 {
        5
    }

    pub const fn store_base_delay_ms() -> u64 {
        100
    }
}
