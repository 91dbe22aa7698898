//! Retry with exponential backoff
//!
//! Delay before retry *n* (0-indexed) is `min(initial * multiplier^n, max)`,
//! plus up to 10% uniform jitter when enabled, never exceeding `max`. The
//! inter-attempt sleep gives way to cancellation immediately; nothing sleeps
//! after the last attempt.

use crate::config::duration_ms;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Fraction of the base delay added as jitter at most
const JITTER_FRACTION: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first; 0 behaves like 1
    pub max_attempts: u32,
    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Backoff before retry `retry` (0-indexed), without jitter
    pub fn base_delay(&self, retry: u32) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.max(0.0).powi(exponent);
        if scaled.is_finite() && scaled < max {
            Duration::from_secs_f64(scaled.max(0.0))
        } else {
            self.max_delay
        }
    }

    /// Backoff before retry `retry` (0-indexed), with jitter if enabled
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let jitter = base.mul_f64(JITTER_FRACTION * rand::random::<f64>());
        (base + jitter).min(self.max_delay.max(base))
    }
}

/// Result of a retried operation
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// Final result: the first success or the last error
    pub result: Result<T, E>,
    /// Attempts made after the first
    pub retries: u32,
    /// Sum of the inter-attempt delays slept
    pub total_delay: Duration,
    /// Cancellation cut a backoff short
    pub cancelled: bool,
}

/// Run `op` under `policy`.
///
/// `op` receives the zero-based attempt number. `is_retryable` classifies
/// errors; a non-retryable error ends the loop at once. `on_retry` is told the
/// upcoming attempt number, the error that caused it and the delay chosen.
pub async fn retry<T, E, Op, Fut, R, C>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    is_retryable: R,
    mut on_retry: C,
    mut op: Op,
) -> RetryOutcome<T, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    C: FnMut(u32, &E, Duration),
{
    let attempts = policy.attempts();
    let mut retries = 0;
    let mut total_delay = Duration::ZERO;
    let mut attempt = 0;

    loop {
        let error = match op(attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    retries,
                    total_delay,
                    cancelled: false,
                }
            }
            Err(error) => error,
        };

        let last_attempt = attempt + 1 >= attempts;
        if last_attempt || !is_retryable(&error) {
            return RetryOutcome {
                result: Err(error),
                retries,
                total_delay,
                cancelled: false,
            };
        }

        let delay = policy.delay_for(attempt);
        on_retry(attempt + 1, &error, delay);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                return RetryOutcome {
                    result: Err(error),
                    retries,
                    total_delay,
                    cancelled: true,
                };
            }
        }

        retries += 1;
        total_delay += delay;
        attempt += 1;
    }
}
