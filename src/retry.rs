//! Retry policy shared by every delivery path
//!
//! Exponential backoff with randomized jitter. The same [`RetryPolicy`]
//! drives sink delivery, heartbeat publishing and watchdog notifications.
//!
//! ## Delay schedule
//!
//! After failed attempt `n` (1-based) the nominal delay is
//! `base_delay * 2^(n-1)`, capped at `max_delay`. The actual delay is the
//! nominal delay scaled by a uniform factor in `[1 - jitter, 1 + jitter]`,
//! so the expected delay never decreases and never exceeds
//! `max_delay * (1 + jitter)`.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, Result};

/// How often and how patiently to retry one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one (0 is treated as 1)
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff
    pub base_delay_ms: u64,
    /// Maximum nominal delay in milliseconds
    pub max_delay_ms: u64,
    /// Jitter as a fraction of the nominal delay, clamped to `0.0..=1.0`
    pub jitter: f64,
    /// Upper bound on a single attempt, in milliseconds
    pub attempt_timeout_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter: 0.25,
            attempt_timeout_ms: Some(10_000),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout_ms.map(Duration::from_millis)
    }

    fn jitter_fraction(&self) -> f64 {
        if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Delay before the next attempt, without jitter.
    ///
    /// `failed` is the 1-based number of the attempt that just failed.
    pub fn nominal_delay(&self, failed: u32) -> Duration {
        let exp = failed.saturating_sub(1).min(20);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Delay before the next attempt, with jitter drawn from `rng`
    pub fn delay_for_attempt<R: Rng>(&self, failed: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal_delay(failed).as_secs_f64();
        let jitter = self.jitter_fraction();
        let factor = if jitter > 0.0 {
            1.0 + rng.gen_range(-jitter..=jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64(nominal * factor)
    }

    /// The largest delay this policy can ever produce
    pub fn max_delay_bound(&self) -> Duration {
        Duration::from_secs_f64(
            Duration::from_millis(self.max_delay_ms).as_secs_f64() * (1.0 + self.jitter_fraction()),
        )
    }
}

/// Result of a retried operation plus how many attempts it took
#[derive(Debug)]
pub struct RetryReport<T> {
    pub attempts: u32,
    pub result: Result<T>,
}

/// Run `operation` until it succeeds, the policy is exhausted, or `cancel` fires.
///
/// The closure receives the 1-based attempt number. Each attempt is bounded
/// by the policy's attempt timeout. Cancellation interrupts both a running
/// attempt and a backoff sleep and yields [`RelayError::Cancelled`].
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    label: &str,
    mut operation: F,
) -> RetryReport<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.attempts();
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        let fut = operation(attempt);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return RetryReport {
                    attempts: attempt,
                    result: Err(RelayError::Cancelled),
                };
            }
            outcome = run_attempt(policy.attempt_timeout(), label, fut) => outcome,
        };

        match outcome {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(target_id = label, attempt, "Succeeded after retry");
                }
                return RetryReport {
                    attempts: attempt,
                    result: Ok(value),
                };
            }
            Err(e) => {
                if attempt < max_attempts {
                    let delay = policy.delay_for_attempt(attempt, &mut rand::thread_rng());
                    tracing::warn!(
                        target_id = label,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Attempt failed, retrying in {:?}",
                        delay
                    );
                    last_error = Some(e);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return RetryReport {
                                attempts: attempt,
                                result: Err(RelayError::Cancelled),
                            };
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                } else {
                    last_error = Some(e);
                }
            }
        }
    }

    RetryReport {
        attempts: max_attempts,
        result: Err(last_error.unwrap_or(RelayError::Cancelled)),
    }
}

async fn run_attempt<T, Fut>(limit: Option<Duration>, label: &str, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
            Err(RelayError::Timeout(format!(
                "attempt for '{}' exceeded {:?}",
                label, limit
            )))
        }),
        None => fut.await,
    }
}
