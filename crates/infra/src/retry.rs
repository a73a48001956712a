//! Bounded retry with exponential backoff.
//!
//! Only errors classified [`ErrorClass::Retryable`] consume an attempt and are
//! retried. A terminal error stops immediately; running out of attempts turns
//! the last retryable error into a [`TerminalError`] for the caller.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use docpipe_core::{Classify, ErrorClass, ErrorKind};

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, the first try included (0 is treated as 1)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Growth factor per attempt; 1.0 gives a fixed delay
    pub multiplier: f64,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            ..Default::default()
        }
    }

    /// Calculate the delay after a failed attempt (1-indexed).
    ///
    /// `base * multiplier^(attempt - 1)`, capped at `max_delay`, then moved by a
    /// random offset of up to `±jitter` of itself.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let exp = self.multiplier.max(1.0).powi(attempt.min(31) as i32 - 1);
        let delay_ms = (base_ms * exp).min(max_ms);

        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Check if another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

/// Failure surfaced once the wrapper gives up.
#[derive(Debug, Error)]
#[error("{kind} failure after {attempts} attempt(s): {source}")]
pub struct TerminalError<E>
where
    E: std::error::Error + 'static,
{
    /// `Retryable` when the budget ran out, `Terminal` when the error was permanent.
    pub kind: ErrorKind,
    pub attempts: u32,
    #[source]
    pub source: E,
}

impl<E> TerminalError<E>
where
    E: std::error::Error + 'static,
{
    pub fn into_inner(self) -> E {
        self.source
    }
}

/// Run `operation` under `policy`.
///
/// The closure receives the 1-based attempt number. The wait between attempts
/// is the policy's backoff or the error's `retry_after` hint, whichever is
/// longer.
pub async fn execute<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, TerminalError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + std::error::Error + 'static,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        match err.class() {
            ErrorClass::Terminal => {
                debug!(attempt, error = %err, "terminal failure; not retrying");
                return Err(TerminalError {
                    kind: ErrorKind::Terminal,
                    attempts: attempt,
                    source: err,
                });
            }
            ErrorClass::Retryable if !policy.should_retry(attempt) => {
                warn!(attempt, error = %err, "retry budget exhausted");
                return Err(TerminalError {
                    kind: ErrorKind::Retryable,
                    attempts: attempt,
                    source: err,
                });
            }
            ErrorClass::Retryable => {
                let delay = policy
                    .delay_for_attempt(attempt)
                    .max(err.retry_after().unwrap_or_default());
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retryable failure; backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
