//! Retry policy with fixed or exponential backoff
//!
//! Waits go through `tokio::time`, so tests can run them on a paused clock,
//! and every wait races a cancellation token.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Returned when a wait or operation was cut short by cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("interrupted by user")]
pub struct Interrupted;

/// How the delay grows between attempts
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Same delay before every retry
    Fixed,
    /// Delay multiplied by `factor` after each failure, capped at `max_delay`
    Exponential { factor: f64, max_delay: Duration },
}

/// Bounded retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Failures allowed before giving up (also the maximum number of attempts)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(5, Duration::from_secs(2))
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, delay: Duration, factor: f64, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: Backoff::Exponential { factor, max_delay },
        }
    }

    /// Delay to wait after the given number of failures (1-based)
    pub fn delay_for(&self, failures: u32) -> Duration {
        match &self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { factor, max_delay } => {
                let exp = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
                let secs = self.delay.as_secs_f64() * factor.powi(exp);
                if !secs.is_finite() || secs >= max_delay.as_secs_f64() {
                    *max_delay
                } else {
                    Duration::from_secs_f64(secs.max(0.0))
                }
            }
        }
    }

    /// Start tracking failures against this policy
    pub fn budget(&self) -> RetryBudget {
        RetryBudget::new(self.clone())
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then try again
    Retry(Duration),
    /// Budget used up
    Exhausted,
}

/// Failure counter for one retry loop
#[derive(Debug, Clone)]
pub struct RetryBudget {
    policy: RetryPolicy,
    failures: u32,
}

impl RetryBudget {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, failures: 0 }
    }

    /// Count a failure and decide whether another attempt is allowed
    pub fn record_failure(&mut self) -> RetryDecision {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.policy.max_attempts {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry(self.policy.delay_for(self.failures))
        }
    }
}

/// Sleep for `delay` unless cancelled first
pub async fn wait(delay: Duration, cancel: &CancellationToken) -> Result<(), Interrupted> {
    trace!(delay_ms = delay.as_millis() as u64, "Waiting before retry");
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupted),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Terminal failure of [`retry`]
#[derive(Debug, Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: E,
    },
    #[error("interrupted by user")]
    Interrupted,
}

/// Run `op` until it succeeds, the policy is exhausted, or `cancel` fires.
///
/// The closure receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut budget = policy.budget();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Interrupted),
            r = op(attempt) => r,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) => match budget.record_failure() {
                RetryDecision::Exhausted => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    })
                }
                RetryDecision::Retry(delay) => {
                    if wait(delay, cancel).await.is_err() {
                        return Err(RetryError::Interrupted);
                    }
                }
            },
        }
    }
}
