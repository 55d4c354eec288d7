//! Retry with backoff.
//!
//! Supports exponential, linear and constant delay strategies with an
//! absolute delay cap and 0-25% jitter by default. Retries only errors
//! the caller's predicate accepts; everything else surfaces immediately.
//! Cancellation is drop-based: aborting the returned future between
//! attempts abandons the retry loop without side effects.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Delay growth strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// `base * 2^attempt`
    #[default]
    Exponential,
    /// `base * (attempt + 1)`
    Linear,
    /// `base`
    Constant,
}

/// Retry tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (3 retries = up to 4 attempts).
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Absolute cap applied before jitter.
    pub max_delay: Duration,
    pub strategy: RetryStrategy,
    /// Add 0-25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            strategy: RetryStrategy::Exponential,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// The preset used for external API calls: 3 retries, exponential
    /// backoff 1s / 2s / 4s.
    pub fn api_call() -> Self {
        Self::default()
    }

    pub fn with_base_delay(mut self, base: Duration) -> Self {
        self.base_delay = base;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}

/// Raised once every attempt has failed; carries the last error.
#[derive(Debug, thiserror::Error)]
#[error("max retries ({retries}) exceeded: {source}")]
pub struct MaxRetriesExceeded<E>
where
    E: std::fmt::Display + std::fmt::Debug,
{
    pub retries: u32,
    #[source]
    pub source: E,
}

/// Compute the delay before retry number `attempt` (0-indexed).
///
/// The cap applies to the base delay; jitter of 0-25% is added on top to
/// spread simultaneous retries apart.
pub fn calculate_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.base_delay.as_secs_f64();
    let raw = match policy.strategy {
        RetryStrategy::Exponential => base * 2f64.powi(attempt as i32),
        RetryStrategy::Linear => base * (attempt as f64 + 1.0),
        RetryStrategy::Constant => base,
    };

    let capped = raw.min(policy.max_delay.as_secs_f64());

    let jittered = if policy.jitter {
        capped + capped * rand::thread_rng().gen_range(0.0..0.25)
    } else {
        capped
    };

    Duration::from_secs_f64(jittered)
}

/// Run `op` with retries according to `policy`.
///
/// `should_retry` decides whether a given error is worth another attempt;
/// a non-retryable error is returned wrapped after zero further attempts.
/// After exhaustion the last error is wrapped in [`MaxRetriesExceeded`].
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    should_retry: P,
    mut op: F,
) -> Result<T, MaxRetriesExceeded<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + std::fmt::Debug,
    P: Fn(&E) -> bool,
{
    let mut last_error: Option<E> = None;

    for attempt in 0..=policy.max_retries {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    info!("operation succeeded after {} retries", attempt);
                }
                return Ok(value);
            }
            Err(err) => {
                if attempt < policy.max_retries && should_retry(&err) {
                    let delay = calculate_delay(policy, attempt);
                    warn!(
                        "attempt {}/{} failed, retrying in {:.2}s: {}",
                        attempt + 1,
                        policy.max_retries + 1,
                        delay.as_secs_f64(),
                        err
                    );
                    last_error = Some(err);
                    tokio::time::sleep(delay).await;
                } else {
                    if !should_retry(&err) {
                        return Err(MaxRetriesExceeded {
                            retries: attempt,
                            source: err,
                        });
                    }
                    warn!(
                        "operation failed after {} attempts: {}",
                        policy.max_retries + 1,
                        err
                    );
                    last_error = Some(err);
                    break;
                }
            }
        }
    }

    Err(MaxRetriesExceeded {
        retries: policy.max_retries,
        source: last_error.expect("retry loop exited without an error"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn no_jitter(strategy: RetryStrategy) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            strategy,
            jitter: false,
        }
    }

    #[test]
    fn test_exponential_delays_are_non_decreasing_and_capped() {
        let policy = RetryPolicy {
            max_retries: 6,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            strategy: RetryStrategy::Exponential,
            jitter: false,
        };

        let mut prev = Duration::ZERO;
        for attempt in 0..6 {
            let delay = calculate_delay(&policy, attempt);
            assert!(delay >= prev, "delay must be non-decreasing");
            assert!(delay <= policy.max_delay, "delay must respect the cap");
            prev = delay;
        }
        assert_eq!(calculate_delay(&policy, 5), Duration::from_secs(8));
    }

    #[test]
    fn test_linear_and_constant_delays() {
        let linear = no_jitter(RetryStrategy::Linear);
        assert_eq!(calculate_delay(&linear, 0), Duration::from_millis(10));
        assert_eq!(calculate_delay(&linear, 2), Duration::from_millis(30));

        let constant = no_jitter(RetryStrategy::Constant);
        assert_eq!(calculate_delay(&constant, 0), Duration::from_millis(10));
        assert_eq!(calculate_delay(&constant, 3), Duration::from_millis(10));
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let policy = RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(60),
            strategy: RetryStrategy::Constant,
            jitter: true,
        };
        for _ in 0..100 {
            let delay = calculate_delay(&policy, 0);
            assert!(delay >= Duration::from_secs(4));
            assert!(delay <= Duration::from_secs(5));
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = retry_with_backoff(
            &no_jitter(RetryStrategy::Exponential),
            |_: &&str| true,
            move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("transient")
                    } else {
                        Ok("done")
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_wraps_last_error() {
        let err = retry_with_backoff(
            &no_jitter(RetryStrategy::Constant),
            |_: &&str| true,
            || async { Err::<(), _>("always down") },
        )
        .await
        .unwrap_err();

        assert_eq!(err.retries, 3);
        assert_eq!(err.source, "always down");
        assert!(err.to_string().contains("max retries"));
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_fast() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let err = retry_with_backoff(
            &no_jitter(RetryStrategy::Constant),
            |e: &&str| *e != "fatal",
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("fatal")
                }
            },
        )
        .await
        .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(err.retries, 0);
    }
}
