//! Deadline wrapper for async operations.
//!
//! Built on `tokio::time::timeout`: when the deadline fires the wrapped
//! future is dropped, which cancels in-flight I/O rather than leaving it
//! running detached.

use std::future::Future;
use std::time::Duration;
use tracing::error;

/// Raised when a wrapped operation exceeds its deadline.
#[derive(Debug, thiserror::Error)]
#[error("operation timed out after {:.1}s", limit.as_secs_f64())]
pub struct TimeoutElapsed {
    pub limit: Duration,
}

/// Run `fut` with a deadline.
pub async fn with_timeout<F, T>(limit: Duration, fut: F) -> Result<T, TimeoutElapsed>
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(value) => Ok(value),
        Err(_) => {
            error!("operation timed out after {:.1}s", limit.as_secs_f64());
            Err(TimeoutElapsed { limit })
        }
    }
}
