//! Patchforge Resilience Fabric
//!
//! Reusable primitives applied throughout the engine:
//! - [`CircuitBreaker`]: stop calling a failing dependency for a cooldown
//! - [`retry_with_backoff`]: bounded retries with configurable backoff
//! - [`Bulkhead`]: bound concurrent in-flight operations
//! - [`with_timeout`]: abort an async operation after a deadline
//!
//! Breakers and bulkheads live in process-wide registries keyed by name;
//! they are created lazily and never reconstructed at request time.

pub mod bulkhead;
pub mod circuit_breaker;
pub mod retry;
pub mod timeout;

pub use bulkhead::{get_bulkhead, Bulkhead, BulkheadPermit, BulkheadRejected};
pub use circuit_breaker::{
    get_circuit_breaker, CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState,
};
pub use retry::{
    calculate_delay, retry_with_backoff, MaxRetriesExceeded, RetryPolicy, RetryStrategy,
};
pub use timeout::{with_timeout, TimeoutElapsed};
