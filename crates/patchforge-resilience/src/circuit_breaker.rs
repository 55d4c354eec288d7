//! Named circuit breakers.
//!
//! State machine `closed -> open -> half_open -> closed`. A breaker opens
//! after `failure_threshold` consecutive failures and rejects calls
//! immediately while open. Once `recovery_timeout` has elapsed a single
//! probe call is admitted; its outcome decides whether the breaker closes
//! or re-opens.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through.
    Closed,
    /// Too many failures, calls rejected immediately.
    Open,
    /// Testing recovery, one probe call allowed.
    HalfOpen,
}

/// Breaker tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// How long the breaker stays open before admitting a probe.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    #[error("circuit breaker '{name}' is open (failed {failures} times)")]
    Open { name: String, failures: u32 },

    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    /// Set while a half-open probe is in flight; blocks further admits.
    probe_in_flight: bool,
}

/// A named circuit breaker. Concurrency-safe; clone the `Arc` freely.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            "circuit breaker '{}' initialised (threshold={}, recovery={}s)",
            name,
            config.failure_threshold,
            config.recovery_timeout.as_secs()
        );
        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, accounting for recovery-timeout expiry.
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state == CircuitState::Open && self.recovery_elapsed(&inner) {
            CircuitState::HalfOpen
        } else {
            inner.state
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().expect("breaker lock poisoned").failure_count
    }

    /// Run `op` through the breaker.
    ///
    /// While open (and before the recovery timeout has elapsed) the call
    /// fails immediately with [`CircuitError::Open`] without invoking
    /// `op`. In half-open only one probe is admitted at a time.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit()?;

        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(CircuitError::Inner(err))
            }
        }
    }

    /// Decide whether a call may proceed, transitioning open -> half_open
    /// when the recovery timeout has elapsed.
    fn admit<E>(&self) -> Result<(), CircuitError<E>> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                if self.recovery_elapsed(&inner) {
                    info!("circuit breaker '{}' transitioning to half-open", self.name);
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(CircuitError::Open {
                        name: self.name.clone(),
                        failures: inner.failure_count,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(CircuitError::Open {
                        name: self.name.clone(),
                        failures: inner.failure_count,
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    fn recovery_elapsed(&self, inner: &BreakerInner) -> bool {
        inner
            .last_failure
            .map(|at| at.elapsed() >= self.config.recovery_timeout)
            .unwrap_or(false)
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.probe_in_flight = false;
        if inner.state != CircuitState::Closed {
            info!("circuit breaker '{}' recovered, closing", self.name);
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        let was_half_open = inner.state == CircuitState::HalfOpen;
        inner.probe_in_flight = false;

        if was_half_open || inner.failure_count >= self.config.failure_threshold {
            if inner.state != CircuitState::Open || was_half_open {
                warn!(
                    "circuit breaker '{}' opened after {} failures",
                    self.name, inner.failure_count
                );
            }
            inner.state = CircuitState::Open;
        }
    }

    /// Manually reset to closed and clear the failure counter.
    pub fn reset(&self) {
        info!("circuit breaker '{}' manually reset", self.name);
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.probe_in_flight = false;
    }
}

/// Process-wide breaker registry, keyed by name.
static REGISTRY: Lazy<RwLock<HashMap<String, Arc<CircuitBreaker>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Get or create a named circuit breaker.
///
/// The configuration only applies on first creation; later callers get
/// the existing breaker regardless of the config they pass.
pub fn get_circuit_breaker(name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
    if let Some(breaker) = REGISTRY.read().expect("registry lock poisoned").get(name) {
        return Arc::clone(breaker);
    }

    let mut registry = REGISTRY.write().expect("registry lock poisoned");
    Arc::clone(
        registry
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config))),
    )
}
