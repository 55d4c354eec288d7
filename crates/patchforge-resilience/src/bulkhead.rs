//! Bulkheads: bounded concurrency via semaphores.
//!
//! A bulkhead limits the number of operations in flight against a
//! resource. Acquisition returns an RAII permit; release happens on drop,
//! so permits are returned even when the holder panics or is cancelled.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::info;

/// Raised when a permit could not be acquired within the wait budget.
#[derive(Debug, thiserror::Error)]
#[error("bulkhead '{name}' rejected request (capacity {capacity})")]
pub struct BulkheadRejected {
    pub name: String,
    pub capacity: usize,
}

/// An acquired slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
}

/// Semaphore-backed concurrency limiter.
#[derive(Debug)]
pub struct Bulkhead {
    name: String,
    capacity: usize,
    /// None = wait for a slot indefinitely.
    max_wait: Option<Duration>,
    semaphore: Arc<Semaphore>,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, capacity: usize, max_wait: Option<Duration>) -> Self {
        let name = name.into();
        info!(
            "bulkhead '{}' initialised (capacity={}, max_wait={:?})",
            name, capacity, max_wait
        );
        Self {
            name,
            capacity,
            max_wait,
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Acquire a slot, waiting up to the configured budget.
    pub async fn acquire(&self) -> Result<BulkheadPermit, BulkheadRejected> {
        let acquire = Arc::clone(&self.semaphore).acquire_owned();

        let permit = match self.max_wait {
            Some(budget) => tokio::time::timeout(budget, acquire)
                .await
                .map_err(|_| self.rejected())?,
            None => acquire.await,
        };

        // The semaphore is never closed, so acquisition only fails on
        // timeout above.
        let permit = permit.map_err(|_| self.rejected())?;
        Ok(BulkheadPermit { _permit: permit })
    }

    fn rejected(&self) -> BulkheadRejected {
        BulkheadRejected {
            name: self.name.clone(),
            capacity: self.capacity,
        }
    }
}

/// Process-wide bulkhead registry, keyed by name.
static REGISTRY: Lazy<RwLock<HashMap<String, Arc<Bulkhead>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Get or create a named bulkhead. Capacity and wait budget apply only on
/// first creation.
pub fn get_bulkhead(name: &str, capacity: usize, max_wait: Option<Duration>) -> Arc<Bulkhead> {
    if let Some(bulkhead) = REGISTRY.read().expect("registry lock poisoned").get(name) {
        return Arc::clone(bulkhead);
    }

    let mut registry = REGISTRY.write().expect("registry lock poisoned");
    Arc::clone(
        registry
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Bulkhead::new(name, capacity, max_wait))),
    )
}
