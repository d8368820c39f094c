use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Returned by [`ConcurrencyGate::acquire`] once the gate has been closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("concurrency gate is closed")]
pub struct GateClosed;

/// Counting admission gate bounding how many probes run at once.
///
/// Clones share the same slots.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ConcurrencyGate {
    /// Largest number of slots a gate can hold
    pub const MAX_CAPACITY: usize = Semaphore::MAX_PERMITS;

    /// Creates a gate with `capacity` slots, clamped to `1..=MAX_CAPACITY`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, Self::MAX_CAPACITY);
        Self { semaphore: Arc::new(Semaphore::new(capacity)), capacity }
    }

    /// Waits for a free slot. Waiters are admitted roughly in arrival order.
    pub async fn acquire(&self) -> Result<GatePermit, GateClosed> {
        let permit = self.semaphore.clone().acquire_owned().await.map_err(|_| GateClosed)?;
        Ok(GatePermit { _permit: permit })
    }

    /// Wakes every waiter with [`GateClosed`]; permits already handed out stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }
}

/// One occupied slot. Released on drop.
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

impl GatePermit {
    pub fn release(self) {}
}
