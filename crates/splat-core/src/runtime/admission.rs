use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// RAII guard that releases a worker slot when dropped.
///
/// Callers must hold this until the external tool process has exited.
pub struct Permit {
    #[allow(dead_code)]
    permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit").finish()
    }
}

/// Fixed number of slots for concurrently running tool processes.
///
/// Unlike a fail-fast admission check, [`WorkerPool::acquire`] waits: jobs
/// beyond the capacity queue in FIFO order until a slot frees.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    /// A pool with `capacity` slots; zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots not currently held.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a free slot. `None` only if the pool was closed.
    pub async fn acquire(&self) -> Option<Permit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .ok()
            .map(|permit| Permit { permit })
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<Permit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| Permit { permit })
    }
}
