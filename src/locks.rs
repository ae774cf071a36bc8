//! Per-instance serialization for concurrent background tasks.
//!
//! The health poll, billing tick, reconciliation loop, and cleanup sweep
//! run concurrently, but mutations of a single instance must not
//! interleave. Each instance gets its own async mutex; cross-instance
//! work stays fully parallel and there is no global lock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lazily-populated map of per-instance exclusive locks.
#[derive(Debug, Default)]
pub struct InstanceLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl InstanceLocks {
    /// Acquire the exclusive lock for an instance, creating it on first use.
    ///
    /// The guard is owned so it can be held across await points inside a
    /// single task's critical section.
    pub async fn acquire(&self, instance_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(
                locks
                    .entry(instance_id.to_owned())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    /// Drop the lock entry for an instance that reached a terminal state.
    ///
    /// The entry is removed only once no other task holds or awaits the
    /// mutex; removing it earlier would let a later `acquire` mint a
    /// second lock for the same instance while the old one still guards
    /// a critical section.
    pub async fn forget(&self, instance_id: &str) {
        let mut locks = self.locks.lock().await;
        if locks
            .get(instance_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(instance_id);
        }
    }
}
