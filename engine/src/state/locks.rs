//! Per-ticket serialization
//!
//! Events for the same ticket must not interleave; events for different
//! tickets run fully in parallel. Each ticket key maps to its own async mutex,
//! created on first use and pruned once nobody holds or waits on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Prune idle entries once the table grows past this many keys
const PRUNE_THRESHOLD: usize = 1024;

/// Guard held for the duration of one ticket's unit of work
pub type TicketGuard = OwnedMutexGuard<()>;

/// Table of per-ticket async locks
#[derive(Default)]
pub struct TicketLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TicketLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &str) -> TicketGuard {
        let slot = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            if locks.len() >= PRUNE_THRESHOLD {
                Self::prune_idle(&mut locks);
            }
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    /// Number of keys currently tracked
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries nobody holds or waits on
    pub fn prune(&self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Self::prune_idle(&mut locks);
    }

    fn prune_idle(locks: &mut HashMap<String, Arc<AsyncMutex<()>>>) {
        locks.retain(|_, slot| Arc::strong_count(slot) > 1);
    }
}
