//! Per-build serialization of state transitions.

use cinder_core::BuildId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

/// Above this many entries, idle locks are pruned on acquire.
const PRUNE_THRESHOLD: usize = 256;

/// One async mutex per build.
///
/// Every job transition and the status reduction that follows it run while
/// holding the build's lock, so two jobs finishing together cannot race.
#[derive(Default)]
pub struct BuildLocks {
    locks: Mutex<HashMap<BuildId, Arc<tokio::sync::Mutex<()>>>>,
}

impl BuildLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, id: BuildId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            if locks.len() > PRUNE_THRESHOLD {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks.entry(id).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
