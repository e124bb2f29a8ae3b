//! Per-item async locks
//!
//! Reading an item's record, attempting the repair and writing the outcome happen under
//! the item's lock, so two libraries (or two runs sharing a process) never interleave on
//! the same record.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

#[derive(Default, Clone)]
pub struct ItemLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ItemLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to an item
    pub async fn acquire(&self, item_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            // Drop entries nobody holds or waits on
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks
                .entry(item_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Number of items currently tracked
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
