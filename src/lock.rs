use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

pub const FREQUENT_PLACES_UPDATE: &str = "frequent_places_update";

#[derive(Clone, Default)]
pub struct LockTable {
    held: Arc<Mutex<HashSet<String>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, key: &str) -> Option<LockGuard> {
        let mut held = self.held.lock();
        if !held.insert(key.to_string()) {
            trace!(target: "lock_table", key, "lock already held");
            return None;
        }
        Some(LockGuard {
            table: Arc::clone(&self.held),
            key: key.to_string(),
        })
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.lock().contains(key)
    }
}

#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    table: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.table.lock().remove(&self.key);
        trace!(target: "lock_table", key = %self.key, "lock released");
    }
}
