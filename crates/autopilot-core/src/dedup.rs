use std::collections::HashSet;
use std::sync::Mutex;

/// Keys of runs currently in flight. At most one run per key.
///
/// The lock is never held across an await point.
#[derive(Debug, Default)]
pub struct DedupGuard {
    in_flight: Mutex<HashSet<String>>,
}

impl DedupGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim `key`. Returns false if a run for it is already active.
    pub fn try_acquire(&self, key: &str) -> bool {
        match self.in_flight.lock() {
            Ok(mut set) => set.insert(key.to_string()),
            Err(poisoned) => poisoned.into_inner().insert(key.to_string()),
        }
    }

    pub fn release(&self, key: &str) {
        match self.in_flight.lock() {
            Ok(mut set) => set.remove(key),
            Err(poisoned) => poisoned.into_inner().remove(key),
        };
    }

    pub fn is_active(&self, key: &str) -> bool {
        match self.in_flight.lock() {
            Ok(set) => set.contains(key),
            Err(poisoned) => poisoned.into_inner().contains(key),
        }
    }

    pub fn active_count(&self) -> usize {
        match self.in_flight.lock() {
            Ok(set) => set.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}
