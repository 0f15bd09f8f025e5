//! Per-library locks for read-modify-write sequences
//!
//! Contention stays local to one library: writers to different libraries
//! never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub(crate) struct LibraryLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LibraryLocks {
    /// Run `f` while holding the lock for `library`
    pub(crate) fn with_lock<T>(&self, library: &str, f: impl FnOnce() -> T) -> T {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(library.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        f()
    }
}
