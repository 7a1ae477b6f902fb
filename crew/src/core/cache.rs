//! In-memory result cache keyed by literal query text.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::types::Artifact;

/// Unbounded cache of backend results.
///
/// Keys are compared byte-for-byte (no trimming or case folding). Entries live
/// until the cache is dropped or cleared and are never mutated after insertion,
/// so a poisoned lock still guards consistent data and is recovered.
#[derive(Debug, Default)]
pub struct ResultCache {
    entries: Mutex<HashMap<String, Arc<Artifact>>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the entry stored for `key`, if any.
    pub fn get(&self, key: &str) -> Option<Arc<Artifact>> {
        self.lock().get(key).cloned()
    }

    /// Insert or overwrite the entry for `key`.
    pub fn put(&self, key: impl Into<String>, entry: impl Into<Arc<Artifact>>) {
        self.lock().insert(key.into(), entry.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Artifact>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
