//! The in-memory registry provided by codefetch.

use codefetch_api::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// An in-memory [Registry].
///
/// This is NOT a production module. It backs the node driver and tests.
#[derive(Debug, Default)]
pub struct MemRegistry {
    entries: Mutex<HashMap<ContentKey, RegistryEntry>>,
}

impl MemRegistry {
    /// Construct a new, empty MemRegistry.
    pub fn create() -> Arc<MemRegistry> {
        Arc::new(MemRegistry::default())
    }

    /// Add or replace the entry for `key`.
    pub fn insert(&self, key: ContentKey, entry: RegistryEntry) {
        self.entries.lock().unwrap().insert(key, entry);
    }

    /// Remove the entry for `key`, returning it.
    pub fn remove(&self, key: ContentKey) -> Option<RegistryEntry> {
        self.entries.lock().unwrap().remove(&key)
    }

    /// The fetch status recorded for `key`.
    pub fn status(&self, key: ContentKey) -> Option<FetchStatus> {
        self.entries.lock().unwrap().get(&key).map(|e| e.status)
    }
}

impl Registry for MemRegistry {
    fn lookup(&self, key: ContentKey) -> Option<RegistryEntry> {
        self.entries.lock().unwrap().get(&key).copied()
    }

    fn set_status(&self, key: ContentKey, status: FetchStatus) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&key) {
            entry.status = status;
        }
    }
}
