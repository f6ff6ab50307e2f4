//! Local persistence for the thread collection.
//!
//! The store is a mirror, not a synchronization primitive: the engine reads it
//! once at startup and writes the whole collection after every transition.

pub mod schema;
mod sqlite;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::StoreError;
use crate::types::{RemoteId, Thread};

pub use sqlite::SqliteStore;

/// Synchronous persistence contract used by the engine.
pub trait LocalStore: Send + Sync {
    fn load(&self) -> Result<Vec<Thread>, StoreError>;

    fn save(&self, threads: &[Thread]) -> Result<(), StoreError>;

    fn load_tombstones(&self) -> Result<Vec<RemoteId>, StoreError> {
        Ok(Vec::new())
    }

    fn save_tombstones(&self, _ids: &[RemoteId]) -> Result<(), StoreError> {
        Ok(())
    }

    fn preference(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Ok(None)
    }

    fn set_preference(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Default)]
struct MemoryContents {
    threads: Vec<Thread>,
    tombstones: BTreeSet<RemoteId>,
    preferences: HashMap<String, String>,
}

/// Process-local store. Counts saves so tests can assert persistence happened.
#[derive(Default)]
pub struct MemoryStore {
    contents: Mutex<MemoryContents>,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that starts out holding `threads`, as if loaded from disk.
    pub fn with_threads(threads: Vec<Thread>) -> Self {
        let store = Self::default();
        store.lock().threads = threads;
        store
    }

    fn lock(&self) -> MutexGuard<'_, MemoryContents> {
        self.contents.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of what was last saved.
    pub fn saved_threads(&self) -> Vec<Thread> {
        self.lock().threads.clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl LocalStore for MemoryStore {
    fn load(&self) -> Result<Vec<Thread>, StoreError> {
        Ok(self.lock().threads.clone())
    }

    fn save(&self, threads: &[Thread]) -> Result<(), StoreError> {
        self.lock().threads = threads.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load_tombstones(&self) -> Result<Vec<RemoteId>, StoreError> {
        Ok(self.lock().tombstones.iter().cloned().collect())
    }

    fn save_tombstones(&self, ids: &[RemoteId]) -> Result<(), StoreError> {
        self.lock().tombstones.extend(ids.iter().cloned());
        Ok(())
    }

    fn preference(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().preferences.get(key).cloned())
    }

    fn set_preference(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock().preferences.insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_tombstones_only_grow() {
        let store = MemoryStore::new();
        store.save_tombstones(&[RemoteId::from("1")]).expect("save");
        store.save_tombstones(&[RemoteId::from("2")]).expect("save");
        assert_eq!(
            store.load_tombstones().expect("load"),
            vec![RemoteId::from("1"), RemoteId::from("2")]
        );
    }

    #[test]
    fn memory_store_preferences_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.preference("scope").expect("get"), None);
        store.set_preference("scope", "/home@v1").expect("set");
        assert_eq!(store.preference("scope").expect("get").as_deref(), Some("/home@v1"));
    }
}
