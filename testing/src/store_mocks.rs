//! In-memory revision store and dispatch queue.
//!
//! - [`InMemoryRevisionStore`]: `HashMap`-backed revisions with real CAS checks
//! - [`InMemoryDispatchQueue`]: `BTreeMap`-backed dispatch entries

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only happens after a test already panicked

use denormalizer_core::StoreError;
use denormalizer_core::dispatch::{DispatchEntry, DispatchQueue};
use denormalizer_core::event::Event;
use denormalizer_core::revision::{RevisionEntry, RevisionStore};
use futures::FutureExt;
use futures::future::{BoxFuture, ready};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct RevisionState {
    entries: HashMap<(String, String), RevisionEntry>,
    last_events: HashMap<String, Event>,
}

/// In-memory revision store for fast, deterministic tests.
///
/// Clones share state, so a test can keep one handle for assertions and give
/// another to the denormalizer.
///
/// # Example
///
/// ```
/// use denormalizer_testing::InMemoryRevisionStore;
/// use denormalizer_core::revision::RevisionStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryRevisionStore::new();
/// store.set("revision", "user::u1", None, 2, None).await?;
/// assert_eq!(store.revision("revision", "user::u1"), Some(2));
///
/// // A stale writer loses
/// assert!(store.set("revision", "user::u1", None, 2, Some(1)).await.is_err());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryRevisionStore {
    state: Arc<RwLock<RevisionState>>,
    failing_sets: Arc<AtomicUsize>,
}

impl InMemoryRevisionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next expected revision of an aggregate, if any.
    #[must_use]
    pub fn revision(&self, prefix: &str, aggregate_id: &str) -> Option<u64> {
        self.state
            .read()
            .unwrap()
            .entries
            .get(&(prefix.to_string(), aggregate_id.to_string()))
            .map(|entry| entry.revision)
    }

    /// Write an entry directly, bypassing the CAS check.
    pub fn insert(&self, prefix: &str, entry: RevisionEntry) {
        self.state
            .write()
            .unwrap()
            .entries
            .insert((prefix.to_string(), entry.id.clone()), entry);
    }

    /// Last event saved under `prefix`.
    #[must_use]
    pub fn last_event(&self, prefix: &str) -> Option<Event> {
        self.state.read().unwrap().last_events.get(prefix).cloned()
    }

    /// Number of aggregates tracked under any prefix.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().unwrap().entries.len()
    }

    /// Whether no aggregate is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().unwrap().entries.is_empty()
    }

    /// Make the next `count` calls to `set` fail with a concurrency conflict,
    /// as if another instance had won the race.
    pub fn fail_next_sets(&self, count: usize) {
        self.failing_sets.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_sets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn compare_and_set(
        &self,
        prefix: &str,
        aggregate_id: &str,
        data: Option<Value>,
        new_revision: u64,
        old_revision: Option<u64>,
    ) -> Result<(), StoreError> {
        let conflict = |actual| StoreError::Concurrency {
            key: aggregate_id.to_string(),
            expected: old_revision,
            actual,
        };

        let mut state = self.state.write().unwrap();
        let key = (prefix.to_string(), aggregate_id.to_string());
        let actual = state.entries.get(&key).map(|entry| entry.revision);
        if self.take_injected_failure() {
            return Err(conflict(actual));
        }
        if actual != old_revision {
            return Err(conflict(actual));
        }

        state.entries.insert(
            key,
            RevisionEntry {
                id: aggregate_id.to_string(),
                revision: new_revision,
                data,
            },
        );
        Ok(())
    }
}

impl RevisionStore for InMemoryRevisionStore {
    fn get<'a>(
        &'a self,
        prefix: &'a str,
        aggregate_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<RevisionEntry>, StoreError>> {
        let entry = self
            .state
            .read()
            .unwrap()
            .entries
            .get(&(prefix.to_string(), aggregate_id.to_string()))
            .cloned();
        ready(Ok(entry)).boxed()
    }

    fn set<'a>(
        &'a self,
        prefix: &'a str,
        aggregate_id: &'a str,
        data: Option<Value>,
        new_revision: u64,
        old_revision: Option<u64>,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        ready(self.compare_and_set(prefix, aggregate_id, data, new_revision, old_revision)).boxed()
    }

    fn save_last_event<'a>(
        &'a self,
        prefix: &'a str,
        event: &'a Event,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        self.state
            .write()
            .unwrap()
            .last_events
            .insert(prefix.to_string(), event.clone());
        ready(Ok(())).boxed()
    }

    fn get_last_event<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<Option<Event>, StoreError>> {
        ready(Ok(self.last_event(prefix))).boxed()
    }

    fn clear<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        let mut state = self.state.write().unwrap();
        state.entries.retain(|(entry_prefix, _), _| entry_prefix != prefix);
        state.last_events.remove(prefix);
        ready(Ok(())).boxed()
    }
}

/// In-memory dispatch queue.
///
/// `decrement` holds the lock for the whole read-modify-write, which is the
/// atomicity a shared backend has to provide.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDispatchQueue {
    entries: Arc<RwLock<BTreeMap<String, DispatchEntry>>>,
}

impl InMemoryDispatchQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Outstanding consumers of an event, if it is still queued.
    #[must_use]
    pub fn workers(&self, id: &str) -> Option<usize> {
        self.entries.read().unwrap().get(id).map(|entry| entry.workers)
    }

    /// Number of queued events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Whether every dispatched event completed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

impl DispatchQueue for InMemoryDispatchQueue {
    fn push(&self, entry: DispatchEntry) -> BoxFuture<'_, Result<(), StoreError>> {
        self.entries.write().unwrap().insert(entry.id.clone(), entry);
        ready(Ok(())).boxed()
    }

    fn get_all(&self) -> BoxFuture<'_, Result<Vec<DispatchEntry>, StoreError>> {
        let entries = self.entries.read().unwrap().values().cloned().collect();
        ready(Ok(entries)).boxed()
    }

    fn decrement<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<bool, StoreError>> {
        let mut entries = self.entries.write().unwrap();
        let removed = match entries.get_mut(id) {
            Some(entry) if entry.workers > 1 => {
                entry.workers -= 1;
                false
            }
            Some(_) => {
                entries.remove(id);
                true
            }
            None => false,
        };
        ready(Ok(removed)).boxed()
    }

    fn remove<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        self.entries.write().unwrap().remove(id);
        ready(Ok(())).boxed()
    }
}
