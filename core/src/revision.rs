//! Per-aggregate revision tracking.
//!
//! The revision store holds, for every aggregate, the **next expected** event
//! revision. An event is admissible exactly when its revision equals the stored
//! value; admitting it moves the value to `revision + 1` through a
//! compare-and-swap on the old value.
//!
//! # Implementations
//!
//! - `InMemoryRevisionStore` (in `denormalizer-testing`): tests and single-process use
//!
//! Document, key-value and table-store backends implement the same trait.

use crate::error::StoreError;
use crate::event::Event;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stored revision state for one aggregate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RevisionEntry {
    /// Concatenated aggregate key (`context::aggregate::aggregateId`).
    pub id: String,
    /// Next expected event revision.
    pub revision: u64,
    /// Backend-specific extra data.
    pub data: Option<Value>,
}

impl RevisionEntry {
    /// Create an entry without extra data.
    #[must_use]
    pub fn new(id: impl Into<String>, revision: u64) -> Self {
        Self {
            id: id.into(),
            revision,
            data: None,
        }
    }
}

/// Durable revision state shared by every denormalizer instance.
///
/// All keys are scoped by a caller-configured `prefix`.
///
/// # Compare-and-swap
///
/// [`set`](RevisionStore::set) must be atomic on `(aggregate_id, old_revision)`:
/// - `old_revision == None`: succeeds only if no entry exists
/// - `old_revision == Some(r)`: succeeds only if the stored revision is `r`
///
/// Anything else returns [`StoreError::Concurrency`].
pub trait RevisionStore: Send + Sync {
    /// Load the entry for an aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn get<'a>(
        &'a self,
        prefix: &'a str,
        aggregate_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<RevisionEntry>, StoreError>>;

    /// Compare-and-swap the next expected revision of an aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Concurrency`] if `old_revision` does not match.
    fn set<'a>(
        &'a self,
        prefix: &'a str,
        aggregate_id: &'a str,
        data: Option<Value>,
        new_revision: u64,
        old_revision: Option<u64>,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Remember the last handled event (resume point for replays).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn save_last_event<'a>(
        &'a self,
        prefix: &'a str,
        event: &'a Event,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Load the last handled event.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn get_last_event<'a>(&'a self, prefix: &'a str)
    -> BoxFuture<'a, Result<Option<Event>, StoreError>>;

    /// Remove every entry under `prefix`, including the last event.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn clear<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, Result<(), StoreError>>;
}
