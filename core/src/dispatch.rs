//! Durable fan-out bookkeeping.
//!
//! Before an event is handed to its consumers, a [`DispatchEntry`] recording
//! how many consumers still have to finish is persisted. Each completion
//! decrements the count; the entry disappears exactly when it reaches zero.
//! Entries that survive a crash are the list of events whose denormalization
//! must be re-issued on the next start.

use crate::error::StoreError;
use crate::event::Event;
use crate::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

/// Outstanding consumer count for one in-flight event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatchEntry {
    /// Event id (queue key).
    pub id: String,
    /// The event being denormalized.
    pub event: Event,
    /// Consumers that have not completed yet.
    pub workers: usize,
    /// When the entry was first written.
    pub enqueued_at: DateTime<Utc>,
}

impl DispatchEntry {
    /// Create an entry stamped with the current time.
    #[must_use]
    pub fn new(id: impl Into<String>, event: Event, workers: usize) -> Self {
        Self {
            id: id.into(),
            event,
            workers,
            enqueued_at: Utc::now(),
        }
    }
}

/// Durable queue of [`DispatchEntry`] records keyed by event id.
///
/// `decrement` must be atomic across processes; it removes the entry when the
/// count reaches zero and reports whether it did.
pub trait DispatchQueue: Send + Sync {
    /// Insert or replace the entry with the same id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn push(&self, entry: DispatchEntry) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Every entry still in the queue.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn get_all(&self) -> BoxFuture<'_, Result<Vec<DispatchEntry>, StoreError>>;

    /// Decrement `workers`; returns `true` if the entry was removed.
    ///
    /// Returns `Ok(false)` for unknown ids.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn decrement<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<bool, StoreError>>;

    /// Remove an entry; idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails.
    fn remove<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<(), StoreError>>;
}
