//! Error types shared by every denormalizer component.

use crate::event::EventError;
use thiserror::Error;

/// Errors returned by store backends (revision store, repositories, dispatch queue).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Optimistic concurrency conflict: the stored revision is not the one the
    /// writer read.
    #[error("Concurrency conflict on '{key}': expected revision {expected:?}, found {actual:?}")]
    Concurrency {
        /// Key of the record that was written concurrently.
        key: String,
        /// Revision the writer expected to replace.
        expected: Option<u64>,
        /// Revision actually found in the store.
        actual: Option<u64>,
    },

    /// Connectivity or other backend failure.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether this is an optimistic concurrency conflict.
    #[must_use]
    pub const fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::Concurrency { .. })
    }
}

/// Errors surfaced by guard, dispatch, denormalize and replay operations.
#[derive(Error, Debug)]
pub enum DenormalizerError {
    /// A store backend failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The event could not be read through its definition.
    #[error(transparent)]
    Event(#[from] EventError),

    /// No transformation is registered for the event on this collection.
    ///
    /// This is a configuration error and is never retried.
    #[error("No handler registered for event '{event}' on collection '{collection}'")]
    MissingHandler {
        /// Event type name.
        event: String,
        /// Collection the view builder writes to.
        collection: String,
    },

    /// A view builder handler returned an error.
    #[error("Handler for event '{event}' on collection '{collection}' failed: {source}")]
    Handler {
        /// Event type name.
        event: String,
        /// Collection the view builder writes to.
        collection: String,
        /// The handler's error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A background task (replay worker) panicked or was cancelled.
    #[error("Background task failed: {0}")]
    TaskFailed(String),

    /// An event extender returned an error.
    #[error("Extender for event '{event}' failed: {source}")]
    Extender {
        /// Event type name.
        event: String,
        /// The extender's error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl DenormalizerError {
    /// Whether this error is a store concurrency conflict.
    #[must_use]
    pub const fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_concurrency_conflict())
    }
}

/// Result type for denormalizer operations.
pub type Result<T> = std::result::Result<T, DenormalizerError>;
