//! # Denormalizer Core
//!
//! Core types and store traits for the event denormalizer.
//!
//! The denormalizer is the read side of a CQRS system: it consumes domain
//! events from the write side and applies them to view models. This crate
//! holds the vocabulary every other crate shares; the ordering, dispatch and
//! replay machinery lives in `denormalizer-runtime`.
//!
//! ## Core Concepts
//!
//! - **Event**: an immutable JSON document located through an [`EventDefinition`]
//! - **Revision**: per-aggregate sequence number; the [`RevisionStore`] holds the
//!   next expected one
//! - **View model**: a projection record persisted by a [`Repository`]
//! - **Dispatch entry**: durable count of consumers still working on an event,
//!   kept in a [`DispatchQueue`]
//! - **Signal**: notification, extended event or missing-event alert
//!
//! ## Store Traits
//!
//! Backends implement three narrow traits, all dyn-compatible:
//!
//! ```text
//! RevisionStore   get / set (CAS) / save_last_event / get_last_event / clear
//! Repository      get / find / commit (CAS) / get_new_id / clear
//! DispatchQueue   push / get_all / decrement / remove
//! ```
//!
//! [`EventDefinition`]: event::EventDefinition
//! [`RevisionStore`]: revision::RevisionStore
//! [`Repository`]: projection::Repository
//! [`DispatchQueue`]: dispatch::DispatchQueue

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

/// Configuration with environment overrides
pub mod config;

/// Durable fan-out bookkeeping
pub mod dispatch;

/// Error types
pub mod error;

/// Event documents, definitions and targets
pub mod event;

/// Notifications and other outbound signals
pub mod notification;

/// Dotted-path access into JSON documents
pub mod path;

/// View models and repositories
pub mod projection;

/// Per-aggregate revision tracking
pub mod revision;

pub use error::{DenormalizerError, Result, StoreError};
pub use event::{Event, EventDefinition, EventIdentity, EventTarget};
pub use notification::{DenormalizerSignal, MissingEvent, Notification};
pub use projection::{ActionOnCommit, FindOptions, Repository, ViewModel};
