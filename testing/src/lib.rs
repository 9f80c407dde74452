//! # Denormalizer Testing
//!
//! Testing utilities for the event denormalizer.
//!
//! This crate provides:
//! - In-memory implementations of every store trait
//! - A repository wrapper that injects concurrency conflicts
//! - A builder for event documents
//! - Tracing setup for tests
//!
//! ## Example
//!
//! ```ignore
//! use denormalizer_testing::{EventBuilder, InMemoryRepository, InMemoryRevisionStore};
//!
//! #[tokio::test]
//! async fn test_user_projection() {
//!     let users = InMemoryRepository::new();
//!     let revisions = InMemoryRevisionStore::new();
//!     let (denormalizer, _signals) = build_denormalizer(&users, &revisions);
//!
//!     denormalizer
//!         .handle(EventBuilder::new("userCreated").aggregate("user", "u1").revision(1).build())
//!         .await
//!         .unwrap();
//!
//!     assert_eq!(users.len(), 1);
//!     assert_eq!(revisions.revision("revision", "user::u1"), Some(2));
//! }
//! ```

/// Event document builder
pub mod event_builder;

/// In-memory repositories
pub mod repository_mocks;

/// In-memory revision store and dispatch queue
pub mod store_mocks;

pub use event_builder::EventBuilder;
pub use repository_mocks::{FlakyRepository, InMemoryRepository};
pub use store_mocks::{InMemoryDispatchQueue, InMemoryRevisionStore};

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `debug` for the
/// denormalizer crates), writing through the test harness capture.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "denormalizer_runtime=debug,denormalizer_core=debug".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_target(false)
        .try_init();
}
