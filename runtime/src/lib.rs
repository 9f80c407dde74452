//! # Denormalizer Runtime
//!
//! Runtime for the event denormalizer: the machinery that turns an unordered,
//! at-least-once stream of domain events into consistent view models.
//!
//! ## Core Components
//!
//! - **`OrderQueue`**: per-aggregate buffer of out-of-order events with
//!   re-arming timeouts
//! - **`RevisionGuard`**: admits events in strict revision order, buffers gaps,
//!   drops stale duplicates and reports missing events
//! - **`EventDispatcher`**: fans an admitted event out to its view builders and
//!   tracks completion in a durable dispatch queue
//! - **`ViewBuilder`**: applies one event to the view models of one collection,
//!   retrying optimistic-concurrency conflicts
//! - **`ReplayHandler`**: rebuilds read models from history in bulk
//! - **`Denormalizer`**: all of the above assembled over one dispatch tree
//!
//! ## Flow
//!
//! ```text
//! event ─► RevisionGuard ─► EventDispatcher ─► ViewBuilder × N ─► Collection ─► Repository
//!               │                  │                  │
//!               ▼                  ▼                  ▼
//!         EventMissing       EventExtended      Notification      (signals)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use denormalizer_runtime::{Collection, Denormalizer, DispatchTree, ViewBuilder};
//! use denormalizer_core::EventTarget;
//!
//! let users = Arc::new(Collection::new("users", repository));
//! let tree = DispatchTree::builder().view_builder(
//!     ViewBuilder::new(EventTarget::new("userCreated"), users)
//!         .with_handler(|event, vm| {
//!             vm.set("name", event.get("payload.name").cloned().unwrap_or_default());
//!             Ok(())
//!         }),
//! );
//!
//! let (denormalizer, signals) = Denormalizer::builder()
//!     .dispatch_tree(tree)
//!     .revision_store(revisions)
//!     .dispatch_queue(queue)
//!     .build()?;
//!
//! denormalizer.handle(event).await?;
//! ```

/// View model collections with replay buffering
pub mod collection;

/// Assembled denormalizer
pub mod denormalizer;

/// Routing table from events to consumers
pub mod dispatch_tree;

/// Fan-out of admitted events
pub mod dispatcher;

/// Event extenders run before and after denormalization
pub mod extender;

/// Prometheus metrics
pub mod metrics;

/// Per-key buffer with re-arming timeouts
pub mod order_queue;

/// Bulk rebuild from history
pub mod replay;

/// Jittered retry for optimistic concurrency conflicts
pub mod retry;

/// Per-aggregate revision ordering
pub mod revision_guard;

/// Outbound signal channel
pub mod signals;

/// Event handlers bound to a collection
pub mod view_builder;

pub use collection::Collection;
pub use denormalizer::{Denormalizer, DenormalizerBuilder};
pub use dispatch_tree::{DispatchTree, DispatchTreeBuilder};
pub use dispatcher::EventDispatcher;
pub use extender::{EventExtender, PreEventExtender};
pub use order_queue::{Escalation, OrderQueue, QueuedItem};
pub use replay::{ReplayError, ReplayHandler, ReplayStream, ReplaySummary};
pub use revision_guard::{GuardOutcome, RevisionGuard};
pub use signals::SignalSender;
pub use view_builder::ViewBuilder;
