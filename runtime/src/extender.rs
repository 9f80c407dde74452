//! Event extenders.
//!
//! An extender enriches an event with data that is not part of the domain
//! payload, typically read from a view model. Two kinds exist and share this
//! type:
//!
//! - **Pre-event extenders** run before any view builder sees the event, in
//!   steady state and during replay.
//! - **Event extenders** run once every view builder finished; their output
//!   is the event published as "extended".
//!
//! # Example
//!
//! ```rust,ignore
//! let extender = EventExtender::new(EventTarget::new("orderPlaced"), |event, customer| {
//!     let name = customer.and_then(|vm| vm.get("name").cloned()).unwrap_or_default();
//!     Ok(event.extended("payload.customerName", name))
//! })
//! .with_collection(customers, "payload.customerId");
//! ```

use crate::collection::Collection;
use denormalizer_core::event::{Event, EventTarget};
use denormalizer_core::{DenormalizerError, Result, ViewModel, path};
use std::fmt;
use std::sync::Arc;

/// Extender callback: receives the event and the optional view model.
pub type ExtendFn = Arc<dyn Fn(Event, Option<&ViewModel>) -> anyhow::Result<Event> + Send + Sync>;

/// Enriches events addressed to one [`EventTarget`].
#[derive(Clone)]
pub struct EventExtender {
    target: EventTarget,
    collection: Option<(Arc<Collection>, String)>,
    handler: ExtendFn,
}

/// Extender applied before denormalization.
pub type PreEventExtender = EventExtender;

impl fmt::Debug for EventExtender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventExtender")
            .field("target", &self.target)
            .field(
                "collection",
                &self.collection.as_ref().map(|(c, id_path)| (c.name(), id_path)),
            )
            .finish_non_exhaustive()
    }
}

impl EventExtender {
    /// Create an extender for `target`.
    #[must_use]
    pub fn new<F>(target: EventTarget, handler: F) -> Self
    where
        F: Fn(Event, Option<&ViewModel>) -> anyhow::Result<Event> + Send + Sync + 'static,
    {
        Self {
            target,
            collection: None,
            handler: Arc::new(handler),
        }
    }

    /// Load a view model from `collection` by the id found at `id_path` in
    /// the event and hand it to the callback.
    #[must_use]
    pub fn with_collection(mut self, collection: Arc<Collection>, id_path: impl Into<String>) -> Self {
        self.collection = Some((collection, id_path.into()));
        self
    }

    /// Events this extender applies to.
    #[must_use]
    pub const fn target(&self) -> &EventTarget {
        &self.target
    }

    /// Produce the extended event.
    ///
    /// The view model is `None` when no collection is configured or the event
    /// has no id at the configured path; otherwise it is the stored view model
    /// or a blank one.
    ///
    /// # Errors
    ///
    /// - [`DenormalizerError::Store`] if loading the view model fails
    /// - [`DenormalizerError::Extender`] if the callback fails
    pub async fn extend(&self, event: Event) -> Result<Event> {
        let view_model = match &self.collection {
            Some((collection, id_path)) => match event.get(id_path).and_then(path::as_id) {
                Some(id) => Some(collection.load_view_model(&id).await?),
                None => {
                    tracing::debug!(extender = %self.target, id_path = %id_path, "Event has no id for extender lookup");
                    None
                }
            },
            None => None,
        };

        (self.handler)(event, view_model.as_ref()).map_err(|source| DenormalizerError::Extender {
            event: self.target.name.clone(),
            source: source.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use denormalizer_testing::InMemoryRepository;
    use serde_json::json;

    #[tokio::test]
    async fn extends_without_collection() {
        let extender = EventExtender::new(EventTarget::new("a"), |event, vm| {
            assert!(vm.is_none());
            Ok(event.extended("extra", json!(1)))
        });

        let event = extender.extend(Event::new(json!({ "name": "a" }))).await.unwrap();
        assert_eq!(event.get("extra"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn loads_view_model_by_id_path() {
        let repo = InMemoryRepository::new();
        repo.insert(ViewModel::stored("c1", json!({ "name": "Jane" }), 1));
        let customers = Arc::new(Collection::new("customers", Arc::new(repo)));

        let extender = EventExtender::new(EventTarget::new("orderPlaced"), |event, vm| {
            let name = vm.and_then(|vm| vm.get("name").cloned()).unwrap_or_default();
            Ok(event.extended("payload.customerName", name))
        })
        .with_collection(customers, "payload.customerId");

        let event = Event::new(json!({ "name": "orderPlaced", "payload": { "customerId": "c1" } }));
        let extended = extender.extend(event).await.unwrap();
        assert_eq!(extended.get("payload.customerName"), Some(&json!("Jane")));
    }

    #[tokio::test]
    async fn callback_error_is_wrapped() {
        let extender = EventExtender::new(EventTarget::new("a"), |_, _| Err(anyhow::anyhow!("nope")));
        let err = extender.extend(Event::new(json!({ "name": "a" }))).await.unwrap_err();
        assert!(matches!(err, DenormalizerError::Extender { ref event, .. } if event == "a"));
    }
}
