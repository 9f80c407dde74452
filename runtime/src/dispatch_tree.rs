//! Registry of view builders, extenders and collections.
//!
//! The dispatch tree answers one question: which consumers does an event
//! with a given `(name, aggregate, context)` go to? It is built once and then
//! shared read-only by the dispatcher and the replay handler.

use crate::collection::Collection;
use crate::extender::{EventExtender, PreEventExtender};
use crate::view_builder::{DEFAULT_RETRY_TIMEOUT, ViewBuilder};
use denormalizer_core::event::{EventDefinition, EventIdentity};
use std::sync::Arc;
use std::time::Duration;

/// Immutable routing table for events.
#[derive(Debug, Default)]
pub struct DispatchTree {
    collections: Vec<Arc<Collection>>,
    view_builders: Vec<Arc<ViewBuilder>>,
    extenders: Vec<Arc<EventExtender>>,
    pre_extenders: Vec<Arc<PreEventExtender>>,
}

impl DispatchTree {
    /// Start building a tree.
    #[must_use]
    pub fn builder() -> DispatchTreeBuilder {
        DispatchTreeBuilder::default()
    }

    /// View builders subscribed to the event, prioritized ones first in
    /// ascending priority, then unordered ones in registration order.
    #[must_use]
    pub fn view_builders_for(&self, identity: &EventIdentity) -> Vec<Arc<ViewBuilder>> {
        let mut builders: Vec<Arc<ViewBuilder>> = self
            .view_builders
            .iter()
            .filter(|builder| builder.target().matches(identity))
            .cloned()
            .collect();
        builders.sort_by_key(|builder| builder.priority().map_or((1, 0), |p| (0, p)));
        builders
    }

    /// Number of view builders an event fans out to.
    #[must_use]
    pub fn consumer_count(&self, identity: &EventIdentity) -> usize {
        self.view_builders
            .iter()
            .filter(|builder| builder.target().matches(identity))
            .count()
    }

    /// The extender run after every view builder finished.
    #[must_use]
    pub fn extender_for(&self, identity: &EventIdentity) -> Option<Arc<EventExtender>> {
        self.extenders
            .iter()
            .find(|extender| extender.target().matches(identity))
            .cloned()
    }

    /// The extender run before any view builder.
    #[must_use]
    pub fn pre_extender_for(&self, identity: &EventIdentity) -> Option<Arc<PreEventExtender>> {
        self.pre_extenders
            .iter()
            .find(|extender| extender.target().matches(identity))
            .cloned()
    }

    /// Every registered collection.
    #[must_use]
    pub fn collections(&self) -> &[Arc<Collection>] {
        &self.collections
    }

    /// Look up a collection by name.
    #[must_use]
    pub fn collection(&self, name: &str) -> Option<&Arc<Collection>> {
        self.collections.iter().find(|c| c.name() == name)
    }
}

/// Builder for [`DispatchTree`].
#[derive(Debug, Default)]
pub struct DispatchTreeBuilder {
    collections: Vec<Arc<Collection>>,
    view_builders: Vec<ViewBuilder>,
    extenders: Vec<EventExtender>,
    pre_extenders: Vec<PreEventExtender>,
    definition: Option<EventDefinition>,
    retry_timeout: Option<Duration>,
}

impl DispatchTreeBuilder {
    /// Register a collection. Collections of view builders are registered
    /// automatically.
    #[must_use]
    pub fn collection(mut self, collection: Arc<Collection>) -> Self {
        self.add_collection(collection);
        self
    }

    /// Register a view builder.
    #[must_use]
    pub fn view_builder(mut self, builder: ViewBuilder) -> Self {
        self.add_collection(Arc::clone(builder.collection()));
        self.view_builders.push(builder);
        self
    }

    /// Register an extender run after denormalization.
    #[must_use]
    pub fn extender(mut self, extender: EventExtender) -> Self {
        self.extenders.push(extender);
        self
    }

    /// Register an extender run before denormalization.
    #[must_use]
    pub fn pre_extender(mut self, extender: PreEventExtender) -> Self {
        self.pre_extenders.push(extender);
        self
    }

    /// Event definition for view builders without their own.
    #[must_use]
    pub fn definition(mut self, definition: EventDefinition) -> Self {
        self.definition = Some(definition);
        self
    }

    /// Conflict retry bound for view builders without their own.
    #[must_use]
    pub const fn retry_timeout(mut self, retry_timeout: Duration) -> Self {
        self.retry_timeout = Some(retry_timeout);
        self
    }

    fn add_collection(&mut self, collection: Arc<Collection>) {
        if !self.collections.iter().any(|c| Arc::ptr_eq(c, &collection)) {
            self.collections.push(collection);
        }
    }

    /// Freeze the tree.
    #[must_use]
    pub fn build(self) -> DispatchTree {
        let definition = self.definition.unwrap_or_default();
        let retry_timeout = self.retry_timeout.unwrap_or(DEFAULT_RETRY_TIMEOUT);

        let view_builders = self
            .view_builders
            .into_iter()
            .map(|mut builder| {
                builder.inherit(&definition, retry_timeout);
                Arc::new(builder)
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            collections = self.collections.len(),
            view_builders = view_builders.len(),
            extenders = self.extenders.len(),
            pre_extenders = self.pre_extenders.len(),
            "Dispatch tree built"
        );

        DispatchTree {
            collections: self.collections,
            view_builders,
            extenders: self.extenders.into_iter().map(Arc::new).collect(),
            pre_extenders: self.pre_extenders.into_iter().map(Arc::new).collect(),
        }
    }
}
