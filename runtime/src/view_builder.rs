//! View builders: apply one event type to one collection.
//!
//! A view builder subscribes to an [`EventTarget`] and owns a pure
//! transformation `(event, &mut view model)`. [`ViewBuilder::denormalize`]
//! runs the full cycle:
//!
//! 1. Resolve the target view models (by id path, by query, or a fresh id)
//! 2. Load each one (blank with collection defaults if absent)
//! 3. Apply the transformation
//! 4. Build a [`Notification`] from the event and the updated view model
//! 5. Save through the collection
//!
//! A concurrency conflict on save reloads the conflicting view model and
//! applies the transformation to it again after a random pause in
//! `[0, retry_timeout]`, without a retry ceiling. Every other error is
//! returned.
//!
//! # Example
//!
//! ```rust,ignore
//! let builder = ViewBuilder::new(EventTarget::new("userCreated").aggregate("user"), users)
//!     .with_handler(|event, vm| {
//!         vm.set("email", event.get("payload.email").cloned().unwrap_or_default());
//!         Ok(())
//!     });
//!
//! let notifications = builder.denormalize(&event).await?;
//! ```

use crate::collection::Collection;
use crate::metrics::ViewBuilderMetrics;
use crate::retry::retry_with_jitter;
use denormalizer_core::event::{Event, EventDefinition, EventIdentity, EventTarget};
use denormalizer_core::notification::{EventReference, Notification};
use denormalizer_core::projection::FindOptions;
use denormalizer_core::{DenormalizerError, Result, ViewModel, path};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Default upper bound of the conflict retry delay.
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_millis(800);

static DEFAULT_DEFINITION: LazyLock<EventDefinition> = LazyLock::new(EventDefinition::default);

/// Transformation applied to each target view model.
pub type ViewHandler = Arc<dyn Fn(&Event, &mut ViewModel) -> anyhow::Result<()> + Send + Sync>;

/// Builds an equality query selecting the view models an event applies to.
pub type QueryFn = Arc<dyn Fn(&Event) -> Value + Send + Sync>;

/// Applies events addressed to one target to one collection.
#[derive(Clone)]
pub struct ViewBuilder {
    target: EventTarget,
    collection: Arc<Collection>,
    definition: Option<EventDefinition>,
    id_path: Option<String>,
    query: Option<QueryFn>,
    auto_create: bool,
    priority: Option<u32>,
    handler: Option<ViewHandler>,
    retry_timeout: Option<Duration>,
}

impl fmt::Debug for ViewBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewBuilder")
            .field("target", &self.target)
            .field("collection", &self.collection.name())
            .field("id_path", &self.id_path)
            .field("query", &self.query.is_some())
            .field("auto_create", &self.auto_create)
            .field("priority", &self.priority)
            .field("handler", &self.handler.is_some())
            .finish_non_exhaustive()
    }
}

impl ViewBuilder {
    /// Create a view builder writing to `collection`.
    ///
    /// Without [`with_handler`](Self::with_handler) every denormalization
    /// fails with [`DenormalizerError::MissingHandler`].
    #[must_use]
    pub fn new(target: EventTarget, collection: Arc<Collection>) -> Self {
        Self {
            target,
            collection,
            definition: None,
            id_path: None,
            query: None,
            auto_create: true,
            priority: None,
            handler: None,
            retry_timeout: None,
        }
    }

    /// Set the transformation.
    #[must_use]
    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Event, &mut ViewModel) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Read the view model id from `id_path` instead of the aggregate id.
    #[must_use]
    pub fn with_id_path(mut self, id_path: impl Into<String>) -> Self {
        self.id_path = Some(id_path.into());
        self
    }

    /// Apply the transformation to every view model matching a query built
    /// from the event.
    #[must_use]
    pub fn with_query<F>(mut self, query: F) -> Self
    where
        F: Fn(&Event) -> Value + Send + Sync + 'static,
    {
        self.query = Some(Arc::new(query));
        self
    }

    /// When `false`, events addressed to view models that do not exist yet
    /// are ignored.
    #[must_use]
    pub const fn with_auto_create(mut self, auto_create: bool) -> Self {
        self.auto_create = auto_create;
        self
    }

    /// Run before unprioritized builders, in ascending priority order.
    #[must_use]
    pub const fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Use a custom event definition.
    #[must_use]
    pub fn with_definition(mut self, definition: EventDefinition) -> Self {
        self.definition = Some(definition);
        self
    }

    /// Set the upper bound of the conflict retry delay.
    #[must_use]
    pub const fn with_retry_timeout(mut self, retry_timeout: Duration) -> Self {
        self.retry_timeout = Some(retry_timeout);
        self
    }

    /// Fill in settings that were not set explicitly.
    pub(crate) fn inherit(&mut self, definition: &EventDefinition, retry_timeout: Duration) {
        if self.definition.is_none() {
            self.definition = Some(definition.clone());
        }
        if self.retry_timeout.is_none() {
            self.retry_timeout = Some(retry_timeout);
        }
    }

    /// Events this builder subscribes to.
    #[must_use]
    pub const fn target(&self) -> &EventTarget {
        &self.target
    }

    /// Collection this builder writes to.
    #[must_use]
    pub const fn collection(&self) -> &Arc<Collection> {
        &self.collection
    }

    /// Scheduling priority; `None` is unordered and runs last.
    #[must_use]
    pub const fn priority(&self) -> Option<u32> {
        self.priority
    }

    /// The event definition in effect.
    #[must_use]
    pub fn definition(&self) -> &EventDefinition {
        self.definition.as_ref().unwrap_or(&DEFAULT_DEFINITION)
    }

    /// Upper bound of the conflict retry delay in effect.
    #[must_use]
    pub fn retry_timeout(&self) -> Duration {
        self.retry_timeout.unwrap_or(DEFAULT_RETRY_TIMEOUT)
    }

    /// Apply `event` to the target view models and return one notification
    /// per committed view model.
    ///
    /// # Errors
    ///
    /// - [`DenormalizerError::MissingHandler`] if no transformation is set
    /// - [`DenormalizerError::Handler`] if the transformation fails
    /// - [`DenormalizerError::Event`] if the event cannot be read
    /// - [`DenormalizerError::Store`] for any store failure except conflicts,
    ///   which are retried
    #[tracing::instrument(skip_all, fields(collection = %self.collection.name(), builder = %self.target))]
    pub async fn denormalize(&self, event: &Event) -> Result<Vec<Notification>> {
        let Some(handler) = &self.handler else {
            return Err(DenormalizerError::MissingHandler {
                event: self.target.name.clone(),
                collection: self.collection.name().to_string(),
            });
        };

        let identity = self.definition().identity(event)?;
        let started = Instant::now();

        let view_models = self.load_targets(event).await?;
        let mut notifications = Vec::with_capacity(view_models.len());
        for vm in view_models {
            if let Some(notification) = self.handle_one(event, &identity, handler, vm).await? {
                notifications.push(notification);
            }
        }

        ViewBuilderMetrics::record_denormalize(notifications.len(), started.elapsed());
        tracing::debug!(event = %identity, commits = notifications.len(), "Event denormalized");
        Ok(notifications)
    }

    /// Apply and commit one view model. A conflict reloads that view model
    /// alone and applies the transformation again, so view models already
    /// committed for this event are never touched twice.
    async fn handle_one(
        &self,
        event: &Event,
        identity: &EventIdentity,
        handler: &ViewHandler,
        vm: ViewModel,
    ) -> Result<Option<Notification>> {
        let id = vm.id().to_string();
        let id = id.as_str();
        let mut loaded = Some(vm);

        retry_with_jitter(
            self.retry_timeout(),
            || {
                let loaded = loaded.take();
                async move {
                    let vm = match loaded {
                        Some(vm) => vm,
                        None => self.collection.load_view_model(id).await?,
                    };
                    self.apply(event, identity, handler, vm).await
                }
            },
            DenormalizerError::is_concurrency_conflict,
        )
        .await
    }

    async fn apply(
        &self,
        event: &Event,
        identity: &EventIdentity,
        handler: &ViewHandler,
        mut vm: ViewModel,
    ) -> Result<Option<Notification>> {
        if vm.is_new() && !self.auto_create {
            tracing::debug!(view_model = vm.id(), "View model does not exist, skipping");
            return Ok(None);
        }

        handler(event, &mut vm).map_err(|source| DenormalizerError::Handler {
            event: identity.name.clone(),
            collection: self.collection.name().to_string(),
            source: source.into(),
        })?;

        let notification = self.notification(event, identity, &vm);
        self.collection.save_view_model(vm).await?;
        Ok(Some(notification))
    }

    async fn load_targets(&self, event: &Event) -> Result<Vec<ViewModel>> {
        if let Some(query) = &self.query {
            let query = query(event);
            return self.collection.find_view_models(&query, FindOptions::default()).await;
        }

        let id_path = self
            .id_path
            .as_deref()
            .or(self.definition().aggregate_id.as_deref());
        let id = match id_path.and_then(|p| event.get(p)).and_then(path::as_id) {
            Some(id) => id,
            None => self.collection.get_new_id().await?,
        };

        Ok(vec![self.collection.load_view_model(&id).await?])
    }

    fn notification(&self, event: &Event, identity: &EventIdentity, vm: &ViewModel) -> Notification {
        let definition = self.definition();
        Notification {
            id: Uuid::new_v4().to_string(),
            correlation_id: definition.correlation_id(event),
            action: vm.action_on_commit(),
            collection: self.collection.name().to_string(),
            payload: vm.to_json(),
            event: EventReference::from(identity),
            meta: definition.meta(event),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use denormalizer_core::ActionOnCommit;
    use denormalizer_testing::{EventBuilder, FlakyRepository, InMemoryRepository};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn users(repo: InMemoryRepository) -> Arc<Collection> {
        Arc::new(Collection::new("users", Arc::new(repo)))
    }

    fn set_email(event: &Event, vm: &mut ViewModel) -> anyhow::Result<()> {
        vm.set("email", event.get("payload.email").cloned().unwrap_or_default());
        Ok(())
    }

    #[tokio::test]
    async fn creates_view_model_and_notification() {
        let repo = InMemoryRepository::new();
        let builder = ViewBuilder::new(EventTarget::new("userCreated"), users(repo.clone()))
            .with_handler(set_email);

        let event = EventBuilder::new("userCreated")
            .aggregate("user", "u1")
            .revision(1)
            .correlation_id("cmd-1")
            .payload(json!({ "email": "jane@example.com" }))
            .build();

        let notifications = builder.denormalize(&event).await.unwrap();
        assert_eq!(notifications.len(), 1);

        let notification = &notifications[0];
        assert_eq!(notification.action, ActionOnCommit::Create);
        assert_eq!(notification.collection, "users");
        assert_eq!(notification.correlation_id.as_deref(), Some("cmd-1"));
        assert_eq!(notification.payload, json!({ "id": "u1", "email": "jane@example.com" }));
        assert_eq!(notification.event.revision, Some(1));

        let stored = repo.get_stored("u1").unwrap();
        assert_eq!(stored.get("email"), Some(&json!("jane@example.com")));
    }

    #[tokio::test]
    async fn missing_handler_is_fatal() {
        let builder = ViewBuilder::new(EventTarget::new("userCreated"), users(InMemoryRepository::new()));
        let event = EventBuilder::new("userCreated").aggregate("user", "u1").build();

        let err = builder.denormalize(&event).await.unwrap_err();
        assert!(matches!(err, DenormalizerError::MissingHandler { .. }));
    }

    #[tokio::test]
    async fn conflict_is_retried_and_applied_once() {
        let repo = InMemoryRepository::new();
        repo.insert(ViewModel::stored("u1", json!({ "logins": 0 }), 1));
        let flaky = FlakyRepository::new(repo.clone(), 1);
        let collection = Arc::new(Collection::new("users", Arc::new(flaky.clone())));

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let builder = ViewBuilder::new(EventTarget::new("loggedIn"), collection)
            .with_retry_timeout(Duration::from_millis(5))
            .with_handler(move |_, vm| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                let logins = vm.get("logins").and_then(Value::as_u64).unwrap_or(0);
                vm.set("logins", json!(logins + 1));
                Ok(())
            });

        let event = EventBuilder::new("loggedIn").aggregate("user", "u1").build();
        builder.denormalize(&event).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(flaky.failures_injected(), 1);
        assert_eq!(repo.get_stored("u1").unwrap().get("logins"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn auto_create_false_skips_unknown_view_models() {
        let repo = InMemoryRepository::new();
        let builder = ViewBuilder::new(EventTarget::new("userRenamed"), users(repo.clone()))
            .with_auto_create(false)
            .with_handler(|_, vm| {
                vm.set("renamed", json!(true));
                Ok(())
            });

        let event = EventBuilder::new("userRenamed").aggregate("user", "ghost").build();
        assert!(builder.denormalize(&event).await.unwrap().is_empty());
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn query_applies_to_every_match() {
        let repo = InMemoryRepository::new();
        repo.insert(ViewModel::stored("o1", json!({ "customer": "c1", "status": "open" }), 1));
        repo.insert(ViewModel::stored("o2", json!({ "customer": "c1", "status": "open" }), 1));
        repo.insert(ViewModel::stored("o3", json!({ "customer": "c2", "status": "open" }), 1));
        let orders = Arc::new(Collection::new("orders", Arc::new(repo.clone())));

        let builder = ViewBuilder::new(EventTarget::new("customerBlocked"), orders)
            .with_query(|event| json!({ "customer": event.get("aggregate.id").cloned().unwrap_or_default() }))
            .with_handler(|_, vm| {
                vm.set("status", json!("blocked"));
                Ok(())
            });

        let event = EventBuilder::new("customerBlocked").aggregate("customer", "c1").build();
        let notifications = builder.denormalize(&event).await.unwrap();

        assert_eq!(notifications.len(), 2);
        assert_eq!(repo.get_stored("o1").unwrap().get("status"), Some(&json!("blocked")));
        assert_eq!(repo.get_stored("o3").unwrap().get("status"), Some(&json!("open")));
    }

    #[tokio::test]
    async fn conflict_on_one_match_leaves_committed_matches_alone() {
        let repo = InMemoryRepository::new();
        repo.insert(ViewModel::stored("o1", json!({ "customer": "c1", "n": 0 }), 1));
        repo.insert(ViewModel::stored("o2", json!({ "customer": "c1", "n": 0 }), 1));
        let flaky = FlakyRepository::new(repo.clone(), 1).only_for("o2");
        let orders = Arc::new(Collection::new("orders", Arc::new(flaky.clone())));

        let builder = ViewBuilder::new(EventTarget::new("customerTouched"), orders)
            .with_retry_timeout(Duration::from_millis(5))
            .with_query(|_| json!({ "customer": "c1" }))
            .with_handler(|_, vm| {
                let n = vm.get("n").and_then(Value::as_u64).unwrap_or(0);
                vm.set("n", json!(n + 1));
                Ok(())
            });

        let event = EventBuilder::new("customerTouched").aggregate("customer", "c1").build();
        let notifications = builder.denormalize(&event).await.unwrap();

        assert_eq!(notifications.len(), 2);
        assert_eq!(flaky.failures_injected(), 1);
        assert_eq!(repo.get_stored("o1").unwrap().get("n"), Some(&json!(1)));
        assert_eq!(repo.get_stored("o2").unwrap().get("n"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn destroy_notifies_delete() {
        let repo = InMemoryRepository::new();
        repo.insert(ViewModel::stored("u1", json!({}), 1));
        let builder = ViewBuilder::new(EventTarget::new("userDeleted"), users(repo.clone()))
            .with_handler(|_, vm| {
                vm.destroy();
                Ok(())
            });

        let event = EventBuilder::new("userDeleted").aggregate("user", "u1").build();
        let notifications = builder.denormalize(&event).await.unwrap();

        assert_eq!(notifications[0].action, ActionOnCommit::Delete);
        assert!(repo.get_stored("u1").is_none());
    }

    #[tokio::test]
    async fn missing_id_allocates_new_view_model() {
        let repo = InMemoryRepository::new();
        let builder = ViewBuilder::new(EventTarget::new("noteAdded"), users(repo.clone()))
            .with_id_path("payload.noteId")
            .with_handler(|_, _| Ok(()));

        let event = EventBuilder::new("noteAdded").build();
        let notifications = builder.denormalize(&event).await.unwrap();

        assert_eq!(notifications.len(), 1);
        assert_eq!(repo.len(), 1);
    }
}
