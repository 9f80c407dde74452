//! Fan-out of admitted events to their view builders.
//!
//! # Lifecycle of one event
//!
//! ```text
//!  dispatch ──► no consumers? ──yes──────────────────────────┐
//!                   │                                        │
//!                   no                                       ▼
//!                   ▼                                     extend ──► EventExtended
//!    push DispatchEntry{workers = N}                         ▲
//!                   ▼                                        │
//!          pre-extend the event                              │
//!                   ▼                                        │
//!   prioritized builders, one after another                  │
//!   then unordered builders concurrently                     │
//!                   ▼                                        │
//!   each completion: decrement ── reached 0? ──yes───────────┘
//! ```
//!
//! The durable [`DispatchEntry`] is what makes fan-out survive a crash:
//! [`EventDispatcher::reset_workers`] and [`EventDispatcher::re_emit_events`]
//! pick up every entry still present on the next start. Consumers may see an
//! event twice and must be idempotent.

use crate::dispatch_tree::DispatchTree;
use crate::metrics::DispatchMetrics;
use crate::signals::SignalSender;
use crate::view_builder::ViewBuilder;
use denormalizer_core::dispatch::{DispatchEntry, DispatchQueue};
use denormalizer_core::event::{Event, EventDefinition, EventIdentity};
use denormalizer_core::{DenormalizerError, DenormalizerSignal, Result};
use futures::future::join_all;
use std::sync::Arc;
use uuid::Uuid;

/// Runs every consumer of an event and tracks completion durably.
pub struct EventDispatcher {
    tree: Arc<DispatchTree>,
    queue: Arc<dyn DispatchQueue>,
    definition: EventDefinition,
    signals: SignalSender,
}

impl EventDispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub fn new(
        tree: Arc<DispatchTree>,
        queue: Arc<dyn DispatchQueue>,
        definition: EventDefinition,
        signals: SignalSender,
    ) -> Self {
        Self {
            tree,
            queue,
            definition,
            signals,
        }
    }

    /// The routing table in use.
    #[must_use]
    pub const fn tree(&self) -> &Arc<DispatchTree> {
        &self.tree
    }

    /// Hand an admitted event to all of its consumers.
    ///
    /// Resolves once every consumer ran. Consumer failures leave the dispatch
    /// entry in place for a later [`re_emit_events`](Self::re_emit_events).
    ///
    /// # Errors
    ///
    /// Returns the first consumer error, or any dispatch queue failure.
    pub async fn dispatch(&self, event: Event) -> Result<()> {
        let identity = self.definition.identity(&event)?;
        let builders = self.tree.view_builders_for(&identity);
        DispatchMetrics::record_dispatched();

        if builders.is_empty() {
            tracing::debug!(event = %identity, "No consumers, extending immediately");
            return self.extend(event, &identity).await;
        }

        let id = identity.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        self.queue
            .push(DispatchEntry::new(id.clone(), event.clone(), builders.len()))
            .await?;

        tracing::debug!(event = %identity, workers = builders.len(), "Dispatching event");
        self.run_consumers(&id, event, &identity, &builders).await
    }

    /// Drop the dispatch entry of a stale event. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`DenormalizerError::Store`] if the queue fails.
    pub async fn discard(&self, event_id: &str) -> Result<()> {
        self.queue.remove(event_id).await?;
        Ok(())
    }

    /// Recompute `workers` of every surviving entry from the consumers
    /// registered now. Entries left without consumers are completed.
    ///
    /// Returns the number of entries still pending.
    ///
    /// # Errors
    ///
    /// Returns the first queue or extender failure.
    pub async fn reset_workers(&self) -> Result<usize> {
        let mut pending = 0;
        for entry in self.queue.get_all().await? {
            let identity = self.definition.identity(&entry.event)?;
            let workers = self.tree.consumer_count(&identity);

            if workers == 0 {
                tracing::info!(event = %identity, "Unfinished event has no consumers anymore");
                self.queue.remove(&entry.id).await?;
                self.extend(entry.event, &identity).await?;
                continue;
            }

            pending += 1;
            if workers != entry.workers {
                tracing::info!(
                    event = %identity,
                    previous = entry.workers,
                    workers,
                    "Resetting worker count"
                );
                self.queue.push(DispatchEntry { workers, ..entry }).await?;
            }
        }
        Ok(pending)
    }

    /// Re-issue denormalization for every surviving dispatch entry.
    ///
    /// Failures are logged and leave the entry for the next attempt. Returns
    /// the number of events re-issued.
    ///
    /// # Errors
    ///
    /// Returns [`DenormalizerError::Store`] if the entries cannot be listed.
    pub async fn re_emit_events(&self) -> Result<usize> {
        let entries = self.queue.get_all().await?;
        let mut reemitted = 0;

        for entry in entries {
            let identity = match self.definition.identity(&entry.event) {
                Ok(identity) => identity,
                Err(error) => {
                    tracing::error!(entry = %entry.id, error = %error, "Unreadable event in dispatch queue");
                    continue;
                }
            };
            let builders = self.tree.view_builders_for(&identity);
            if builders.is_empty() {
                continue;
            }

            reemitted += 1;
            if let Err(error) = self.run_consumers(&entry.id, entry.event, &identity, &builders).await {
                tracing::error!(event = %identity, error = %error, "Re-emitted event failed");
            }
        }

        DispatchMetrics::record_reemitted(reemitted);
        Ok(reemitted)
    }

    async fn run_consumers(
        &self,
        id: &str,
        event: Event,
        identity: &EventIdentity,
        builders: &[Arc<ViewBuilder>],
    ) -> Result<()> {
        let event = match self.tree.pre_extender_for(identity) {
            Some(pre_extender) => pre_extender.extend(event).await?,
            None => event,
        };

        let (ordered, unordered): (Vec<_>, Vec<_>) =
            builders.iter().partition(|builder| builder.priority().is_some());

        let mut results = Vec::with_capacity(builders.len());
        for builder in ordered {
            results.push(self.consume(id, &event, builder).await);
        }
        results.extend(join_all(unordered.into_iter().map(|builder| self.consume(id, &event, builder))).await);

        let mut completed = false;
        let mut first_error: Option<DenormalizerError> = None;
        for result in results {
            match result {
                Ok(removed) => completed |= removed,
                Err(error) => {
                    tracing::warn!(event = %identity, error = %error, "Consumer failed");
                    first_error.get_or_insert(error);
                }
            }
        }

        if let Some(error) = first_error {
            return Err(error);
        }
        if completed {
            self.extend(event, identity).await?;
        }
        Ok(())
    }

    async fn consume(&self, id: &str, event: &Event, builder: &ViewBuilder) -> Result<bool> {
        let notifications = builder.denormalize(event).await?;
        for notification in notifications {
            self.signals.emit(DenormalizerSignal::Notification(notification));
        }
        Ok(self.queue.decrement(id).await?)
    }

    async fn extend(&self, event: Event, identity: &EventIdentity) -> Result<()> {
        let event = match self.tree.extender_for(identity) {
            Some(extender) => extender.extend(event).await?,
            None => event,
        };

        DispatchMetrics::record_extended();
        tracing::debug!(event = %identity, "Event extended");
        self.signals.emit(DenormalizerSignal::EventExtended(event));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;
    use crate::collection::Collection;
    use crate::extender::EventExtender;
    use denormalizer_core::EventTarget;
    use denormalizer_testing::{EventBuilder, InMemoryDispatchQueue, InMemoryRepository};
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn counter_builder(event: &str, collection: &str) -> ViewBuilder {
        let collection = Arc::new(Collection::new(collection, Arc::new(InMemoryRepository::new())));
        ViewBuilder::new(EventTarget::new(event), collection).with_handler(|_, vm| {
            let seen = vm.get("seen").and_then(serde_json::Value::as_u64).unwrap_or(0);
            vm.set("seen", json!(seen + 1));
            Ok(())
        })
    }

    fn dispatcher(
        tree: DispatchTree,
        queue: &InMemoryDispatchQueue,
    ) -> (EventDispatcher, UnboundedReceiver<DenormalizerSignal>) {
        let (signals, rx) = SignalSender::channel();
        let dispatcher = EventDispatcher::new(
            Arc::new(tree),
            Arc::new(queue.clone()),
            EventDefinition::default(),
            signals,
        );
        (dispatcher, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<DenormalizerSignal>) -> Vec<DenormalizerSignal> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn event_without_consumers_is_extended_immediately() {
        let queue = InMemoryDispatchQueue::new();
        let (dispatcher, mut rx) = dispatcher(DispatchTree::default(), &queue);

        let event = EventBuilder::new("ignored").id("e1").build();
        dispatcher.dispatch(event.clone()).await.unwrap();

        assert_eq!(drain(&mut rx), vec![DenormalizerSignal::EventExtended(event)]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn fan_out_completes_after_every_consumer() {
        let queue = InMemoryDispatchQueue::new();
        let tree = DispatchTree::builder()
            .view_builder(counter_builder("a", "one").with_priority(1))
            .view_builder(counter_builder("a", "two"))
            .view_builder(counter_builder("a", "three"))
            .build();
        let (dispatcher, mut rx) = dispatcher(tree, &queue);

        let event = EventBuilder::new("a").id("e1").aggregate("agg", "x").build();
        dispatcher.dispatch(event).await.unwrap();

        let signals = drain(&mut rx);
        let notifications = signals
            .iter()
            .filter(|s| matches!(s, DenormalizerSignal::Notification(_)))
            .count();
        assert_eq!(notifications, 3);
        assert!(matches!(signals.last(), Some(DenormalizerSignal::EventExtended(_))));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn failed_consumer_keeps_entry_and_skips_extend() {
        let queue = InMemoryDispatchQueue::new();
        let broken = ViewBuilder::new(
            EventTarget::new("a"),
            Arc::new(Collection::new("broken", Arc::new(InMemoryRepository::new()))),
        );
        let tree = DispatchTree::builder()
            .view_builder(counter_builder("a", "ok"))
            .view_builder(broken)
            .build();
        let (dispatcher, mut rx) = dispatcher(tree, &queue);

        let event = EventBuilder::new("a").id("e1").aggregate("agg", "x").build();
        let err = dispatcher.dispatch(event).await.unwrap_err();

        assert!(matches!(err, DenormalizerError::MissingHandler { .. }));
        assert_eq!(queue.workers("e1"), Some(1));
        assert!(
            !drain(&mut rx)
                .iter()
                .any(|s| matches!(s, DenormalizerSignal::EventExtended(_)))
        );
    }

    #[tokio::test]
    async fn extender_output_is_published() {
        let queue = InMemoryDispatchQueue::new();
        let tree = DispatchTree::builder()
            .view_builder(counter_builder("a", "one"))
            .pre_extender(EventExtender::new(EventTarget::new("a"), |e, _| Ok(e.extended("pre", json!(true)))))
            .extender(EventExtender::new(EventTarget::new("a"), |e, _| Ok(e.extended("post", json!(true)))))
            .build();
        let (dispatcher, mut rx) = dispatcher(tree, &queue);

        dispatcher
            .dispatch(EventBuilder::new("a").id("e1").aggregate("agg", "x").build())
            .await
            .unwrap();

        let Some(DenormalizerSignal::EventExtended(extended)) = drain(&mut rx).pop() else {
            panic!("expected an extended event");
        };
        assert_eq!(extended.get("pre"), Some(&json!(true)));
        assert_eq!(extended.get("post"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn restart_recomputes_workers_and_reemits() {
        let queue = InMemoryDispatchQueue::new();
        let event = EventBuilder::new("a").id("e1").aggregate("agg", "x").build();
        queue.push(DispatchEntry::new("e1", event, 5)).await.unwrap();

        let tree = DispatchTree::builder()
            .view_builder(counter_builder("a", "one"))
            .view_builder(counter_builder("a", "two"))
            .build();
        let (dispatcher, mut rx) = dispatcher(tree, &queue);

        assert_eq!(dispatcher.reset_workers().await.unwrap(), 1);
        assert_eq!(queue.workers("e1"), Some(2));

        assert_eq!(dispatcher.re_emit_events().await.unwrap(), 1);
        assert!(queue.is_empty());
        assert!(matches!(drain(&mut rx).last(), Some(DenormalizerSignal::EventExtended(_))));
    }

    #[tokio::test]
    async fn restart_completes_entries_without_consumers() {
        let queue = InMemoryDispatchQueue::new();
        let event = EventBuilder::new("gone").id("e1").build();
        queue.push(DispatchEntry::new("e1", event.clone(), 2)).await.unwrap();

        let (dispatcher, mut rx) = dispatcher(DispatchTree::default(), &queue);
        assert_eq!(dispatcher.reset_workers().await.unwrap(), 0);
        assert!(queue.is_empty());
        assert_eq!(drain(&mut rx), vec![DenormalizerSignal::EventExtended(event)]);
    }
}
