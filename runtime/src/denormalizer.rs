//! The assembled denormalizer.
//!
//! [`Denormalizer`] wires a [`DispatchTree`] to its stores: incoming events go
//! through the [`RevisionGuard`] into the [`EventDispatcher`], history goes
//! through the [`ReplayHandler`]. Everything it emits (notifications,
//! extended events, missing-event alerts) arrives on the signal receiver
//! returned by [`DenormalizerBuilder::build`].
//!
//! ```rust,ignore
//! let (denormalizer, mut signals) = Denormalizer::builder()
//!     .config(DenormalizerConfig::from_env()?)
//!     .dispatch_tree(tree)
//!     .revision_store(Arc::new(revisions))
//!     .dispatch_queue(Arc::new(queue))
//!     .build()?;
//!
//! denormalizer.init().await?;
//! denormalizer.handle(event).await?;
//! while let Some(signal) = signals.recv().await { /* publish */ }
//! ```

use crate::dispatch_tree::{DispatchTree, DispatchTreeBuilder};
use crate::dispatcher::EventDispatcher;
use crate::replay::{ReplayError, ReplayHandler, ReplayStream, ReplaySummary};
use crate::revision_guard::{GuardOutcome, RevisionGuard};
use crate::signals::SignalSender;
use denormalizer_core::config::{ConfigError, DenormalizerConfig};
use denormalizer_core::dispatch::DispatchQueue;
use denormalizer_core::event::{Event, EventDefinition};
use denormalizer_core::revision::RevisionStore;
use denormalizer_core::{DenormalizerSignal, Result};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Event denormalizer: ordering guard, dispatcher and replay over one tree.
pub struct Denormalizer {
    config: DenormalizerConfig,
    definition: EventDefinition,
    tree: Arc<DispatchTree>,
    revision_store: Arc<dyn RevisionStore>,
    dispatcher: Arc<EventDispatcher>,
    guard: RevisionGuard,
    replay: ReplayHandler,
}

impl std::fmt::Debug for Denormalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Denormalizer")
            .field("config", &self.config)
            .field("tree", &self.tree)
            .finish_non_exhaustive()
    }
}

impl Denormalizer {
    /// Start assembling a denormalizer.
    #[must_use]
    pub fn builder() -> DenormalizerBuilder {
        DenormalizerBuilder::default()
    }

    /// Recover from a previous run.
    ///
    /// Rebuilds dispatch entries left by a crash and re-dispatches every
    /// event still waiting on consumers. Returns how many were re-dispatched.
    ///
    /// # Errors
    ///
    /// Returns error if the dispatch queue fails or a re-dispatched consumer fails.
    pub async fn init(&self) -> Result<usize> {
        let pending = self.dispatcher.reset_workers().await?;
        tracing::info!(pending, "Dispatch entries recovered");
        self.dispatcher.re_emit_events().await
    }

    /// Handle one live event.
    ///
    /// # Errors
    ///
    /// See [`RevisionGuard::guard`].
    pub async fn handle(&self, event: Event) -> Result<GuardOutcome> {
        self.guard.guard(event).await
    }

    /// Replay a batch of historical events.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError`] listing every failure if anything went wrong.
    pub async fn replay(&self, events: Vec<Event>) -> std::result::Result<ReplaySummary, ReplayError> {
        self.replay.replay(events).await
    }

    /// Start a replay fed one event at a time.
    #[must_use]
    pub fn replay_streamed(&self) -> ReplayStream {
        self.replay.replay_streamed()
    }

    /// Wipe every collection and all revision state.
    ///
    /// # Errors
    ///
    /// Returns the first repository or revision store failure.
    pub async fn clear(&self) -> Result<()> {
        for collection in self.tree.collections() {
            collection.clear().await?;
        }
        self.revision_store
            .clear(&self.config.revision_guard.prefix)
            .await?;
        tracing::info!("Denormalizer state cleared");
        Ok(())
    }

    /// The last event recorded by the guard or a replay.
    ///
    /// # Errors
    ///
    /// Returns error if the revision store fails.
    pub async fn last_event(&self) -> Result<Option<Event>> {
        Ok(self
            .revision_store
            .get_last_event(&self.config.revision_guard.prefix)
            .await?)
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &DenormalizerConfig {
        &self.config
    }

    /// Event definition shared by every component.
    #[must_use]
    pub const fn definition(&self) -> &EventDefinition {
        &self.definition
    }

    /// The routing table.
    #[must_use]
    pub const fn tree(&self) -> &Arc<DispatchTree> {
        &self.tree
    }

    /// The ordering guard.
    #[must_use]
    pub const fn guard(&self) -> &RevisionGuard {
        &self.guard
    }

    /// The dispatcher behind the guard.
    #[must_use]
    pub const fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }
}

/// Builder for [`Denormalizer`].
#[derive(Default)]
pub struct DenormalizerBuilder {
    config: DenormalizerConfig,
    definition: EventDefinition,
    tree: DispatchTreeBuilder,
    revision_store: Option<Arc<dyn RevisionStore>>,
    dispatch_queue: Option<Arc<dyn DispatchQueue>>,
}

impl std::fmt::Debug for DenormalizerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DenormalizerBuilder")
            .field("config", &self.config)
            .field("tree", &self.tree)
            .field("revision_store", &self.revision_store.is_some())
            .field("dispatch_queue", &self.dispatch_queue.is_some())
            .finish_non_exhaustive()
    }
}

impl DenormalizerBuilder {
    /// Use this configuration instead of the defaults.
    #[must_use]
    pub fn config(mut self, config: DenormalizerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use this event layout instead of the default one.
    #[must_use]
    pub fn definition(mut self, definition: EventDefinition) -> Self {
        self.definition = definition;
        self
    }

    /// View builders, extenders and collections to drive.
    #[must_use]
    pub fn dispatch_tree(mut self, tree: DispatchTreeBuilder) -> Self {
        self.tree = tree;
        self
    }

    /// Where revisions and the last event are kept. Required.
    #[must_use]
    pub fn revision_store(mut self, store: Arc<dyn RevisionStore>) -> Self {
        self.revision_store = Some(store);
        self
    }

    /// Where dispatch entries are kept. Required.
    #[must_use]
    pub fn dispatch_queue(mut self, queue: Arc<dyn DispatchQueue>) -> Self {
        self.dispatch_queue = Some(queue);
        self
    }

    /// Validate and assemble.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if the configuration is
    /// invalid or a required store is missing.
    pub fn build(self) -> std::result::Result<(Denormalizer, mpsc::UnboundedReceiver<DenormalizerSignal>), ConfigError> {
        self.config.validate()?;
        let revision_store = self
            .revision_store
            .ok_or_else(|| ConfigError::ValidationError("a revision store is required".to_string()))?;
        let dispatch_queue = self
            .dispatch_queue
            .ok_or_else(|| ConfigError::ValidationError("a dispatch queue is required".to_string()))?;

        let tree = Arc::new(
            self.tree
                .definition(self.definition.clone())
                .retry_timeout(self.config.view_builder.retry_timeout)
                .build(),
        );
        if let Some(batch_size) = self.config.replay.batch_size {
            for collection in tree.collections() {
                collection.set_batch_size(Some(batch_size));
            }
        }

        let (signals, receiver) = SignalSender::channel();
        let dispatcher = Arc::new(EventDispatcher::new(
            Arc::clone(&tree),
            dispatch_queue,
            self.definition.clone(),
            signals.clone(),
        ));
        let guard = RevisionGuard::new(
            Arc::clone(&revision_store),
            Arc::clone(&dispatcher),
            self.definition.clone(),
            self.config.revision_guard.clone(),
            signals,
        );
        let replay = ReplayHandler::new(
            Arc::clone(&tree),
            Arc::clone(&revision_store),
            self.definition.clone(),
            self.config.revision_guard.prefix.clone(),
        );

        tracing::info!(
            collections = tree.collections().len(),
            prefix = %self.config.revision_guard.prefix,
            "Denormalizer assembled"
        );

        Ok((
            Denormalizer {
                config: self.config,
                definition: self.definition,
                tree,
                revision_store,
                dispatcher,
                guard,
                replay,
            },
            receiver,
        ))
    }
}
