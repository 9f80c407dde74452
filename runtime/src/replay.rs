//! Rebuilding read models from an event history.
//!
//! A replay bypasses the revision guard and the dispatcher. Events are fed in
//! their historical order and applied by a single worker, strictly one task
//! at a time, while every touched collection buffers its writes in memory.
//! Finishing the replay flushes those buffers and then records, per
//! aggregate, the next expected revision so steady-state processing resumes
//! exactly where the history ended.
//!
//! # Tasks
//!
//! For each event the matching view builders form either one task (when none
//! has a priority) or one task each (when at least one does). A task
//! pre-extends the event and denormalizes it with each of its builders.
//!
//! ```text
//!  feed ─► dedup ─► builders ─► tasks ─► [ worker: pre-extend, denormalize… ] ─┐
//!                                                                               │
//!  finish ─► wait for worker ─► flush collections ─► revisions ─► last event ◄─┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let mut stream = handler.replay_streamed();
//! for event in history {
//!     stream.feed(event);
//! }
//! let summary = stream.finish().await?;
//! println!("replayed {} events", summary.events);
//! ```

use crate::collection::Collection;
use crate::dispatch_tree::DispatchTree;
use crate::extender::PreEventExtender;
use crate::metrics::ReplayMetrics;
use crate::view_builder::ViewBuilder;
use denormalizer_core::event::{Event, EventDefinition, EventIdentity};
use denormalizer_core::revision::RevisionStore;
use denormalizer_core::{DenormalizerError, StoreError};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Counts describing a finished replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Events applied.
    pub events: usize,
    /// Events skipped because they were already fed.
    pub duplicates: usize,
    /// Tasks the worker ran.
    pub tasks: usize,
    /// Aggregates whose revision was recorded.
    pub aggregates: usize,
}

/// A replay finished with failures.
///
/// The replay does not stop at the first failure; every error is collected.
#[derive(Error, Debug)]
#[error("Replay finished with {} error(s)", .errors.len())]
pub struct ReplayError {
    /// Every failure, in the order it happened.
    pub errors: Vec<DenormalizerError>,
    /// What the replay managed to do.
    pub summary: ReplaySummary,
}

/// Entry point for replays over one dispatch tree.
#[derive(Clone)]
pub struct ReplayHandler {
    tree: Arc<DispatchTree>,
    store: Arc<dyn RevisionStore>,
    definition: EventDefinition,
    prefix: String,
}

impl std::fmt::Debug for ReplayHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayHandler")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl ReplayHandler {
    /// Create a replay handler writing revisions under `prefix`.
    #[must_use]
    pub fn new(
        tree: Arc<DispatchTree>,
        store: Arc<dyn RevisionStore>,
        definition: EventDefinition,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            tree,
            store,
            definition,
            prefix: prefix.into(),
        }
    }

    /// Replay a complete batch of events.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError`] listing every failure if anything went wrong.
    #[tracing::instrument(skip_all, fields(events = events.len()))]
    pub async fn replay(&self, events: Vec<Event>) -> Result<ReplaySummary, ReplayError> {
        let mut stream = self.replay_streamed();
        for event in events {
            stream.feed(event);
        }
        stream.finish().await
    }

    /// Start a replay fed one event at a time.
    ///
    /// # Notes
    ///
    /// - The worker is a spawned task, so this must run inside a Tokio runtime
    /// - Events are applied in feed order, one task at a time
    #[must_use]
    pub fn replay_streamed(&self) -> ReplayStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(drain(rx, Arc::clone(&pending)));

        tracing::info!(prefix = %self.prefix, "Replay started");
        ReplayStream {
            handler: self.clone(),
            started: Instant::now(),
            tx: Some(tx),
            worker: Some(worker),
            pending,
            seen: HashSet::new(),
            revisions: BTreeMap::new(),
            collections: Vec::new(),
            last_event: None,
            errors: Vec::new(),
            summary: ReplaySummary::default(),
        }
    }
}

struct ReplayTask {
    event: Event,
    identity: EventIdentity,
    pre_extender: Option<Arc<PreEventExtender>>,
    builders: Vec<Arc<ViewBuilder>>,
}

impl ReplayTask {
    async fn run(self) -> Vec<DenormalizerError> {
        let event = match &self.pre_extender {
            Some(pre_extender) => match pre_extender.extend(self.event).await {
                Ok(event) => event,
                Err(error) => return vec![error],
            },
            None => self.event,
        };

        let mut errors = Vec::new();
        for builder in &self.builders {
            if let Err(error) = builder.denormalize(&event).await {
                tracing::warn!(
                    event = %self.identity,
                    collection = builder.collection().name(),
                    error = %error,
                    "Replay denormalization failed"
                );
                errors.push(error);
            }
        }
        errors
    }
}

async fn drain(mut rx: mpsc::UnboundedReceiver<ReplayTask>, pending: Arc<AtomicUsize>) -> Vec<DenormalizerError> {
    let mut errors = Vec::new();
    while let Some(task) = rx.recv().await {
        errors.extend(task.run().await);
        pending.fetch_sub(1, Ordering::SeqCst);
    }
    errors
}

/// A replay in progress. Feed events, then [`finish`](Self::finish).
pub struct ReplayStream {
    handler: ReplayHandler,
    started: Instant,
    tx: Option<mpsc::UnboundedSender<ReplayTask>>,
    worker: Option<JoinHandle<Vec<DenormalizerError>>>,
    pending: Arc<AtomicUsize>,
    seen: HashSet<String>,
    revisions: BTreeMap<String, u64>,
    collections: Vec<Arc<Collection>>,
    last_event: Option<Event>,
    errors: Vec<DenormalizerError>,
    summary: ReplaySummary,
}

impl std::fmt::Debug for ReplayStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayStream")
            .field("pending", &self.pending())
            .field("summary", &self.summary)
            .finish_non_exhaustive()
    }
}

impl ReplayStream {
    /// Schedule one event. Unreadable events are recorded as errors.
    pub fn feed(&mut self, event: Event) {
        let identity = match self.handler.definition.identity(&event) {
            Ok(identity) => identity,
            Err(error) => {
                self.errors.push(error.into());
                return;
            }
        };

        if let Some(id) = &identity.id {
            let dedup_key = format!("{}::{id}", identity.revision_key().unwrap_or_default());
            if !self.seen.insert(dedup_key) {
                tracing::debug!(event = %identity, "Skipping duplicate event in replay");
                ReplayMetrics::record_duplicate();
                self.summary.duplicates += 1;
                return;
            }
        }

        ReplayMetrics::record_event();
        self.summary.events += 1;
        self.track_revision(&identity);
        self.last_event = Some(event.clone());

        let builders = self.handler.tree.view_builders_for(&identity);
        if builders.is_empty() {
            return;
        }
        for builder in &builders {
            self.touch(builder.collection());
        }

        let pre_extender = self.handler.tree.pre_extender_for(&identity);
        let tasks: Vec<Vec<Arc<ViewBuilder>>> = if builders.iter().any(|b| b.priority().is_some()) {
            builders.into_iter().map(|b| vec![b]).collect()
        } else {
            vec![builders]
        };

        for builders in tasks {
            self.schedule(ReplayTask {
                event: event.clone(),
                identity: identity.clone(),
                pre_extender: pre_extender.clone(),
                builders,
            });
        }
    }

    /// Tasks scheduled but not yet completed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn schedule(&mut self, task: ReplayTask) {
        let Some(tx) = &self.tx else {
            return;
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        if tx.send(task).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            self.errors
                .push(DenormalizerError::TaskFailed("replay worker stopped".to_string()));
            return;
        }
        self.summary.tasks += 1;
    }

    fn track_revision(&mut self, identity: &EventIdentity) {
        if !self.handler.definition.tracks_revisions() {
            return;
        }
        if let (Some(key), Some(revision)) = (identity.revision_key(), identity.revision) {
            let highest = self.revisions.entry(key).or_insert(revision);
            *highest = (*highest).max(revision);
        }
    }

    fn touch(&mut self, collection: &Arc<Collection>) {
        if !self.collections.iter().any(|c| Arc::ptr_eq(c, collection)) {
            collection.start_replay();
            self.collections.push(Arc::clone(collection));
        }
    }

    /// Wait for every task, flush the collections and record revisions and
    /// the last event.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError`] listing every failure if anything went wrong.
    pub async fn finish(mut self) -> Result<ReplaySummary, ReplayError> {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            match worker.await {
                Ok(errors) => self.errors.extend(errors),
                Err(join_error) => self.errors.push(DenormalizerError::TaskFailed(join_error.to_string())),
            }
        }

        for collection in &self.collections {
            self.errors.extend(collection.flush_replay().await);
        }

        let store = Arc::clone(&self.handler.store);
        let prefix = self.handler.prefix.clone();
        for (key, revision) in std::mem::take(&mut self.revisions) {
            match write_revision(store.as_ref(), &prefix, &key, revision + 1).await {
                Ok(()) => self.summary.aggregates += 1,
                Err(error) => self.errors.push(error.into()),
            }
        }

        if let Some(last_event) = &self.last_event {
            if let Err(error) = store.save_last_event(&prefix, last_event).await {
                self.errors.push(error.into());
            }
        }

        ReplayMetrics::record_finished(self.errors.len(), self.started.elapsed());
        tracing::info!(
            events = self.summary.events,
            duplicates = self.summary.duplicates,
            aggregates = self.summary.aggregates,
            errors = self.errors.len(),
            "Replay finished"
        );

        if self.errors.is_empty() {
            Ok(self.summary)
        } else {
            Err(ReplayError {
                errors: std::mem::take(&mut self.errors),
                summary: self.summary,
            })
        }
    }
}

/// Set the next expected revision of an aggregate, whatever is stored.
async fn write_revision(
    store: &dyn RevisionStore,
    prefix: &str,
    key: &str,
    next_revision: u64,
) -> Result<(), StoreError> {
    loop {
        let current = store.get(prefix, key).await?;
        let old_revision = current.as_ref().map(|entry| entry.revision);
        let data = current.and_then(|entry| entry.data);
        match store.set(prefix, key, data, next_revision, old_revision).await {
            Err(error) if error.is_concurrency_conflict() => {
                tracing::debug!(aggregate = %key, "Revision changed while replaying, retrying");
            }
            result => return result,
        }
    }
}
